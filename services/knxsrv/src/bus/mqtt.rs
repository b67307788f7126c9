//! MQTT message bus (rumqttc)

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BusMessage, LastWill, MessageBus, Subscriptions};
use crate::config::BusConfig;
use crate::error::{KnxSrvError, Result};

const REQUEST_CAPACITY: usize = 64;
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

pub struct MqttBus {
    client: AsyncClient,
    qos: QoS,
    connected: Arc<AtomicBool>,
    subscriptions: Arc<Subscriptions>,
    cancel: CancellationToken,
    event_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Create the client and start its event loop
    ///
    /// The broker connection is made asynchronously; `is_connected` turns true
    /// on the first CONNACK. Subscriptions are re-sent after every reconnect.
    pub fn connect(config: &BusConfig, will: Option<LastWill>) -> Result<Self> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }
        let qos = qos_from(config.qos);
        if let Some(will) = will {
            options.set_last_will(rumqttc::LastWill::new(will.topic, will.payload, qos, true));
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let subscriptions = Arc::new(Subscriptions::default());
        let cancel = CancellationToken::new();

        let task = {
            let client = client.clone();
            let connected = connected.clone();
            let subscriptions = subscriptions.clone();
            let cancel = cancel.clone();
            let broker = format!("{}:{}", config.host, config.port);
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = eventloop.poll() => event,
                    };
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            connected.store(true, Ordering::SeqCst);
                            info!("[OK] MQTT connected: {}", broker);
                            for filter in subscriptions.filters() {
                                if let Err(e) = client.try_subscribe(filter.as_str(), qos) {
                                    warn!("MQTT resubscribe {} failed: {}", filter, e);
                                }
                            }
                        },
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let message = BusMessage {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                                retain: publish.retain,
                            };
                            subscriptions.dispatch(&message);
                        },
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            connected.store(false, Ordering::SeqCst);
                        },
                        Ok(other) => debug!("MQTT event: {:?}", other),
                        Err(e) => {
                            if connected.swap(false, Ordering::SeqCst) {
                                error!("[FAIL] MQTT connection lost: {}", e);
                            } else {
                                debug!("MQTT connect to {} failed: {}", broker, e);
                            }
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(RECONNECT_PAUSE) => {},
                            }
                        },
                    }
                }
                debug!("MQTT event loop stopped");
            })
        };

        info!("MQTT client {} -> {}:{}", config.client_id, config.host, config.port);
        Ok(Self {
            client,
            qos,
            connected,
            subscriptions,
            cancel,
            event_loop: parking_lot::Mutex::new(Some(task)),
        })
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        if !self.is_connected() {
            return Err(KnxSrvError::bus("MQTT not connected"));
        }
        self.client
            .publish(topic, self.qos, retain, payload.to_vec())
            .await?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<BusMessage>> {
        let rx = self.subscriptions.add(filter);
        // Before the first CONNACK the event loop subscribes on connect
        if self.is_connected() {
            self.client.subscribe(filter, self.qos).await?;
        }
        debug!("MQTT subscribed: {}", filter);
        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.is_connected() {
            if let Err(e) = self.client.disconnect().await {
                warn!("MQTT disconnect: {}", e);
            }
            // Let the event loop flush DISCONNECT
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        let task = self.event_loop.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("MQTT closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(1), QoS::AtLeastOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
        assert_eq!(qos_from(9), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_not_connected() {
        let config = BusConfig {
            host: "127.0.0.1".into(),
            port: 1,
            ..Default::default()
        };
        let bus = MqttBus::connect(&config, None).unwrap();
        assert!(!bus.is_connected());
        assert!(bus.publish("health/knx", b"{}", true).await.is_err());
        let _rx = bus.subscribe("command/knx/#").await.unwrap();
        bus.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires MQTT broker on localhost:1883
    async fn test_round_trip_through_broker() {
        let bus = MqttBus::connect(&BusConfig::default(), None).unwrap();
        let mut rx = bus.subscribe("knxsrv-test/#").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        bus.publish("knxsrv-test/a", b"hello", false).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, b"hello");
        bus.close().await.unwrap();
    }
}
