//! Redis pub/sub message bus

use async_trait::async_trait;
use common::redis::RedisClient;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{topic_matches, BusMessage, MessageBus, SUBSCRIPTION_CAPACITY};
use crate::error::{ErrorExt, KnxSrvError, Result};

/// Redis adapter
///
/// Publishes go through the pooled client. Retained publishes also store the
/// payload under the topic key in the same transaction so late readers can GET
/// the last value. Every
/// subscription runs on its own pub/sub connection.
pub struct RedisBus {
    client: RedisClient,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// MQTT filter to Redis glob: `+` and `#` both become `*`
///
/// The glob is wider than the filter; messages are re-checked with
/// [`topic_matches`] before delivery.
pub fn filter_to_pattern(filter: &str) -> String {
    filter
        .split('/')
        .map(|level| match level {
            "+" | "#" => "*",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("/")
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = RedisClient::new(url)
            .await
            .connection_error("Redis bus connect")?;
        info!("[OK] Redis bus connected: {}", url);
        Ok(Self {
            client,
            connected: Arc::new(AtomicBool::new(true)),
            cancel: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        let text = String::from_utf8_lossy(payload);
        let result = if retain {
            self.client.publish_retained(topic, &text).await
        } else {
            self.client.publish(topic, &text).await
        };
        self.connected.store(result.is_ok(), Ordering::SeqCst);
        result
            .map(|_| ())
            .map_err(|e| KnxSrvError::bus(format!("{e:#}")))
    }

    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<BusMessage>> {
        let mut pubsub = self.client.pubsub().await?;
        let pattern = filter_to_pattern(filter);
        pubsub.psubscribe(&pattern).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let filter = filter.to_string();
        let cancel = self.cancel.clone();
        let connected = self.connected.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = stream.next() => msg,
                };
                let Some(msg) = msg else {
                    warn!("Redis subscription {} closed", filter);
                    connected.store(false, Ordering::SeqCst);
                    break;
                };
                let topic = msg.get_channel_name().to_string();
                if !topic_matches(&filter, &topic) {
                    continue;
                }
                let message = BusMessage {
                    topic,
                    payload: msg.get_payload_bytes().to_vec(),
                    retain: false,
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            debug!("Redis subscription {} stopped", filter);
        });
        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
