//! Message bus abstraction
//!
//! Topic filters use MQTT syntax everywhere: `+` matches one level, a trailing
//! `#` matches any number of levels (including none). Each `subscribe` call
//! gets its own receiver; adapters fan incoming messages out to every
//! subscription whose filter matches.

pub mod memory;
pub mod mqtt;
pub mod redis;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::{BusConfig, BusKind};
use crate::error::Result;

pub use memory::MemoryBus;
pub use mqtt::MqttBus;
pub use redis::RedisBus;

/// Per-subscription queue depth
pub const SUBSCRIPTION_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    pub fn payload_str(&self) -> std::result::Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }
}

/// Message published by the broker when the connection drops uncleanly
#[derive(Debug, Clone)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<BusMessage>>;

    fn is_connected(&self) -> bool;

    /// Orderly disconnect; a last will is not triggered
    async fn close(&self) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// MQTT-style topic filter match
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {},
            (Some(f), Some(t)) if f == t => {},
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscription {
    filter: String,
    tx: mpsc::Sender<BusMessage>,
}

/// Fan-out table shared by the adapters
#[derive(Default)]
pub(crate) struct Subscriptions {
    entries: Mutex<Vec<Subscription>>,
}

impl Subscriptions {
    pub(crate) fn add(&self, filter: &str) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.entries.lock().push(Subscription {
            filter: filter.to_string(),
            tx,
        });
        rx
    }

    /// Distinct filters with a live receiver
    pub(crate) fn filters(&self) -> Vec<String> {
        let mut entries = self.entries.lock();
        entries.retain(|s| !s.tx.is_closed());
        let mut filters: Vec<String> = entries.iter().map(|s| s.filter.clone()).collect();
        filters.sort();
        filters.dedup();
        filters
    }

    /// Deliver to every matching subscription; full queues drop the message
    pub(crate) fn dispatch(&self, message: &BusMessage) -> usize {
        let mut delivered = 0;
        let mut entries = self.entries.lock();
        entries.retain(|s| !s.tx.is_closed());
        for sub in entries.iter() {
            if !topic_matches(&sub.filter, &message.topic) {
                continue;
            }
            match sub.tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Subscription {} full, dropping {}", sub.filter, message.topic)
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {},
            }
        }
        delivered
    }

    /// Deliver only to the newest subscription (retained replay)
    pub(crate) fn dispatch_to_last(&self, message: &BusMessage) {
        let entries = self.entries.lock();
        if let Some(sub) = entries.last() {
            if topic_matches(&sub.filter, &message.topic) {
                let _ = sub.tx.try_send(message.clone());
            }
        }
    }
}

/// Build the configured bus adapter
pub async fn connect_bus(config: &BusConfig, will: Option<LastWill>) -> Result<Arc<dyn MessageBus>> {
    let bus: Arc<dyn MessageBus> = match config.kind {
        BusKind::Mqtt => Arc::new(MqttBus::connect(config, will)?),
        BusKind::Redis => Arc::new(RedisBus::connect(&config.redis_url).await?),
        BusKind::Memory => Arc::new(MemoryBus::new()),
    };
    Ok(bus)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("command/knx/#", "command/knx/1%2F2%2F3"));
        assert!(topic_matches("command/knx/#", "command/knx"));
        assert!(topic_matches("state/+/1", "state/knx/1"));
        assert!(topic_matches("health/knx", "health/knx"));
        assert!(!topic_matches("state/+", "state/knx/1"));
        assert!(!topic_matches("command/knx/#", "state/knx/1"));
        assert!(!topic_matches("health/knx", "health/knx/extra"));
    }

    #[tokio::test]
    async fn test_dispatch_fans_out_and_prunes_closed() {
        let subs = Subscriptions::default();
        let mut all = subs.add("#");
        let mut commands = subs.add("command/#");
        let dropped = subs.add("command/#");
        drop(dropped);

        let delivered = subs.dispatch(&BusMessage::new("command/knx/1", b"x".to_vec()));
        assert_eq!(delivered, 2);
        assert_eq!(all.recv().await.unwrap().topic, "command/knx/1");
        assert_eq!(commands.recv().await.unwrap().payload, b"x");
        assert_eq!(subs.filters(), vec!["#", "command/#"]);
    }
}
