//! In-process message bus

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use super::{topic_matches, BusMessage, MessageBus, Subscriptions};
use crate::error::{KnxSrvError, Result};

/// Loopback bus: every publish is delivered to matching local subscribers
///
/// Retained messages are replayed to new subscriptions like a broker would.
/// The publish log is kept for inspection.
pub struct MemoryBus {
    subscriptions: Subscriptions,
    retained: Mutex<BTreeMap<String, BusMessage>>,
    log: Mutex<Vec<BusMessage>>,
    connected: AtomicBool,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            subscriptions: Subscriptions::default(),
            retained: Mutex::new(BTreeMap::new()),
            log: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Everything published so far, oldest first
    pub fn published(&self) -> Vec<BusMessage> {
        self.log.lock().clone()
    }

    /// Published messages whose topic matches `filter`
    pub fn published_on(&self, filter: &str) -> Vec<BusMessage> {
        self.log
            .lock()
            .iter()
            .filter(|m| topic_matches(filter, &m.topic))
            .cloned()
            .collect()
    }

    pub fn retained(&self, topic: &str) -> Option<BusMessage> {
        self.retained.lock().get(topic).cloned()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        if !self.is_connected() {
            return Err(KnxSrvError::bus("memory bus disconnected"));
        }
        let message = BusMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        };
        if retain {
            let mut retained = self.retained.lock();
            // Empty retained payload clears the topic
            if payload.is_empty() {
                retained.remove(topic);
            } else {
                retained.insert(topic.to_string(), message.clone());
            }
        }
        self.log.lock().push(message.clone());
        self.subscriptions.dispatch(&message);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<BusMessage>> {
        let rx = self.subscriptions.add(filter);
        let replay: Vec<BusMessage> = self
            .retained
            .lock()
            .values()
            .filter(|m| topic_matches(filter, &m.topic))
            .cloned()
            .collect();
        for message in &replay {
            self.subscriptions.dispatch_to_last(message);
        }
        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.set_connected(false);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
