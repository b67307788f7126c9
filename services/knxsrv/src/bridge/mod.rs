//! Bridge orchestrator
//!
//! Bus → registry: each inbound telegram is recorded for discovery, resolved
//! through the reverse address index, decoded with the function's DPT,
//! merged into the registry and published on `state/knx/{ga}`.
//!
//! Registry ← commands: `command/knx/#` messages are resolved through the
//! forward index, checked against the function's flags, encoded and sent to
//! knxd. Every command gets an ack on `ack/knx/{ga}`.
//!
//! Telegrams are consumed by a single task, so state for any one device is
//! applied in bus arrival order.

pub mod commands;
pub mod discovery;
pub mod health;
pub mod index;
pub mod link;
pub mod messages;
pub mod topics;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use voltage_knx::{
    decode_value, normalize_channel_function, state_key_for_function, Apci, CanonicalFunction,
    DptValue, GroupAddress, Telegram,
};

use crate::bus::{BusMessage, MessageBus};
use crate::config::ServiceConfig;
use crate::daemon::DaemonHandle;
use crate::error::{KnxSrvError, Result};
use crate::registry::{DeviceRegistry, HealthStatus, RegistryEvent, PROTOCOL_KNX};

pub use commands::{plan_write, PlannedWrite};
pub use discovery::GroupAddressRecorder;
pub use health::{BridgeCounters, HealthReporter};
pub use index::{AddressIndex, Binding, DeviceFunctions};
pub use link::{ConnectionSupervisor, KnxLink, LinkEvent};
pub use messages::*;
pub use topics::{TopicKind, Topics};

/// Send timeout applied to a single command write
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a `read_all` request
pub const READ_ALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub bridge_id: String,
    pub topic_prefix: String,
    pub health_interval: Duration,
    /// `None` disables the periodic discovery publish
    pub discovery_interval: Option<Duration>,
    pub read_on_startup: bool,
    pub read_spacing: Duration,
    pub command_timeout: Duration,
    pub read_all_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default())
    }
}

impl BridgeOptions {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            bridge_id: config.bridge_id.clone(),
            topic_prefix: config.topic_prefix.clone(),
            health_interval: config.health_interval(),
            discovery_interval: (config.discovery_interval_secs > 0)
                .then(|| Duration::from_secs(config.discovery_interval_secs)),
            read_on_startup: config.read_on_startup,
            read_spacing: config.read_spacing(),
            command_timeout: COMMAND_TIMEOUT,
            read_all_timeout: READ_ALL_TIMEOUT,
        }
    }
}

pub struct Bridge {
    options: BridgeOptions,
    topics: Topics,
    registry: Arc<DeviceRegistry>,
    bus: Arc<dyn MessageBus>,
    link: Arc<KnxLink>,
    index: AddressIndex,
    recorder: Arc<GroupAddressRecorder>,
    /// Last published value per (device, state field)
    last_values: Mutex<HashMap<(String, String), Value>>,
    health: HealthReporter,
    counters: Arc<BridgeCounters>,
    startup_read_done: AtomicBool,
}

impl Bridge {
    pub fn new(
        options: BridgeOptions,
        registry: Arc<DeviceRegistry>,
        bus: Arc<dyn MessageBus>,
        link: Arc<KnxLink>,
        daemon: Option<DaemonHandle>,
    ) -> Self {
        let topics = Topics::new(&options.topic_prefix);
        let counters = Arc::new(BridgeCounters::default());
        let health = HealthReporter::new(
            options.bridge_id.clone(),
            topics.clone(),
            bus.clone(),
            link.clone(),
            daemon,
            counters.clone(),
        );
        Self {
            options,
            topics,
            registry,
            bus,
            link,
            index: AddressIndex::new(),
            recorder: Arc::new(GroupAddressRecorder::new()),
            last_values: Mutex::new(HashMap::new()),
            health,
            counters,
            startup_read_done: AtomicBool::new(false),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn index(&self) -> &AddressIndex {
        &self.index
    }

    pub fn health(&self) -> &HealthReporter {
        &self.health
    }

    /// Discovery recorder; also the daemon manager's health-check address source
    pub fn recorder(&self) -> Arc<GroupAddressRecorder> {
        self.recorder.clone()
    }

    /// Rebuild the address indices from the registry's KNX devices
    pub fn reload_devices(&self) -> usize {
        let devices = self.registry.by_protocol(PROTOCOL_KNX);
        let count = self.index.rebuild(&devices);
        self.last_values
            .lock()
            .retain(|(device_id, _), _| self.index.device(device_id).is_some());
        self.health.set_device_count(count);
        info!(
            "Address index rebuilt: {} devices, {} group addresses",
            count,
            self.index.address_count()
        );
        count
    }

    // ========================================================================
    // Bus → state
    // ========================================================================

    /// Process one inbound telegram; returns the number of state messages published
    pub async fn handle_telegram(&self, telegram: &Telegram) -> usize {
        self.recorder.record(telegram);
        if telegram.apci == Apci::Read {
            return 0;
        }

        let ga = telegram.destination;
        let bindings = self.index.lookup(ga);
        if bindings.is_empty() {
            debug!("Unmodeled group address {} from {}", ga, telegram.source);
            return 0;
        }
        // Bindings sharing an address share its encoding; any declared DPT will do
        let Some(dpt) = bindings.iter().find_map(|b| b.dpt) else {
            warn!("No DPT for {} on any of {} bindings", ga, bindings.len());
            return 0;
        };

        let value = match decode_value(dpt, &telegram.payload.data()) {
            Ok(value) => value,
            Err(e) => {
                warn!("Decode {} as {} failed: {}", ga, dpt, e);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                DptValue::Invalid
            },
        };
        if value.is_invalid() {
            warn!("Invalid value on {} ({})", ga, dpt);
        }
        let json = value.to_json();

        let mut published = 0;
        for binding in &bindings {
            let state_key = state_key_for_function(&binding.function);
            let cache_key = (binding.device_id.clone(), state_key.clone());
            {
                let mut last = self.last_values.lock();
                if last.get(&cache_key) == Some(&json) {
                    debug!("{} {} unchanged", binding.device_id, state_key);
                    continue;
                }
                last.insert(cache_key, json.clone());
            }

            let mut delta = Map::new();
            delta.insert(state_key, json.clone());
            let is_presence = normalize_channel_function(&binding.function)
                .is_some_and(|cf| cf.function == CanonicalFunction::Presence);
            if is_presence && json == Value::Bool(true) {
                delta.insert(
                    "last_motion".to_string(),
                    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
                );
            }

            if let Err(e) = self.registry.update_state(&binding.device_id, delta.clone()).await {
                debug!("State for {} not merged: {}", binding.device_id, e);
            }
            if let Err(e) = self
                .registry
                .set_health(&binding.device_id, HealthStatus::Online)
                .await
            {
                debug!("Health for {} not recorded: {}", binding.device_id, e);
            }

            let message = StateMessage::new(binding.device_id.clone(), ga.to_string(), delta);
            match self.publish_json(&self.topics.state(ga), &message, true).await {
                Ok(()) => published += 1,
                Err(e) => {
                    warn!("State publish for {} failed: {}", binding.device_id, e);
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                },
            }
        }
        published
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Resolve and validate a command; no I/O
    pub fn prepare_command(&self, cmd: &CommandMessage) -> Result<PlannedWrite> {
        let device = self
            .index
            .device(&cmd.device_id)
            .ok_or_else(|| KnxSrvError::device_not_found(&cmd.device_id))?;
        plan_write(cmd, &device)
    }

    /// Send a prepared write to knxd
    pub async fn send_write(&self, plan: &PlannedWrite) -> Result<()> {
        tokio::time::timeout(self.options.command_timeout, self.link.send(plan.telegram()))
            .await
            .map_err(|_| {
                KnxSrvError::Timeout(format!("write to {} timed out", plan.ga))
            })??;
        if plan.confirmation == Confirmation::Unverified {
            info!(
                "{}.{} -> {}: delivered, unverified (no status address)",
                plan.device_id, plan.function, plan.ga
            );
        } else {
            debug!("{}.{} -> {} = {}", plan.device_id, plan.function, plan.ga, plan.value);
        }
        Ok(())
    }

    /// Prepare and send; rejected commands never reach the bus
    pub async fn execute_command(&self, cmd: &CommandMessage) -> Result<PlannedWrite> {
        let plan = self.prepare_command(cmd)?;
        self.send_write(&plan).await?;
        Ok(plan)
    }

    async fn handle_command_message(&self, message: &BusMessage) {
        let segment = match self.topics.parse(&message.topic) {
            Some((TopicKind::Command, segment)) => segment.to_string(),
            _ => return,
        };
        let cmd: CommandMessage = match serde_json::from_slice(&message.payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("Malformed command on {}: {}", message.topic, e);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return;
            },
        };
        info!("Command {} '{}' for {}", cmd.id, cmd.command, cmd.device_id);

        let plan = match self.prepare_command(&cmd) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Command {} rejected: {}", cmd.id, e);
                self.fail_command(&cmd, &segment, &e).await;
                return;
            },
        };

        if let Err(e) = self.check_topic_address(&segment, &plan) {
            warn!("Command {} rejected: {}", cmd.id, e);
            self.fail_command(&cmd, &segment, &e).await;
            return;
        }

        let ack = AckMessage::accepted(&cmd, plan.ga.to_string(), plan.confirmation);
        self.publish_ack(&segment, &ack).await;

        match self.send_write(&plan).await {
            Ok(()) => {
                self.counters
                    .commands_processed
                    .fetch_add(1, Ordering::Relaxed);
            },
            Err(e) => {
                error!("Command {} to {} failed: {}", cmd.id, plan.ga, e);
                // Anything that fails after acceptance is reported as unreachable
                let e = if matches!(
                    e,
                    KnxSrvError::NotConnected | KnxSrvError::Connection(_) | KnxSrvError::Timeout(_)
                ) {
                    e
                } else {
                    KnxSrvError::connection(e.to_string())
                };
                self.fail_command(&cmd, &segment, &e).await;
            },
        }
    }

    /// A command topic naming an address must name one of the target device's
    ///
    /// High-level commands may resolve to a sibling address of the same device
    /// (`dim` falling back to `switch`); that is allowed and logged.
    fn check_topic_address(&self, segment: &str, plan: &PlannedWrite) -> Result<()> {
        let Ok(topic_ga) = GroupAddress::from_topic(segment) else {
            return Ok(());
        };
        if topic_ga == plan.ga {
            return Ok(());
        }
        let owned = self
            .index
            .device(&plan.device_id)
            .is_some_and(|d| d.functions.values().any(|f| f.ga == topic_ga));
        if !owned {
            return Err(KnxSrvError::invalid_command(format!(
                "address {} in topic does not belong to device {}",
                topic_ga, plan.device_id
            )));
        }
        warn!(
            "Command on {} for {} writes {} ({})",
            topic_ga, plan.device_id, plan.ga, plan.function
        );
        Ok(())
    }

    async fn fail_command(&self, cmd: &CommandMessage, segment: &str, err: &KnxSrvError) {
        self.counters.commands_failed.fetch_add(1, Ordering::Relaxed);
        let address = GroupAddress::from_topic(segment)
            .map(|ga| ga.to_string())
            .unwrap_or_default();
        let ack = AckMessage::failed(cmd, address, error_code(err), err.to_string());
        self.publish_ack(segment, &ack).await;
    }

    async fn publish_ack(&self, segment: &str, ack: &AckMessage) {
        if let Err(e) = self.publish_json(&self.topics.ack(segment), ack, false).await {
            warn!("Ack for {} not published: {}", ack.command_id, e);
        }
    }

    // ========================================================================
    // Reads and requests
    // ========================================================================

    async fn send_reads(&self, addresses: &[GroupAddress], cancel: &CancellationToken) -> Result<usize> {
        let mut sent = 0;
        for (i, ga) in addresses.iter().enumerate() {
            if i > 0 && !self.options.read_spacing.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.options.read_spacing) => {},
                }
            }
            match self.link.send(Telegram::read(*ga)).await {
                Ok(()) => sent += 1,
                Err(KnxSrvError::NotConnected) => return Err(KnxSrvError::NotConnected),
                Err(e) => warn!("Read {} failed: {}", ga, e),
            }
        }
        Ok(sent)
    }

    /// Request the current value of every readable function of one device
    pub async fn read_device(&self, device_id: &str) -> Result<usize> {
        let device = self
            .index
            .device(device_id)
            .ok_or_else(|| KnxSrvError::device_not_found(device_id))?;
        let mut addresses: Vec<GroupAddress> = device
            .functions
            .values()
            .filter(|f| f.is_readable())
            .map(|f| f.ga)
            .collect();
        addresses.sort();
        addresses.dedup();
        self.send_reads(&addresses, &CancellationToken::new()).await
    }

    /// Read every readable address, skipping infrastructure devices
    pub async fn read_all(&self, cancel: &CancellationToken) -> Result<usize> {
        let addresses = self.index.readable_addresses(true);
        info!("Reading {} group addresses", addresses.len());
        let sent = self.send_reads(&addresses, cancel).await?;
        info!("Read requests sent: {}", sent);
        Ok(sent)
    }

    pub async fn handle_request(&self, request: &RequestMessage) -> ResponseMessage {
        let id = request.request_id.as_str();
        match request.action.as_str() {
            "read_state" => {
                let Some(device_id) = request.device_id.as_deref() else {
                    return ResponseMessage::error(id, INVALID_PARAMETERS, "device_id is required");
                };
                match self.read_device(device_id).await {
                    Ok(sent) => {
                        let mut data = Map::new();
                        data.insert(
                            "message".into(),
                            Value::from("read requests sent, state updates will follow"),
                        );
                        data.insert("reads_sent".into(), Value::from(sent));
                        ResponseMessage::ok(id, data)
                    },
                    Err(e) => ResponseMessage::error(id, error_code(&e), e.to_string()),
                }
            },
            "read_all" => {
                let cancel = CancellationToken::new();
                match tokio::time::timeout(self.options.read_all_timeout, self.read_all(&cancel))
                    .await
                {
                    Ok(Ok(sent)) => {
                        let mut data = Map::new();
                        data.insert("reads_sent".into(), Value::from(sent));
                        ResponseMessage::ok(id, data)
                    },
                    Ok(Err(e)) => ResponseMessage::error(id, error_code(&e), e.to_string()),
                    Err(_) => {
                        cancel.cancel();
                        ResponseMessage::error(id, TIMEOUT, "read_all timed out")
                    },
                }
            },
            other => ResponseMessage::error(id, INVALID_COMMAND, format!("unknown action '{}'", other)),
        }
    }

    async fn handle_request_message(&self, message: &BusMessage) {
        let request: RequestMessage = match serde_json::from_slice(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed request on {}: {}", message.topic, e);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return;
            },
        };
        debug!("Request {} '{}'", request.request_id, request.action);
        let response = self.handle_request(&request).await;
        let topic = self.topics.response(&request.request_id);
        if let Err(e) = self.publish_json(&topic, &response, false).await {
            warn!("Response {} not published: {}", request.request_id, e);
        }
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Publish observed addresses that no device models yet
    pub async fn publish_discovery(&self) -> Result<usize> {
        let group_addresses: Vec<ObservedAddress> = self
            .recorder
            .addresses(|ga| self.index.is_modeled(ga))
            .into_iter()
            .filter(|a| !a.modeled)
            .collect();
        let count = group_addresses.len();
        let message = DiscoveryMessage {
            bridge: self.options.bridge_id.clone(),
            timestamp: Utc::now(),
            group_addresses,
            devices: self.recorder.devices(),
        };
        self.publish_json(&self.topics.discovery(), &message, true).await?;
        debug!("Discovery published: {} unmodeled addresses", count);
        Ok(count)
    }

    async fn publish_json<T: serde::Serialize>(&self, topic: &str, value: &T, retain: bool) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.bus.publish(topic, &payload, retain).await
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    /// Consume link events, commands and requests until `cancel` fires
    ///
    /// Publishes `starting` first and `stopping` last. Telegrams still queued
    /// at cancellation are dropped.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<LinkEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut commands = self.bus.subscribe(&self.topics.command_filter()).await?;
        let mut requests = self.bus.subscribe(&self.topics.request_filter()).await?;
        let mut registry_events = self.registry.subscribe();

        self.reload_devices();
        if let Err(e) = self.health.publish(BridgeStatus::Starting, None).await {
            warn!("Health publish failed: {}", e);
        }

        let health_task = {
            let bridge = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                bridge
                    .health
                    .run(bridge.options.health_interval, cancel)
                    .await
            })
        };

        let mut discovery = self.options.discovery_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker
        });

        info!("[OK] Bridge {} running", self.options.bridge_id);
        loop {
            let discovery_tick = async {
                match discovery.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    },
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(event) = events.recv() => self.handle_link_event(event, &cancel).await,
                Some(message) = commands.recv() => self.handle_command_message(&message).await,
                Some(message) = requests.recv() => self.handle_request_message(&message).await,
                result = registry_events.recv() => match result {
                    Ok(RegistryEvent::Added(_))
                    | Ok(RegistryEvent::Updated(_))
                    | Ok(RegistryEvent::Removed(_))
                    | Ok(RegistryEvent::Reloaded { .. }) => {
                        self.reload_devices();
                    },
                    Ok(_) => {},
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Registry events lagged by {}, rebuilding index", skipped);
                        self.reload_devices();
                    },
                    Err(broadcast::error::RecvError::Closed) => {},
                },
                _ = discovery_tick => {
                    if let Err(e) = self.publish_discovery().await {
                        warn!("Discovery publish failed: {}", e);
                    }
                },
            }
        }

        let _ = health_task.await;
        if let Err(e) = self.health.publish(BridgeStatus::Stopping, None).await {
            warn!("Health publish failed: {}", e);
        }
        info!("Bridge {} stopped", self.options.bridge_id);
        Ok(())
    }

    async fn handle_link_event(self: &Arc<Self>, event: LinkEvent, cancel: &CancellationToken) {
        match event {
            LinkEvent::Telegram(telegram) => {
                self.handle_telegram(&telegram).await;
            },
            LinkEvent::Connected => {
                info!("knxd link up");
                if let Err(e) = self.health.publish_current().await {
                    warn!("Health publish failed: {}", e);
                }
                if self.options.read_on_startup && !self.startup_read_done.swap(true, Ordering::SeqCst) {
                    let bridge = self.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        let timeout = bridge.options.read_all_timeout;
                        match tokio::time::timeout(timeout, bridge.read_all(&cancel)).await {
                            Ok(Ok(_)) => {},
                            Ok(Err(e)) => warn!("Startup read failed: {}", e),
                            Err(_) => warn!("Startup read timed out"),
                        }
                    });
                }
            },
            LinkEvent::Disconnected(reason) => {
                warn!("knxd link down: {}", reason);
                if let Err(e) = self.health.publish_current().await {
                    warn!("Health publish failed: {}", e);
                }
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::daemon::{ClientStats, TelegramSender};
    use crate::registry::{Device, Domain, FunctionAddress};
    use async_trait::async_trait;
    use serde_json::json;
    use tracing_test::traced_test;
    use voltage_knx::{Dpt, FunctionFlags};

    #[derive(Default)]
    struct FakeKnxd {
        sent: Mutex<Vec<Telegram>>,
        fail: AtomicBool,
    }

    impl FakeKnxd {
        fn sent(&self) -> Vec<Telegram> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl TelegramSender for FakeKnxd {
        async fn send(&self, telegram: Telegram) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(KnxSrvError::connection("broken pipe"));
            }
            self.sent.lock().push(telegram);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn stats(&self) -> ClientStats {
            ClientStats::default()
        }

        fn endpoint(&self) -> String {
            "fake".to_string()
        }
    }

    fn ga(s: &str) -> GroupAddress {
        s.parse().unwrap()
    }

    fn light() -> Device {
        Device::new("light-1", "Kitchen Light", Domain::Lighting)
            .with_function(
                "switch",
                FunctionAddress::new(ga("1/0/1"), Dpt::SWITCH, FunctionFlags::WRITE),
            )
            .with_function(
                "switch_status",
                FunctionAddress::new(ga("1/0/2"), Dpt::SWITCH, FunctionFlags::READ_TRANSMIT),
            )
            .with_function(
                "brightness",
                FunctionAddress::new(ga("1/0/3"), Dpt::SCALING, FunctionFlags::WRITE),
            )
            .with_function(
                "brightness_status",
                FunctionAddress::new(ga("1/0/4"), Dpt::SCALING, FunctionFlags::READ_TRANSMIT),
            )
    }

    fn sensor() -> Device {
        Device::new("pir-1", "Hall Presence", Domain::Sensor)
            .with_function(
                "presence",
                FunctionAddress::new(ga("3/0/1"), Dpt::OCCUPANCY, FunctionFlags::READ_TRANSMIT),
            )
            .with_function(
                "temperature",
                FunctionAddress::new(ga("3/0/2"), Dpt::TEMPERATURE, FunctionFlags::READ_TRANSMIT),
            )
            // Read-only brightness feedback modeled under the command name
            .with_function(
                "brightness",
                FunctionAddress::new(ga("3/0/3"), Dpt::SCALING, FunctionFlags::READ_TRANSMIT),
            )
    }

    fn psu() -> Device {
        Device::new("psu-1", "Line Power Supply", Domain::Infrastructure).with_function(
            "alarm",
            FunctionAddress::new(ga("0/0/1"), Dpt::ALARM, FunctionFlags::READ_TRANSMIT),
        )
    }

    struct Harness {
        bridge: Arc<Bridge>,
        bus: Arc<MemoryBus>,
        knxd: Arc<FakeKnxd>,
        registry: Arc<DeviceRegistry>,
    }

    async fn harness() -> Harness {
        let registry = Arc::new(DeviceRegistry::in_memory());
        for device in [light(), sensor(), psu()] {
            registry.add_device(device).await.unwrap();
        }
        let bus = Arc::new(MemoryBus::new());
        let knxd = Arc::new(FakeKnxd::default());
        let link = Arc::new(KnxLink::new());
        link.set(knxd.clone());
        let options = BridgeOptions {
            read_spacing: Duration::from_millis(1),
            health_interval: Duration::from_secs(3600),
            discovery_interval: None,
            read_on_startup: false,
            ..Default::default()
        };
        let bridge = Arc::new(Bridge::new(options, registry.clone(), bus.clone(), link, None));
        bridge.reload_devices();
        Harness {
            bridge,
            bus,
            knxd,
            registry,
        }
    }

    fn inbound_write(src: &str, dst: &str, data: &[u8], short: bool) -> Telegram {
        let mut t = Telegram::write(ga(dst), data, short);
        t.source = src.parse().unwrap();
        t
    }

    fn payload(message: &BusMessage) -> Value {
        serde_json::from_slice(&message.payload).unwrap()
    }

    #[tokio::test]
    async fn test_switch_telegram_updates_registry_and_publishes_state() {
        let h = harness().await;
        let published = h
            .bridge
            .handle_telegram(&inbound_write("1.1.5", "1/0/1", &[1], true))
            .await;
        assert_eq!(published, 1);

        let device = h.registry.get("light-1").unwrap();
        assert_eq!(device.state["switch_status"], json!(true));
        assert_eq!(device.health_status, HealthStatus::Online);

        let states = h.bus.published_on("state/knx/#");
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].topic, "state/knx/1%2F0%2F1");
        assert!(states[0].retain);
        let value = payload(&states[0]);
        assert_eq!(value["device_id"], "light-1");
        assert_eq!(value["address"], "1/0/1");
        assert_eq!(value["state"]["switch_status"], true);
    }

    #[tokio::test]
    async fn test_state_fields_merge_across_telegrams() {
        let h = harness().await;
        h.bridge
            .handle_telegram(&inbound_write("1.1.5", "1/0/2", &[1], true))
            .await;
        h.bridge
            .handle_telegram(&inbound_write("1.1.5", "1/0/4", &[128], false))
            .await;

        let state = h.registry.get("light-1").unwrap().state;
        assert_eq!(state["switch_status"], json!(true));
        let brightness = state["brightness_status"].as_f64().unwrap();
        assert!((brightness - 50.2).abs() < 0.1);
    }

    #[tokio::test]
    async fn test_unchanged_value_is_not_republished() {
        let h = harness().await;
        let t = inbound_write("1.1.5", "1/0/2", &[1], true);
        assert_eq!(h.bridge.handle_telegram(&t).await, 1);
        assert_eq!(h.bridge.handle_telegram(&t).await, 0);
        assert_eq!(
            h.bridge
                .handle_telegram(&inbound_write("1.1.5", "1/0/2", &[0], true))
                .await,
            1
        );
        assert_eq!(h.bus.published_on("state/knx/#").len(), 2);
    }

    #[tokio::test]
    async fn test_shared_address_updates_every_device() {
        let h = harness().await;
        let group = Device::new("group-1", "Kitchen Group", Domain::Lighting).with_function(
            "switch_status",
            FunctionAddress::new(ga("1/0/2"), Dpt::SWITCH, FunctionFlags::READ_TRANSMIT),
        );
        h.registry.add_device(group).await.unwrap();
        h.bridge.reload_devices();

        let published = h
            .bridge
            .handle_telegram(&inbound_write("1.1.5", "1/0/2", &[1], true))
            .await;
        assert_eq!(published, 2);
        for id in ["group-1", "light-1"] {
            assert_eq!(h.registry.get(id).unwrap().state["switch_status"], json!(true));
        }
        let devices: Vec<String> = h
            .bus
            .published_on("state/knx/1%2F0%2F2")
            .iter()
            .map(|m| payload(m)["device_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(devices, vec!["group-1", "light-1"]);
    }

    #[tokio::test]
    async fn test_shared_address_uses_any_declared_dpt() {
        let h = harness().await;
        // Sorts ahead of light-1 and carries no type of its own
        let untyped = Device::new("aaa-1", "Legacy Actuator", Domain::Lighting).with_function(
            "mystery",
            FunctionAddress {
                ga: ga("1/0/2"),
                dpt: None,
                flags: FunctionFlags::READ_TRANSMIT,
            },
        );
        h.registry.add_device(untyped).await.unwrap();
        h.bridge.reload_devices();
        assert_eq!(h.bridge.index().lookup(ga("1/0/2"))[0].device_id, "aaa-1");

        let published = h
            .bridge
            .handle_telegram(&inbound_write("1.1.5", "1/0/2", &[1], true))
            .await;
        assert_eq!(published, 2);
        assert_eq!(
            h.registry.get("light-1").unwrap().state["switch_status"],
            json!(true)
        );
        assert_eq!(h.registry.get("aaa-1").unwrap().state["mystery"], json!(true));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_address_without_any_dpt_is_skipped() {
        let h = harness().await;
        let untyped = Device::new("aaa-1", "Legacy Actuator", Domain::Lighting).with_function(
            "mystery",
            FunctionAddress {
                ga: ga("5/0/1"),
                dpt: None,
                flags: FunctionFlags::READ_TRANSMIT,
            },
        );
        h.registry.add_device(untyped).await.unwrap();
        h.bridge.reload_devices();

        let published = h
            .bridge
            .handle_telegram(&inbound_write("1.1.5", "5/0/1", &[1], true))
            .await;
        assert_eq!(published, 0);
        assert!(logs_contain("No DPT for 5/0/1"));
    }

    #[tokio::test]
    async fn test_presence_records_last_motion() {
        let h = harness().await;
        h.bridge
            .handle_telegram(&inbound_write("1.2.1", "3/0/1", &[1], true))
            .await;
        let state = h.registry.get("pir-1").unwrap().state;
        assert_eq!(state["presence"], json!(true));
        let stamp = state["last_motion"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());

        h.bridge
            .handle_telegram(&inbound_write("1.2.1", "3/0/1", &[0], true))
            .await;
        let messages = h.bus.published_on("state/knx/3%2F0%2F1");
        let last = payload(messages.last().unwrap());
        assert!(last["state"].get("last_motion").is_none());
    }

    #[tokio::test]
    async fn test_invalid_payload_publishes_null() {
        let h = harness().await;
        h.bridge
            .handle_telegram(&inbound_write("1.2.1", "3/0/2", &[0x7F, 0xFF], false))
            .await;
        let state = h.registry.get("pir-1").unwrap().state;
        assert_eq!(state["temperature"], Value::Null);
    }

    #[tokio::test]
    async fn test_unmodeled_address_goes_to_discovery() {
        let h = harness().await;
        let published = h
            .bridge
            .handle_telegram(&inbound_write("1.1.9", "7/7/7", &[1], true))
            .await;
        assert_eq!(published, 0);
        h.bridge
            .handle_telegram(&inbound_write("1.1.5", "1/0/1", &[1], true))
            .await;

        assert_eq!(h.bridge.publish_discovery().await.unwrap(), 1);
        let message = h.bus.retained("discovery/knx").unwrap();
        let value = payload(&message);
        assert_eq!(value["group_addresses"].as_array().unwrap().len(), 1);
        assert_eq!(value["group_addresses"][0]["address"], "7/7/7");
        assert_eq!(value["devices"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_read_requests_are_recorded_only() {
        let h = harness().await;
        let mut read = Telegram::read(ga("1/0/2"));
        read.source = "1.1.5".parse().unwrap();
        assert_eq!(h.bridge.handle_telegram(&read).await, 0);
        assert!(h.bus.published_on("state/#").is_empty());
        assert_eq!(h.bridge.recorder().address_count(), 1);
    }

    #[tokio::test]
    async fn test_write_to_read_only_function_sends_nothing() {
        let h = harness().await;
        let cmd = CommandMessage::write("pir-1", "brightness", json!(75));
        let err = h.bridge.execute_command(&cmd).await.unwrap_err();
        assert!(matches!(err, KnxSrvError::WriteRejected { .. }));
        assert!(h.knxd.sent().is_empty());
    }

    #[tokio::test]
    async fn test_execute_command_sends_write() {
        let h = harness().await;
        let cmd = CommandMessage::named("light-1", "dim").with_parameter("level", json!(100));
        let plan = h.bridge.execute_command(&cmd).await.unwrap();
        assert_eq!(plan.ga, ga("1/0/3"));
        assert_eq!(plan.confirmation, Confirmation::Pending);

        let sent = h.knxd.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].apci, Apci::Write);
        assert_eq!(sent[0].destination, ga("1/0/3"));
        assert_eq!(sent[0].payload.data(), vec![255]);
    }

    #[tokio::test]
    async fn test_command_message_acks_accepted() {
        let h = harness().await;
        let cmd = json!({"id": "c-1", "device_id": "light-1", "command": "on"});
        let message = BusMessage::new("command/knx/1%2F0%2F1", serde_json::to_vec(&cmd).unwrap());
        h.bridge.handle_command_message(&message).await;

        let acks = h.bus.published_on("ack/knx/#");
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].topic, "ack/knx/1%2F0%2F1");
        let ack = payload(&acks[0]);
        assert_eq!(ack["command_id"], "c-1");
        assert_eq!(ack["status"], "accepted");
        assert_eq!(ack["confirmation"], "pending");
        assert_eq!(h.knxd.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_command_on_foreign_address_is_rejected() {
        let h = harness().await;
        let cmd = json!({"id": "c-5", "device_id": "light-1", "command": "on"});
        let message = BusMessage::new("command/knx/3%2F0%2F1", serde_json::to_vec(&cmd).unwrap());
        h.bridge.handle_command_message(&message).await;

        let acks = h.bus.published_on("ack/knx/#");
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].topic, "ack/knx/3%2F0%2F1");
        let ack = payload(&acks[0]);
        assert_eq!(ack["status"], "failed");
        assert_eq!(ack["error"]["code"], INVALID_COMMAND);
        assert!(h.knxd.sent().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_command_on_sibling_address_is_sent_and_logged() {
        let h = harness().await;
        let cmd = json!({"id": "c-6", "device_id": "light-1", "command": "on"});
        let message = BusMessage::new("command/knx/1%2F0%2F2", serde_json::to_vec(&cmd).unwrap());
        h.bridge.handle_command_message(&message).await;

        let acks = h.bus.published_on("ack/knx/#");
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].topic, "ack/knx/1%2F0%2F2");
        assert_eq!(payload(&acks[0])["status"], "accepted");
        assert_eq!(payload(&acks[0])["address"], "1/0/1");

        let sent = h.knxd.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, ga("1/0/1"));
        assert!(logs_contain("Command on 1/0/2 for light-1 writes 1/0/1"));
    }

    #[tokio::test]
    async fn test_command_for_unknown_device_fails() {
        let h = harness().await;
        let cmd = json!({"id": "c-2", "device_id": "ghost", "command": "on"});
        let message = BusMessage::new("command/knx/9%2F0%2F1", serde_json::to_vec(&cmd).unwrap());
        h.bridge.handle_command_message(&message).await;

        let acks = h.bus.published_on("ack/knx/#");
        assert_eq!(acks[0].topic, "ack/knx/9%2F0%2F1");
        let ack = payload(&acks[0]);
        assert_eq!(ack["status"], "failed");
        assert_eq!(ack["error"]["code"], NOT_CONFIGURED);
        assert_eq!(ack["address"], "9/0/1");
    }

    #[tokio::test]
    async fn test_unknown_command_is_invalid() {
        let h = harness().await;
        let cmd = json!({"id": "c-3", "device_id": "light-1", "command": "explode"});
        let message = BusMessage::new("command/knx/1%2F0%2F1", serde_json::to_vec(&cmd).unwrap());
        h.bridge.handle_command_message(&message).await;
        let ack = payload(&h.bus.published_on("ack/knx/#")[0]);
        assert_eq!(ack["error"]["code"], INVALID_COMMAND);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_send_failure_acks_accepted_then_unreachable() {
        let h = harness().await;
        h.knxd.fail.store(true, Ordering::SeqCst);
        let cmd = json!({"id": "c-4", "device_id": "light-1", "command": "off"});
        let message = BusMessage::new("command/knx/1%2F0%2F1", serde_json::to_vec(&cmd).unwrap());
        h.bridge.handle_command_message(&message).await;

        let acks: Vec<Value> = h.bus.published_on("ack/knx/#").iter().map(payload).collect();
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0]["status"], "accepted");
        assert_eq!(acks[1]["status"], "failed");
        assert_eq!(acks[1]["error"]["code"], DEVICE_UNREACHABLE);
        assert!(logs_contain("Command c-4 to 1/0/1 failed"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unverified_write_is_logged() {
        let h = harness().await;
        let cmd = CommandMessage::write("light-1", "brightness", json!(20));
        let mut device = light();
        device.address.functions.remove("brightness_status");
        h.registry.update_device(device).await.unwrap();
        h.bridge.reload_devices();

        let plan = h.bridge.execute_command(&cmd).await.unwrap();
        assert_eq!(plan.confirmation, Confirmation::Unverified);
        assert!(logs_contain("delivered, unverified"));
    }

    #[tokio::test]
    async fn test_read_state_request() {
        let h = harness().await;
        let request = RequestMessage {
            request_id: "r-1".into(),
            action: "read_state".into(),
            device_id: Some("light-1".into()),
            ..Default::default()
        };
        let response = h.bridge.handle_request(&request).await;
        assert!(response.success);
        assert_eq!(response.data.unwrap()["reads_sent"], json!(2));

        let reads: Vec<GroupAddress> = h.knxd.sent().iter().map(|t| t.destination).collect();
        assert_eq!(reads, vec![ga("1/0/2"), ga("1/0/4")]);
        assert!(h.knxd.sent().iter().all(|t| t.apci == Apci::Read));
    }

    #[tokio::test]
    async fn test_request_errors() {
        let h = harness().await;
        let missing = RequestMessage {
            request_id: "r-2".into(),
            action: "read_state".into(),
            ..Default::default()
        };
        let response = h.bridge.handle_request(&missing).await;
        assert_eq!(response.error.unwrap().code, INVALID_PARAMETERS);

        let unknown = RequestMessage {
            request_id: "r-3".into(),
            action: "read_state".into(),
            device_id: Some("ghost".into()),
            ..Default::default()
        };
        let response = h.bridge.handle_request(&unknown).await;
        assert_eq!(response.error.unwrap().code, NOT_CONFIGURED);

        let bogus = RequestMessage {
            request_id: "r-4".into(),
            action: "reboot".into(),
            ..Default::default()
        };
        let response = h.bridge.handle_request(&bogus).await;
        assert_eq!(response.error.unwrap().code, INVALID_COMMAND);
    }

    #[tokio::test]
    async fn test_read_all_skips_infrastructure() {
        let h = harness().await;
        let sent = h.bridge.read_all(&CancellationToken::new()).await.unwrap();
        // light status x2, presence, temperature, read-only brightness
        assert_eq!(sent, 5);
        assert!(h.knxd.sent().iter().all(|t| t.destination != ga("0/0/1")));
    }

    #[tokio::test]
    async fn test_read_all_without_knxd() {
        let h = harness().await;
        h.bridge.link.clear();
        let err = h.bridge.read_all(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, KnxSrvError::NotConnected));
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_run_loop_end_to_end() {
        let h = harness().await;
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.bridge.clone().run(rx, cancel.clone()));

        let bus = h.bus.clone();
        eventually(|| bus.retained("health/knx").is_some()).await;

        // Command over the bus
        let cmd = json!({"id": "c-9", "device_id": "light-1", "command": "on"});
        h.bus
            .publish("command/knx/1%2F0%2F1", &serde_json::to_vec(&cmd).unwrap(), false)
            .await
            .unwrap();
        let bus = h.bus.clone();
        eventually(|| !bus.published_on("ack/knx/#").is_empty()).await;

        // Telegram from the link
        tx.send(LinkEvent::Telegram(inbound_write("1.1.5", "1/0/2", &[1], true)))
            .await
            .unwrap();
        let registry = h.registry.clone();
        eventually(|| {
            registry
                .get("light-1")
                .map(|d| d.state.contains_key("switch_status"))
                .unwrap_or(false)
        })
        .await;

        // New device in the registry shows up in the index
        let blind = Device::new("blind-1", "Blind", Domain::Blinds).with_function(
            "position",
            FunctionAddress::new(ga("2/0/1"), Dpt::SCALING, FunctionFlags::WRITE),
        );
        h.registry.add_device(blind).await.unwrap();
        let bridge = h.bridge.clone();
        eventually(|| bridge.index().device("blind-1").is_some()).await;

        cancel.cancel();
        task.await.unwrap().unwrap();
        let health = payload(&h.bus.retained("health/knx").unwrap());
        assert_eq!(health["status"], "stopping");
    }

    #[tokio::test]
    async fn test_startup_read_runs_once() {
        let h = harness().await;
        let options = BridgeOptions {
            read_spacing: Duration::ZERO,
            read_on_startup: true,
            discovery_interval: None,
            ..Default::default()
        };
        let link = Arc::new(KnxLink::new());
        link.set(h.knxd.clone());
        let bridge = Arc::new(Bridge::new(options, h.registry.clone(), h.bus.clone(), link, None));

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge.run(rx, cancel.clone()));
        tx.send(LinkEvent::Connected).await.unwrap();
        let knxd = h.knxd.clone();
        eventually(|| knxd.sent().len() == 5).await;

        tx.send(LinkEvent::Disconnected("test".into())).await.unwrap();
        tx.send(LinkEvent::Connected).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.knxd.sent().len(), 5);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
