//! knxd supervisor
//!
//! Owns the daemon state machine. Layer 0-1 failures restart the process with
//! backoff; layer 2-3 failures first ask clients to reconnect and only restart
//! once they persist. Status is published on a watch channel; clients report
//! disconnects through [`DaemonHandle`] instead of reconnecting on their own.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::{Backoff, BackoffPolicy};
use super::health::{HealthFailure, HealthProbe};
use super::process::ProcessControl;
use super::state::{DaemonState, DaemonStatus, HealthLayer, StateMachine};
use crate::config::KnxdConfig;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub health_interval: Duration,
    pub ready_timeout: Duration,
    pub ready_poll: Duration,
    /// Consecutive handshake/bus failures before a restart
    pub escalate_after: u32,
    pub usb_reset_on_retry: bool,
    pub usb_reset_on_bus_failure: bool,
    pub backoff: BackoffPolicy,
}

impl ManagerOptions {
    pub fn from_config(config: &KnxdConfig) -> Self {
        Self {
            health_interval: config.health_interval(),
            ready_timeout: config.ready_timeout(),
            ready_poll: READY_POLL_INTERVAL,
            escalate_after: config.escalate_after.max(1),
            usb_reset_on_retry: config.usb_reset_on_retry,
            usb_reset_on_bus_failure: config.usb_reset_on_bus_failure,
            backoff: BackoffPolicy::from_config(config),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ManagerSignal {
    /// A client lost its knxd connection
    ClientDisconnected(String),
    /// Run a health cycle now
    CheckNow,
}

/// Cloneable view onto a running manager
#[derive(Clone)]
pub struct DaemonHandle {
    status: watch::Receiver<DaemonStatus>,
    signals: mpsc::Sender<ManagerSignal>,
}

impl DaemonHandle {
    pub fn status(&self) -> DaemonStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DaemonStatus> {
        self.status.clone()
    }

    pub fn report_disconnect(&self, reason: impl Into<String>) {
        if let Err(e) = self
            .signals
            .try_send(ManagerSignal::ClientDisconnected(reason.into()))
        {
            debug!("Disconnect signal dropped: {}", e);
        }
    }

    /// Ask for an immediate health cycle; a request already queued covers it
    pub fn request_check(&self) {
        match self.signals.try_send(ManagerSignal::CheckNow) {
            Ok(()) => {},
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Health check request dropped: manager queue full")
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Health check request dropped: manager stopped")
            },
        }
    }
}

pub struct DaemonManager {
    process: Option<Arc<dyn ProcessControl>>,
    probe: Arc<dyn HealthProbe>,
    options: ManagerOptions,
    machine: StateMachine,
    backoff: Backoff,
    pending_delay: Duration,
    status: DaemonStatus,
    status_tx: watch::Sender<DaemonStatus>,
    signals: mpsc::Receiver<ManagerSignal>,
}

impl DaemonManager {
    /// `process` is `None` when knxd runs outside our control
    pub fn new(
        process: Option<Arc<dyn ProcessControl>>,
        probe: Arc<dyn HealthProbe>,
        options: ManagerOptions,
    ) -> (Self, DaemonHandle) {
        let status = DaemonStatus::new(process.is_some());
        let (status_tx, status_rx) = watch::channel(status.clone());
        let (signal_tx, signal_rx) = mpsc::channel(16);
        let backoff = Backoff::new(options.backoff.clone());

        let manager = Self {
            process,
            probe,
            options,
            machine: StateMachine::default(),
            backoff,
            pending_delay: Duration::ZERO,
            status,
            status_tx,
            signals: signal_rx,
        };
        let handle = DaemonHandle {
            status: status_rx,
            signals: signal_tx,
        };
        (manager, handle)
    }

    pub fn state(&self) -> DaemonState {
        self.machine.state()
    }

    fn managed(&self) -> bool {
        self.process.is_some()
    }

    fn publish(&mut self) {
        self.status.state = self.machine.state();
        self.status.pid = self.process.as_ref().and_then(|p| p.pid());
        self.status_tx.send_replace(self.status.clone());
    }

    fn set_state(&mut self, to: DaemonState) {
        let from = self.machine.state();
        if from == to {
            return;
        }
        match self.machine.transition(to) {
            Ok(()) => {
                if to.is_degraded() || matches!(to, DaemonState::Restarting { .. }) {
                    warn!("knxd state: {} -> {}", from, to);
                } else {
                    info!("knxd state: {} -> {}", from, to);
                }
            },
            Err(e) => error!("{}", e),
        }
        self.publish();
    }

    /// Run until `cancel` fires, then stop the daemon
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.options.health_interval,
            self.options.health_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.machine.state() {
                DaemonState::Stopped | DaemonState::Starting | DaemonState::Checking { .. } => {
                    self.startup(&cancel).await;
                },
                DaemonState::Restarting { .. } => {
                    self.restart(&cancel).await;
                },
                DaemonState::PermanentlyDegraded => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        signal = self.signals.recv() => {
                            if let Some(signal) = signal {
                                debug!("Ignoring {:?}: knxd permanently degraded", signal);
                            }
                        },
                    }
                },
                DaemonState::Healthy | DaemonState::Degraded { .. } => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => self.health_cycle().await,
                        signal = self.signals.recv() => match signal {
                            Some(ManagerSignal::ClientDisconnected(reason)) => {
                                warn!("knxd client disconnected: {}", reason);
                                self.health_cycle().await;
                                if self.machine.state().accepts_clients() {
                                    self.request_reconnect();
                                }
                            },
                            Some(ManagerSignal::CheckNow) => self.health_cycle().await,
                            None => {},
                        },
                    }
                },
            }
        }

        self.shutdown().await;
    }

    async fn startup(&mut self, cancel: &CancellationToken) {
        self.set_state(DaemonState::Starting);

        if let Some(process) = self.process.clone() {
            if let Err(e) = process.spawn().await {
                self.on_failure(HealthFailure::new(HealthLayer::Process, e.to_string()))
                    .await;
                return;
            }
            self.publish();
            if let Err(failure) = self.wait_ready(process.as_ref(), cancel).await {
                self.on_failure(failure).await;
                return;
            }
        }

        for layer in HealthLayer::ALL {
            if layer == HealthLayer::Process && !self.managed() {
                continue;
            }
            self.set_state(DaemonState::Checking { layer });
            if let Err(failure) = self.check_layer(layer).await {
                self.on_failure(failure).await;
                return;
            }
        }
        self.mark_healthy();
    }

    /// Poll the transport until knxd accepts connections
    async fn wait_ready(
        &self,
        process: &dyn ProcessControl,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), HealthFailure> {
        let deadline = Instant::now() + self.options.ready_timeout;
        loop {
            process.check_process().await?;
            let last = match self.probe.check_transport().await {
                Ok(()) => {
                    debug!("knxd accepting connections");
                    return Ok(());
                },
                Err(f) => f,
            };
            if Instant::now() >= deadline {
                return Err(HealthFailure::new(
                    HealthLayer::Transport,
                    format!(
                        "not ready after {:?}: {}",
                        self.options.ready_timeout, last.message
                    ),
                ));
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(HealthFailure::new(HealthLayer::Transport, "cancelled"));
                },
                _ = tokio::time::sleep(self.options.ready_poll) => {},
            }
        }
    }

    async fn check_layer(&self, layer: HealthLayer) -> std::result::Result<(), HealthFailure> {
        match layer {
            HealthLayer::Process => match &self.process {
                Some(process) => process.check_process().await,
                None => Ok(()),
            },
            HealthLayer::Transport => self.probe.check_transport().await,
            HealthLayer::Handshake => self.probe.check_handshake().await,
            HealthLayer::Bus => self.probe.check_bus().await,
        }
    }

    async fn health_cycle(&mut self) {
        for layer in HealthLayer::ALL {
            if let Err(failure) = self.check_layer(layer).await {
                self.on_failure(failure).await;
                return;
            }
        }
        self.mark_healthy();
    }

    fn mark_healthy(&mut self) {
        let was_healthy = self.machine.state() == DaemonState::Healthy;
        self.backoff.reset();
        self.status.consecutive_failures = 0;
        self.status.last_error = None;
        self.status.last_healthy = Some(Utc::now());
        if was_healthy {
            self.publish();
        } else {
            self.set_state(DaemonState::Healthy);
            info!("[OK] knxd healthy");
        }
    }

    fn request_reconnect(&mut self) {
        self.status.reconnect_generation += 1;
        self.publish();
    }

    async fn on_failure(&mut self, failure: HealthFailure) {
        warn!("[FAIL] knxd health {}", failure);
        self.status.last_error = Some(failure.to_string());
        let layer = failure.layer;

        if !failure.recoverable {
            // Restarting won't bring back missing hardware
            self.set_state(DaemonState::Degraded { layer });
            return;
        }

        if layer.requires_restart() {
            if self.managed() {
                self.schedule_restart();
            } else {
                self.set_state(DaemonState::Degraded { layer });
            }
            return;
        }

        self.status.consecutive_failures += 1;
        let failures = self.status.consecutive_failures;

        if layer == HealthLayer::Bus && self.options.usb_reset_on_bus_failure {
            self.reset_interface().await;
        }

        if self.managed() && failures >= self.options.escalate_after {
            warn!(
                "{} consecutive {} failures, escalating to restart",
                failures,
                layer.as_str()
            );
            self.schedule_restart();
        } else {
            self.set_state(DaemonState::Degraded { layer });
            self.request_reconnect();
        }
    }

    fn schedule_restart(&mut self) {
        match self.backoff.next_delay() {
            Some(delay) => {
                self.pending_delay = delay;
                self.status.restart_count += 1;
                let attempt = self.backoff.attempt();
                self.set_state(DaemonState::Restarting { attempt });
            },
            None => {
                error!(
                    "[FAIL] knxd restart budget ({}) exhausted, giving up",
                    self.options.backoff.max_attempts
                );
                self.set_state(DaemonState::PermanentlyDegraded);
            },
        }
    }

    async fn restart(&mut self, cancel: &CancellationToken) {
        info!("Restarting knxd in {:?}", self.pending_delay);
        if let Some(process) = self.process.clone() {
            if let Err(e) = process.stop().await {
                warn!("Stopping knxd before restart failed: {}", e);
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.pending_delay) => {},
        }
        if self.options.usb_reset_on_retry {
            self.reset_interface().await;
        }
        self.status.consecutive_failures = 0;
        self.startup(cancel).await;
    }

    async fn reset_interface(&self) {
        if let Some(process) = &self.process {
            if process.can_reset_interface() {
                if let Err(e) = process.reset_interface().await {
                    warn!("USB interface reset failed: {}", e);
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(process) = self.process.clone() {
            if let Err(e) = process.stop().await {
                warn!("Stopping knxd failed: {}", e);
            }
        }
        self.set_state(DaemonState::Stopped);
        info!("knxd manager stopped");
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::daemon::health::CheckResult;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeProcess {
        spawns: AtomicU32,
        stops: AtomicU32,
        resets: AtomicU32,
        usb_missing: AtomicBool,
    }

    #[async_trait]
    impl ProcessControl for FakeProcess {
        async fn spawn(&self) -> Result<u32> {
            Ok(1000 + self.spawns.fetch_add(1, Ordering::SeqCst))
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn pid(&self) -> Option<u32> {
            Some(1000)
        }

        async fn check_process(&self) -> CheckResult {
            if self.usb_missing.load(Ordering::SeqCst) {
                Err(HealthFailure::unrecoverable(
                    HealthLayer::Process,
                    "USB interface not detected",
                ))
            } else {
                Ok(())
            }
        }

        fn can_reset_interface(&self) -> bool {
            true
        }

        async fn reset_interface(&self) -> Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeProbe {
        transport: AtomicBool,
        handshake: AtomicBool,
        bus: AtomicBool,
    }

    impl FakeProbe {
        fn healthy() -> Self {
            Self {
                transport: AtomicBool::new(true),
                handshake: AtomicBool::new(true),
                bus: AtomicBool::new(true),
            }
        }
    }

    fn result(ok: &AtomicBool, layer: HealthLayer) -> CheckResult {
        if ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HealthFailure::new(layer, "simulated failure"))
        }
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn check_transport(&self) -> CheckResult {
            result(&self.transport, HealthLayer::Transport)
        }

        async fn check_handshake(&self) -> CheckResult {
            result(&self.handshake, HealthLayer::Handshake)
        }

        async fn check_bus(&self) -> CheckResult {
            result(&self.bus, HealthLayer::Bus)
        }
    }

    fn options(max_attempts: u32) -> ManagerOptions {
        ManagerOptions {
            health_interval: Duration::from_millis(20),
            ready_timeout: Duration::from_millis(50),
            ready_poll: Duration::from_millis(5),
            escalate_after: 2,
            usb_reset_on_retry: false,
            usb_reset_on_bus_failure: false,
            backoff: BackoffPolicy {
                max_attempts,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
                jitter: false,
            },
        }
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<DaemonStatus>, pred: F) -> DaemonStatus
    where
        F: Fn(&DaemonStatus) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if pred(&status) {
                        return status.clone();
                    }
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("status condition not reached")
    }

    fn spawn_manager(
        process: Option<Arc<FakeProcess>>,
        probe: Arc<FakeProbe>,
        options: ManagerOptions,
    ) -> (DaemonHandle, CancellationToken, tokio::task::JoinHandle<()>) {
        let process = process.map(|p| p as Arc<dyn ProcessControl>);
        let (manager, handle) = DaemonManager::new(process, probe, options);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(manager.run(cancel.clone()));
        (handle, cancel, task)
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_dropped_check_requests_are_logged() {
        let (manager, handle) =
            DaemonManager::new(None, Arc::new(FakeProbe::healthy()), options(3));
        for _ in 0..17 {
            handle.request_check();
        }
        assert!(logs_contain("Health check request dropped: manager queue full"));

        drop(manager);
        handle.request_check();
        assert!(logs_contain("Health check request dropped: manager stopped"));
    }

    #[tokio::test]
    async fn test_healthy_startup() {
        let process = Arc::new(FakeProcess::default());
        let (handle, cancel, task) =
            spawn_manager(Some(process.clone()), Arc::new(FakeProbe::healthy()), options(3));

        let mut rx = handle.subscribe();
        let status = wait_for(&mut rx, |s| s.state == DaemonState::Healthy).await;
        assert!(status.last_healthy.is_some());
        assert_eq!(status.pid, Some(1000));
        assert_eq!(process.spawns.load(Ordering::SeqCst), 1);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(handle.status().state, DaemonState::Stopped);
        assert_eq!(process.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handshake_failure_degrades_then_gives_up() {
        let process = Arc::new(FakeProcess::default());
        let probe = Arc::new(FakeProbe::healthy());
        probe.handshake.store(false, Ordering::SeqCst);
        let (handle, cancel, task) = spawn_manager(Some(process.clone()), probe, options(2));

        let mut rx = handle.subscribe();
        wait_for(&mut rx, |s| matches!(s.state, DaemonState::Degraded { .. })).await;
        wait_for(&mut rx, |s| matches!(s.state, DaemonState::Restarting { .. })).await;
        let status = wait_for(&mut rx, |s| s.state == DaemonState::PermanentlyDegraded).await;

        assert_eq!(status.restart_count, 2);
        assert!(status.last_error.unwrap().contains("handshake"));
        // Initial start plus two restarts, then nothing more
        assert_eq!(process.spawns.load(Ordering::SeqCst), 3);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(process.spawns.load(Ordering::SeqCst), 3);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_failure_restarts_and_recovers() {
        let process = Arc::new(FakeProcess::default());
        let probe = Arc::new(FakeProbe::healthy());
        let (handle, cancel, task) =
            spawn_manager(Some(process.clone()), probe.clone(), options(0));

        let mut rx = handle.subscribe();
        wait_for(&mut rx, |s| s.state == DaemonState::Healthy).await;

        probe.transport.store(false, Ordering::SeqCst);
        wait_for(&mut rx, |s| matches!(s.state, DaemonState::Restarting { .. })).await;
        probe.transport.store(true, Ordering::SeqCst);

        let status = wait_for(&mut rx, |s| {
            s.state == DaemonState::Healthy && s.restart_count >= 1
        })
        .await;
        assert!(status.last_error.is_none());
        assert!(process.spawns.load(Ordering::SeqCst) >= 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_usb_does_not_restart() {
        let process = Arc::new(FakeProcess::default());
        process.usb_missing.store(true, Ordering::SeqCst);
        let (handle, cancel, task) =
            spawn_manager(Some(process.clone()), Arc::new(FakeProbe::healthy()), options(3));

        let mut rx = handle.subscribe();
        let status = wait_for(&mut rx, |s| {
            s.state
                == DaemonState::Degraded {
                    layer: HealthLayer::Process,
                }
        })
        .await;
        assert_eq!(status.restart_count, 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(process.spawns.load(Ordering::SeqCst), 1);

        process.usb_missing.store(false, Ordering::SeqCst);
        wait_for(&mut rx, |s| s.state == DaemonState::Healthy).await;

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_bus_failure_resets_usb_and_requests_reconnect() {
        let process = Arc::new(FakeProcess::default());
        let probe = Arc::new(FakeProbe::healthy());
        let mut opts = options(3);
        opts.usb_reset_on_bus_failure = true;
        opts.escalate_after = 100;
        let (handle, cancel, task) = spawn_manager(Some(process.clone()), probe.clone(), opts);

        let mut rx = handle.subscribe();
        wait_for(&mut rx, |s| s.state == DaemonState::Healthy).await;
        probe.bus.store(false, Ordering::SeqCst);

        let status = wait_for(&mut rx, |s| {
            s.state
                == DaemonState::Degraded {
                    layer: HealthLayer::Bus,
                }
        })
        .await;
        assert!(status.reconnect_generation >= 1);
        assert!(process.resets.load(Ordering::SeqCst) >= 1);
        assert_eq!(status.restart_count, 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unmanaged_degrades_without_restart() {
        let probe = Arc::new(FakeProbe::healthy());
        probe.transport.store(false, Ordering::SeqCst);
        let (handle, cancel, task) = spawn_manager(None, probe.clone(), options(3));

        let mut rx = handle.subscribe();
        let status = wait_for(&mut rx, |s| {
            s.state
                == DaemonState::Degraded {
                    layer: HealthLayer::Transport,
                }
        })
        .await;
        assert!(!status.managed);
        assert_eq!(status.restart_count, 0);

        probe.transport.store(true, Ordering::SeqCst);
        wait_for(&mut rx, |s| s.state == DaemonState::Healthy).await;

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_report_triggers_reconnect_generation() {
        let (handle, cancel, task) = spawn_manager(
            Some(Arc::new(FakeProcess::default())),
            Arc::new(FakeProbe::healthy()),
            ManagerOptions {
                health_interval: Duration::from_secs(60),
                ..options(3)
            },
        );

        let mut rx = handle.subscribe();
        wait_for(&mut rx, |s| s.state == DaemonState::Healthy).await;
        handle.report_disconnect("connection reset");
        let status = wait_for(&mut rx, |s| s.reconnect_generation == 1).await;
        assert_eq!(status.state, DaemonState::Healthy);

        cancel.cancel();
        task.await.unwrap();
    }
}
