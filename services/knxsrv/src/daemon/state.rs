//! Daemon lifecycle state machine

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::error::{KnxSrvError, Result};

/// Health layers, checked in order; a layer is only meaningful once every
/// layer below it passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLayer {
    /// knxd process alive and not stopped/zombie
    Process = 0,
    /// Listener accepts connections
    Transport = 1,
    /// Group socket handshake completes
    Handshake = 2,
    /// A group read is answered on the bus
    Bus = 3,
}

impl HealthLayer {
    pub const ALL: [HealthLayer; 4] = [
        HealthLayer::Process,
        HealthLayer::Transport,
        HealthLayer::Handshake,
        HealthLayer::Bus,
    ];

    pub const fn index(self) -> u8 {
        self as u8
    }

    /// Failures at this layer restart the process rather than reconnect
    pub const fn requires_restart(self) -> bool {
        matches!(self, HealthLayer::Process | HealthLayer::Transport)
    }

    pub fn next(self) -> Option<HealthLayer> {
        match self {
            HealthLayer::Process => Some(HealthLayer::Transport),
            HealthLayer::Transport => Some(HealthLayer::Handshake),
            HealthLayer::Handshake => Some(HealthLayer::Bus),
            HealthLayer::Bus => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            HealthLayer::Process => "process",
            HealthLayer::Transport => "transport",
            HealthLayer::Handshake => "handshake",
            HealthLayer::Bus => "bus",
        }
    }
}

impl fmt::Display for HealthLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{} {}", self.index(), self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DaemonState {
    Stopped,
    Starting,
    /// Start-up walk through the health layers
    Checking { layer: HealthLayer },
    Healthy,
    /// Running with a failing layer; recovery in progress or not possible
    Degraded { layer: HealthLayer },
    Restarting { attempt: u32 },
    /// Restart budget exhausted; no further automatic recovery
    PermanentlyDegraded,
}

impl DaemonState {
    pub const fn name(&self) -> &'static str {
        match self {
            DaemonState::Stopped => "stopped",
            DaemonState::Starting => "starting",
            DaemonState::Checking { .. } => "checking",
            DaemonState::Healthy => "healthy",
            DaemonState::Degraded { .. } => "degraded",
            DaemonState::Restarting { .. } => "restarting",
            DaemonState::PermanentlyDegraded => "permanently_degraded",
        }
    }

    /// Whether the bridge should try to hold a client connection
    pub const fn accepts_clients(&self) -> bool {
        matches!(self, DaemonState::Healthy | DaemonState::Degraded { .. })
    }

    pub const fn is_degraded(&self) -> bool {
        matches!(
            self,
            DaemonState::Degraded { .. } | DaemonState::PermanentlyDegraded
        )
    }

    /// Transition table
    pub fn can_transition(&self, to: &DaemonState) -> bool {
        use DaemonState::*;

        // Explicit shutdown is always allowed
        if matches!(to, Stopped) {
            return true;
        }
        match (self, to) {
            (Stopped, Starting) => true,
            (Starting, Checking { .. } | Restarting { .. } | Degraded { .. }) => true,
            (Starting, PermanentlyDegraded) => true,
            (Checking { layer: from }, Checking { layer: next }) => next > from,
            (Checking { .. }, Healthy | Degraded { .. } | Restarting { .. }) => true,
            (Checking { .. }, PermanentlyDegraded) => true,
            (Healthy, Degraded { .. } | Restarting { .. }) => true,
            (Degraded { .. }, Healthy | Degraded { .. } | Restarting { .. }) => true,
            (Degraded { .. }, PermanentlyDegraded) => true,
            (Restarting { .. }, Starting | PermanentlyDegraded) => true,
            (Restarting { attempt: a }, Restarting { attempt: b }) => b > a,
            _ => false,
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonState::Checking { layer } => write!(f, "checking({})", layer),
            DaemonState::Degraded { layer } => write!(f, "degraded({})", layer),
            DaemonState::Restarting { attempt } => write!(f, "restarting(#{})", attempt),
            other => f.write_str(other.name()),
        }
    }
}

/// Snapshot broadcast to observers
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    #[serde(flatten)]
    pub state: DaemonState,
    pub managed: bool,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_healthy: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    /// Bumped whenever clients should drop and re-open their connection
    pub reconnect_generation: u64,
}

impl DaemonStatus {
    pub fn new(managed: bool) -> Self {
        Self {
            state: DaemonState::Stopped,
            managed,
            restart_count: 0,
            consecutive_failures: 0,
            last_error: None,
            last_healthy: None,
            pid: None,
            reconnect_generation: 0,
        }
    }
}

/// Validated state holder
#[derive(Debug)]
pub struct StateMachine {
    state: DaemonState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: DaemonState::Stopped,
        }
    }
}

impl StateMachine {
    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Move to `to`; self-transitions are no-ops
    pub fn transition(&mut self, to: DaemonState) -> Result<()> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition(&to) {
            return Err(KnxSrvError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }
}
