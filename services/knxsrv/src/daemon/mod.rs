//! knxd daemon supervision and client connection

pub mod args;
pub mod backoff;
pub mod client;
pub mod codec;
pub mod health;
pub mod manager;
pub mod monitor;
pub mod process;
pub mod state;

pub use client::{ClientEvent, ClientStats, Endpoint, KnxdClient, TelegramSender};
pub use health::{GroupAddressProvider, HealthFailure, HealthProbe, KnxdProbe};
pub use manager::{DaemonHandle, DaemonManager, ManagerOptions};
pub use monitor::{BusMonitor, BusObserver};
pub use process::{KnxdProcess, ProcessControl};
pub use state::{DaemonState, DaemonStatus, HealthLayer};
