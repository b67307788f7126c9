//! KNX bridge service (knxsrv)
//!
//! Connects a KNX installation, reached through a knxd daemon, to a
//! publish/subscribe message bus:
//! - `daemon`: knxd process supervision, health probing, the knxd client
//! - `registry`: device cache over SQLite, the source of address mappings
//! - `bus`: MQTT, Redis and in-process message bus adapters
//! - `bridge`: telegram → state and command → telegram translation

pub mod bridge;
pub mod bus;
pub mod config;
pub mod daemon;
pub mod error;
pub mod registry;

pub use error::{KnxSrvError, Result};
