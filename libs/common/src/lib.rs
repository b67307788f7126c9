//! Shared service infrastructure
//!
//! Logging setup, layered configuration loading, shutdown signals, and the
//! Redis and SQLite pools used by the bridge services.

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use config_loader::{figment_for, load_config};
pub use shutdown::wait_for_shutdown;
