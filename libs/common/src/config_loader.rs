//! Configuration loading helpers
//!
//! Layered loading with `figment`: built-in defaults, then the YAML file (if it
//! exists), then `{PREFIX}`-prefixed environment variables where `__` separates
//! nesting levels (`KNXSRV_KNXD__TCP_PORT=6721`).

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Build the layered figment for a service config type
pub fn figment_for<T>(path: &Path, env_prefix: &str) -> Figment
where
    T: Serialize + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));
    if path.exists() {
        info!("Config file: {}", path.display());
        figment = figment.merge(Yaml::file(path));
    } else {
        warn!("Config file {} not found, using defaults", path.display());
    }
    figment.merge(Env::prefixed(env_prefix).split("__"))
}

/// Load a service config from file + environment
pub fn load_config<T>(path: &Path, env_prefix: &str) -> Result<T, figment::Error>
where
    T: Serialize + DeserializeOwned + Default,
{
    figment_for::<T>(path, env_prefix).extract()
}
