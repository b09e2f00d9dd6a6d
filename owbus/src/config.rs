//! Configuration management for owbus.
//!
//! Configuration is read from a TOML file named by `OWBUS_CONFIG`, with
//! defaults for every field. `OWBUS_TEMPERATURE_SCALE` overrides the
//! temperature scale from the file.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

use crate::adapter::Transport;
use crate::device::{Settings, TemperatureScale};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

pub const CONFIG_ENV: &str = "OWBUS_CONFIG";
pub const TEMPERATURE_SCALE_ENV: &str = "OWBUS_TEMPERATURE_SCALE";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bus: BusConfig,
    pub units: UnitsConfig,
    pub cache: CacheConfig,
    /// Buses to open
    pub adapters: Vec<Transport>,
}

/// Bus behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// Consecutive transport failures before a bus is marked bad
    pub reconnect_limit: u32,

    /// Run at overdrive speed where the adapter supports it
    pub overdrive: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            reconnect_limit: 3,
            overdrive: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UnitsConfig {
    pub temperature: TemperatureScale,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Keep static and stable property values between requests
    pub static_values: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            static_values: true,
        }
    }
}

impl Config {
    /// Load from `OWBUS_CONFIG` if set, otherwise use defaults; then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config = match env::var_os(CONFIG_ENV) {
            Some(path) => Self::load_from(Path::new(&path))?,
            None => {
                debug!("{CONFIG_ENV} not set, using defaults");
                Self::default()
            }
        };
        config.with_env_overrides()
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let config = Self::parse(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), adapters = config.adapters.len(), "configuration loaded");
        Ok(config)
    }

    /// Parse TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(scale) = env::var(TEMPERATURE_SCALE_ENV) {
            self.units.temperature = scale.parse().map_err(|_| {
                Error::Config(format!("{TEMPERATURE_SCALE_ENV}: unknown scale {scale:?}"))
            })?;
        }
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.bus.reconnect_limit == 0 {
            return Err(Error::Config(
                "bus.reconnect_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Property layer settings.
    pub fn settings(&self) -> Settings {
        Settings {
            temperature_scale: self.units.temperature,
            cache_static: self.cache.static_values,
        }
    }
}
