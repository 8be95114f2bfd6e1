//! Cache configuration
//!
//! Every field has a default, so an empty TOML file is a valid config.
//!
//! ```toml
//! max_size = 8388608
//! allocation_attempts = 10
//! growth_factor = 0.25
//! eviction_slack = 0.2
//! initial_capacity = 100
//! capacity_step = 50
//! miss_tick_interval = 4
//! ```
//!
//! Environment variables named `HEAPCACHE_<FIELD>` (e.g. `HEAPCACHE_MAX_SIZE`)
//! override file values.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "HEAPCACHE";

/// Tunables for a [`Cache`](crate::Cache)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Budget for the sum of entry sizes; also the heap capacity
    pub max_size: usize,

    /// Heap allocation attempts on a miss before flushing
    pub allocation_attempts: u32,

    /// Fraction of the entry size added to the make-room target per failed attempt
    pub growth_factor: f64,

    /// Fraction of the current cache size an eviction pass frees beyond the request
    pub eviction_slack: f64,

    /// Entry table capacity at creation
    pub initial_capacity: usize,

    /// Entry table growth increment
    pub capacity_step: usize,

    /// Fire the miss hook every this many misses (0 disables it)
    pub miss_tick_interval: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 8 * 1024 * 1024,
            allocation_attempts: 10,
            growth_factor: 0.25,
            eviction_slack: 0.2,
            initial_capacity: 100,
            capacity_step: 50,
            miss_tick_interval: 4,
        }
    }
}

impl CacheConfig {
    /// Defaults with a different budget
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            max_size,
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, then apply `HEAPCACHE_*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with `HEAPCACHE_*` environment overrides
    pub fn from_env() -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("max_size must be positive".to_string()));
        }
        if self.allocation_attempts == 0 {
            return Err(Error::Config(
                "allocation_attempts must be at least 1".to_string(),
            ));
        }
        if !self.growth_factor.is_finite() || self.growth_factor <= 0.0 {
            return Err(Error::Config(format!(
                "growth_factor must be positive, got {}",
                self.growth_factor
            )));
        }
        if !self.eviction_slack.is_finite() || self.eviction_slack < 0.0 {
            return Err(Error::Config(format!(
                "eviction_slack must not be negative, got {}",
                self.eviction_slack
            )));
        }
        if self.capacity_step == 0 {
            return Err(Error::Config("capacity_step must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.allocation_attempts, 10);
        assert_eq!(config.initial_capacity, 100);
        assert_eq!(config.capacity_step, 50);
        assert_eq!(config.miss_tick_interval, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() -> Result<()> {
        let config = CacheConfig::from_toml_str("max_size = 4096\nmiss_tick_interval = 0\n")?;
        assert_eq!(config.max_size, 4096);
        assert_eq!(config.miss_tick_interval, 0);
        assert_eq!(config.growth_factor, 0.25);

        assert_eq!(CacheConfig::from_toml_str("")?, CacheConfig::default());
        Ok(())
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            CacheConfig::from_toml_str("max_size = 0"),
            Err(Error::Config(_))
        ));
        assert!(CacheConfig::from_toml_str("growth_factor = -1.0").is_err());
        assert!(CacheConfig::from_toml_str("capacity_step = 0").is_err());
        assert!(CacheConfig::from_toml_str("max_size = \"big\"").is_err());
    }

    #[test]
    fn test_load_file() -> Result<()> {
        let path =
            std::env::temp_dir().join(format!("heapcache_config_{}.toml", std::process::id()));
        std::fs::write(&path, "max_size = 65536\neviction_slack = 0.5\n")
            .map_err(|e| Error::Config(e.to_string()))?;

        let config = CacheConfig::load(&path);
        let _ = std::fs::remove_file(&path);

        let config = config?;
        assert_eq!(config.max_size, 65536);
        assert_eq!(config.eviction_slack, 0.5);
        assert_eq!(config.capacity_step, 50);
        Ok(())
    }
}
