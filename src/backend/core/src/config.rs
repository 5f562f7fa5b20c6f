//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{ApexError, Result};
use crate::telemetry::LoggingConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Job executor configuration
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Concurrent ungrouped jobs
    #[serde(default = "default_free_pool_size")]
    pub free_pool_size: usize,

    /// Default worker count of a group pool
    #[serde(default = "default_grouped_pool_size")]
    pub grouped_pool_size: usize,

    /// Default idle time before a group pool is torn down
    #[serde(default = "default_grouped_keep_alive", with = "humantime_serde")]
    pub grouped_keep_alive: Duration,

    /// Resolved group initializers kept in the cache
    #[serde(default = "default_grouped_initializer_cache_size")]
    pub grouped_initializer_cache_size: usize,

    /// Finished job statuses kept by the in-memory store
    #[serde(default = "default_job_status_cache_size")]
    pub job_status_cache_size: usize,

    /// Per-group overrides, matched by nearest ancestor
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            free_pool_size: default_free_pool_size(),
            grouped_pool_size: default_grouped_pool_size(),
            grouped_keep_alive: default_grouped_keep_alive(),
            grouped_initializer_cache_size: default_grouped_initializer_cache_size(),
            job_status_cache_size: default_job_status_cache_size(),
            groups: Vec::new(),
        }
    }
}

/// Pool settings for one group path prefix.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    /// Group path segments
    pub path: Vec<String>,

    #[serde(default = "default_grouped_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_grouped_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
}

// Default value functions
fn default_free_pool_size() -> usize { 16 }
fn default_grouped_pool_size() -> usize { 1 }
fn default_grouped_keep_alive() -> Duration { Duration::from_secs(60) }
fn default_grouped_initializer_cache_size() -> usize { 256 }
fn default_job_status_cache_size() -> usize { 1000 }

impl Config {
    /// Load configuration from the environment (`APEX_JOBS__EXECUTOR__FREE_POOL_SIZE=8`).
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("APEX_JOBS").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("APEX_JOBS").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings no executor can run with.
    pub fn validate(&self) -> Result<()> {
        if self.executor.free_pool_size == 0 {
            return Err(ApexError::configuration(
                "executor.free_pool_size must be at least 1",
            ));
        }
        if let Some(group) = self.executor.groups.iter().find(|g| g.path.is_empty()) {
            return Err(ApexError::configuration(format!(
                "executor.groups entry with pool_size {} has an empty path",
                group.pool_size
            )));
        }
        Ok(())
    }
}
