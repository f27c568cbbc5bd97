//! Configuration for the tiered cache

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable overriding [`TieredCacheConfig::local_dir`]
pub const ENV_LOCAL_DIR: &str = "STRATA_LOCAL_CACHE_DIR";
/// Environment variable overriding [`TieredCacheConfig::prefix`]
pub const ENV_PREFIX: &str = "STRATA_PREFIX";
/// Environment variable overriding [`TieredCacheConfig::queue_len`]
pub const ENV_QUEUE_LEN: &str = "STRATA_QUEUE_LEN";
/// Environment variable overriding [`TieredCacheConfig::workers`]
pub const ENV_WORKERS: &str = "STRATA_WORKERS";

/// Settings for [`crate::TieredCache`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TieredCacheConfig {
    /// Directory of the local disk tier
    #[serde(default = "default_local_dir")]
    pub local_dir: PathBuf,

    /// Key prefix for remote objects
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Replication queue capacity; 0 makes every put wait for a free worker
    #[serde(default)]
    pub queue_len: usize,

    /// Number of replication workers
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for TieredCacheConfig {
    fn default() -> Self {
        Self {
            local_dir: default_local_dir(),
            prefix: default_prefix(),
            queue_len: 0,
            workers: default_workers(),
        }
    }
}

impl TieredCacheConfig {
    /// Defaults rooted at `local_dir`
    #[must_use]
    pub fn new(local_dir: impl Into<PathBuf>) -> Self {
        Self {
            local_dir: local_dir.into(),
            ..Self::default()
        }
    }

    /// Set the remote key prefix
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the replication queue capacity
    #[must_use]
    pub fn with_queue_len(mut self, queue_len: usize) -> Self {
        self.queue_len = queue_len;
        self
    }

    /// Set the number of replication workers
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Defaults overridden by any `STRATA_*` variables that are set
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = get(ENV_LOCAL_DIR) {
            config.local_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = get(ENV_PREFIX) {
            config.prefix = prefix;
        }
        if let Some(raw) = get(ENV_QUEUE_LEN) {
            config.queue_len = parse_count(ENV_QUEUE_LEN, &raw)?;
        }
        if let Some(raw) = get(ENV_WORKERS) {
            config.workers = parse_count(ENV_WORKERS, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the settings can start a cache
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::configuration("workers must be at least 1"));
        }
        if self.prefix.is_empty() {
            return Err(Error::configuration("prefix must not be empty"));
        }
        if self.prefix.ends_with('/') {
            return Err(Error::configuration(format!(
                "prefix '{}' must not end with '/'",
                self.prefix
            )));
        }
        if self.local_dir.as_os_str().is_empty() {
            return Err(Error::configuration("local_dir must not be empty"));
        }
        Ok(())
    }
}

fn parse_count(name: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .map_err(|e| Error::configuration(format!("{name}={raw:?} is not a valid count: {e}")))
}

fn default_local_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("strata")
}

fn default_prefix() -> String {
    "go-cache".to_string()
}

fn default_workers() -> usize {
    1
}
