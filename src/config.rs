//! Rate limiter configuration, loaded from YAML.
//!
//! ```yaml
//! max_requests: 30
//! window_ms: 60000
//! gc_interval_secs: 600   # null disables the garbage collector
//! fail_open: true
//! ```

#[cfg(feature = "dashmap")]
use crate::backend::memory::InMemoryBackend;
use crate::backend::store::{RequestCounter, StoreBackend};
use crate::policy::WindowPolicy;
use crate::ValidationError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(#[from] ValidationError),
}

/// Settings for a single rate limit policy and the backend enforcing it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum number of requests admitted per window
    pub max_requests: u64,

    /// Window length in milliseconds
    pub window_ms: u64,

    /// Interval between garbage collector sweeps of the in-memory backend
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: Option<u64>,

    /// Whether a store backend admits requests when the request count is unavailable
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
}

fn default_gc_interval_secs() -> Option<u64> {
    Some(600)
}

fn default_fail_open() -> bool {
    true
}

impl RateLimitConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, Error> {
        let config: RateLimitConfig = serde_yaml::from_str(yaml)?;
        config.policy()?;
        Ok(config)
    }

    pub fn policy(&self) -> Result<WindowPolicy, ValidationError> {
        WindowPolicy::new(self.max_requests, self.window_ms)
    }

    pub fn gc_interval(&self) -> Option<Duration> {
        self.gc_interval_secs.map(Duration::from_secs)
    }

    /// Builds an [InMemoryBackend] for this policy.
    ///
    /// When a garbage collector interval is set, this must be called within an actix runtime.
    #[cfg(feature = "dashmap")]
    #[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
    pub fn memory_backend(&self) -> Result<InMemoryBackend, Error> {
        Ok(InMemoryBackend::builder(self.policy()?)
            .with_gc_interval(self.gc_interval())
            .build())
    }

    /// Builds a [StoreBackend] for this policy, counting requests with `counter`.
    pub fn store_backend<C: RequestCounter>(&self, counter: C) -> Result<StoreBackend<C>, Error> {
        Ok(StoreBackend::builder(self.policy()?, counter)
            .fail_open(self.fail_open)
            .build())
    }
}
