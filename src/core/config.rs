//! KF-003: Engine configuration.
//!
//! Layered: built-in defaults, then an optional TOML file, then `KFORM_*`
//! environment variables.

use super::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables shared by every executor in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum loop instances of one vertex running concurrently
    #[serde(default = "default_max_instances")]
    pub max_instance_concurrency: usize,

    /// Seconds between "still waiting" log lines
    #[serde(default = "default_liveness_secs")]
    pub liveness_interval_secs: u64,

    /// Upper bound on the `count` of one block
    #[serde(default = "default_max_loop_instances")]
    pub max_loop_instances: usize,
}

fn default_max_instances() -> usize {
    16
}

fn default_liveness_secs() -> u64 {
    5
}

fn default_max_loop_instances() -> usize {
    100_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_instance_concurrency: default_max_instances(),
            liveness_interval_secs: default_liveness_secs(),
            max_loop_instances: default_max_loop_instances(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML config document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Apply environment overrides:
    /// - `KFORM_MAX_INSTANCES`: instance fan-out bound
    /// - `KFORM_LIVENESS_SECS`: liveness log interval
    /// - `KFORM_MAX_LOOP_INSTANCES`: `count` ceiling
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("KFORM_MAX_INSTANCES") {
            self.max_instance_concurrency = n;
        }
        if let Some(secs) = env_parse::<u64>("KFORM_LIVENESS_SECS") {
            self.liveness_interval_secs = secs;
        }
        if let Some(n) = env_parse::<usize>("KFORM_MAX_LOOP_INSTANCES") {
            self.max_loop_instances = n;
        }
        self.normalized()
    }

    pub fn with_max_instance_concurrency(mut self, max: usize) -> Self {
        self.max_instance_concurrency = max;
        self.normalized()
    }

    pub fn with_liveness_interval_secs(mut self, secs: u64) -> Self {
        self.liveness_interval_secs = secs;
        self.normalized()
    }

    pub fn with_max_loop_instances(mut self, max: usize) -> Self {
        self.max_loop_instances = max;
        self
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    // Zero would deadlock the semaphore or spin the ticker.
    pub fn normalized(mut self) -> Self {
        self.max_instance_concurrency = self.max_instance_concurrency.max(1);
        self.liveness_interval_secs = self.liveness_interval_secs.max(1);
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
