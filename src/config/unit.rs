//! Processing unit configuration structures.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Environment key for the admission queue capacity.
pub const ENV_QUEUE_CAPACITY: &str = "PPU_QUEUE_CAPACITY";
/// Environment key for the concurrency limit.
pub const ENV_CONCURRENCY_LIMIT: &str = "PPU_CONCURRENCY_LIMIT";
/// Environment key for the shutdown timeout in milliseconds; `0` disables it.
pub const ENV_SHUTDOWN_TIMEOUT_MS: &str = "PPU_SHUTDOWN_TIMEOUT_MS";

/// Queue slots provisioned per unit of concurrency by [`UnitConfig::default`].
const DEFAULT_QUEUE_FACTOR: usize = 16;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

#[allow(clippy::unnecessary_wraps)]
const fn default_shutdown_timeout_ms() -> Option<u64> {
    Some(DEFAULT_SHUTDOWN_TIMEOUT_MS)
}

/// Configuration for a single processing unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Maximum jobs waiting for a slot before `submit` suspends.
    pub queue_capacity: usize,
    /// Maximum tasks running at once.
    pub concurrency_limit: usize,
    /// How long `stop` waits for in-flight tasks before aborting them.
    /// `None` waits indefinitely.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: Option<u64>,
}

impl Default for UnitConfig {
    /// One slot per CPU, a queue sixteen times as deep, and a ten second
    /// shutdown timeout.
    fn default() -> Self {
        let concurrency_limit = num_cpus::get().max(1);
        Self {
            queue_capacity: concurrency_limit * DEFAULT_QUEUE_FACTOR,
            concurrency_limit,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl UnitConfig {
    /// Configuration with the given bounds and no shutdown timeout.
    #[must_use]
    pub const fn new(queue_capacity: usize, concurrency_limit: usize) -> Self {
        Self {
            queue_capacity,
            concurrency_limit,
            shutdown_timeout_ms: None,
        }
    }

    /// Set the shutdown timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Shutdown timeout as a duration, if bounded.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_ms.map(Duration::from_millis)
    }

    /// Validate unit configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".into());
        }
        if self.concurrency_limit == 0 {
            return Err("concurrency_limit must be greater than 0".into());
        }
        if self.queue_capacity > Semaphore::MAX_PERMITS {
            return Err(format!(
                "queue_capacity must not exceed {}",
                Semaphore::MAX_PERMITS
            ));
        }
        if self.concurrency_limit > Semaphore::MAX_PERMITS {
            return Err(format!(
                "concurrency_limit must not exceed {}",
                Semaphore::MAX_PERMITS
            ));
        }
        if self.shutdown_timeout_ms == Some(0) {
            return Err("shutdown_timeout_ms must be greater than 0 when set".into());
        }
        Ok(())
    }

    /// Parse a unit configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build a configuration from the process environment, loading `.env`
    /// first when present. Unset keys keep their [`Default`] values.
    ///
    /// # Errors
    ///
    /// Returns a message naming the key that failed to parse or validate.
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(raw) = lookup(ENV_CONCURRENCY_LIMIT) {
            cfg.concurrency_limit = parse_env(ENV_CONCURRENCY_LIMIT, &raw)?;
            cfg.queue_capacity = cfg.concurrency_limit.saturating_mul(DEFAULT_QUEUE_FACTOR);
        }
        if let Some(raw) = lookup(ENV_QUEUE_CAPACITY) {
            cfg.queue_capacity = parse_env(ENV_QUEUE_CAPACITY, &raw)?;
        }
        if let Some(raw) = lookup(ENV_SHUTDOWN_TIMEOUT_MS) {
            let ms: u64 = parse_env(ENV_SHUTDOWN_TIMEOUT_MS, &raw)?;
            cfg.shutdown_timeout_ms = (ms > 0).then_some(ms);
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| format!("{key}: invalid value `{raw}`: {e}"))
}

/// Root configuration for a named set of units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitSetConfig {
    /// Map of unit name to configuration.
    pub units: HashMap<String, UnitConfig>,
}

impl UnitSetConfig {
    /// Validate all units and ensure at least one unit exists.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first invalid unit.
    pub fn validate(&self) -> Result<(), String> {
        if self.units.is_empty() {
            return Err("at least one unit must be defined".into());
        }
        for (name, unit) in &self.units {
            unit.validate()
                .map_err(|e| format!("unit `{name}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse a unit set from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
