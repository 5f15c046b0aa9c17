//! Controller configuration: defaults, `TETHER_*` environment overrides and validation.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("workers must be at least 1")]
    NoWorkers,
    #[error("max items per second must be a positive number, got {0}")]
    InvalidRate(f64),
    #[error("burst must be at least 1")]
    NoBurst,
    #[error("backoff base {base:?} exceeds backoff max {max:?}")]
    BackoffRange { base: Duration, max: Duration },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Queue name, used as the metrics label.
    pub name: String,
    /// Re-deliver every cached object this often; zero disables resync.
    pub resync_period: Duration,
    pub workers: usize,
    /// Failed attempts tolerated before a key is dropped.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Global cap on rate-limited re-deliveries.
    pub max_items_per_sec: f64,
    pub burst: u32,
    /// Ceiling for list/watch reconnect backoff.
    pub watch_backoff_max: Duration,
    /// Give up if the initial listing has not landed within this window.
    pub sync_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "controller".to_string(),
            resync_period: Duration::from_secs(30),
            workers: 2,
            max_retries: 5,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            max_items_per_sec: 10.0,
            burst: 100,
            watch_backoff_max: Duration::from_secs(30),
            sync_timeout: None,
        }
    }
}

fn env_parse<T: FromStr>(var: &str) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by any `TETHER_*` variables that are set.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<u64>("TETHER_RESYNC_SECS") { cfg.resync_period = Duration::from_secs(v); }
        if let Some(v) = env_parse("TETHER_WORKERS") { cfg.workers = v; }
        if let Some(v) = env_parse("TETHER_MAX_RETRIES") { cfg.max_retries = v; }
        if let Some(v) = env_parse::<u64>("TETHER_BACKOFF_BASE_MS") { cfg.backoff_base = Duration::from_millis(v); }
        if let Some(v) = env_parse::<u64>("TETHER_BACKOFF_MAX_SECS") { cfg.backoff_max = Duration::from_secs(v); }
        if let Some(v) = env_parse("TETHER_QPS") { cfg.max_items_per_sec = v; }
        if let Some(v) = env_parse("TETHER_BURST") { cfg.burst = v; }
        if let Some(v) = env_parse::<u64>("TETHER_WATCH_BACKOFF_MAX_SECS") { cfg.watch_backoff_max = Duration::from_secs(v); }
        if let Some(v) = env_parse::<u64>("TETHER_SYNC_TIMEOUT_SECS") { cfg.sync_timeout = Some(Duration::from_secs(v)); }
        cfg
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if !self.max_items_per_sec.is_finite() || self.max_items_per_sec <= 0.0 {
            return Err(ConfigError::InvalidRate(self.max_items_per_sec));
        }
        if self.burst == 0 {
            return Err(ConfigError::NoBurst);
        }
        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::BackoffRange { base: self.backoff_base, max: self.backoff_max });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(ControllerConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_values() {
        let base = ControllerConfig::default();
        assert_eq!(ControllerConfig { workers: 0, ..base.clone() }.validate(), Err(ConfigError::NoWorkers));
        assert!(matches!(
            ControllerConfig { max_items_per_sec: f64::NAN, ..base.clone() }.validate(),
            Err(ConfigError::InvalidRate(_))
        ));
        assert_eq!(ControllerConfig { max_items_per_sec: 0.0, ..base.clone() }.validate(), Err(ConfigError::InvalidRate(0.0)));
        assert_eq!(ControllerConfig { burst: 0, ..base.clone() }.validate(), Err(ConfigError::NoBurst));
        assert!(matches!(
            ControllerConfig { backoff_base: Duration::from_secs(10), backoff_max: Duration::from_secs(1), ..base }.validate(),
            Err(ConfigError::BackoffRange { .. })
        ));
    }

    #[test]
    fn env_overrides_apply() {
        // names unique to this test; no other test reads them
        std::env::set_var("TETHER_WORKERS", "7");
        std::env::set_var("TETHER_RESYNC_SECS", "0");
        std::env::set_var("TETHER_QPS", "not-a-number");
        let cfg = ControllerConfig::from_env();
        std::env::remove_var("TETHER_WORKERS");
        std::env::remove_var("TETHER_RESYNC_SECS");
        std::env::remove_var("TETHER_QPS");
        assert_eq!(cfg.workers, 7);
        assert_eq!(cfg.resync_period, Duration::ZERO);
        assert_eq!(cfg.max_items_per_sec, 10.0);
    }
}
