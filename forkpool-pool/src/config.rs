//! Pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lag below this keeps a worker in the preferred scheduling bucket, in
/// milliseconds
pub const LAG_BUCKET_FLOOR: f64 = 3.0;

/// Lag above this makes a worker probabilistically refuse new work, in
/// milliseconds
pub const LAG_REJECT_FLOOR: f64 = 70.0;

/// Pool sizing and lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live worker processes
    pub limit: usize,

    /// How long a worker may sit with no running calls before it is reaped,
    /// in milliseconds
    pub idle_timeout_ms: u64,

    /// How often the reaper sweeps, in milliseconds
    pub reap_interval_ms: u64,

    /// Deadline for one call's callback; `None` disables expiry. In
    /// milliseconds.
    pub call_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            limit: 3,
            idle_timeout_ms: 30_000,
            reap_interval_ms: 10_000,
            call_timeout_ms: Some(300_000),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PoolConfig::default();
        assert_eq!(config.limit, 3);
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.reap_interval(), Duration::from_secs(10));
        assert_eq!(config.call_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: PoolConfig = serde_json::from_str(r#"{"limit": 8}"#).unwrap();
        assert_eq!(config.limit, 8);
        assert_eq!(config.idle_timeout_ms, 30_000);
    }

    #[test]
    fn call_timeout_can_be_disabled() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"call_timeout_ms": null}"#).unwrap();
        assert_eq!(config.call_timeout(), None);
    }
}
