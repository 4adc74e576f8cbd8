//! Configuration for the sync layer.
//!
//! Every section has `#[serde(default)]`, so a config file only needs the
//! values it overrides:
//!
//! ```json
//! {
//!   "dedup_capacity": 200,
//!   "rate_limits": {
//!     "message.send": { "max_actions": 5, "window_ms": 1000, "block_duration_ms": 3000 }
//!   },
//!   "offline": { "max_retries": 5 }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ConfigError;

/// Sliding-window limit for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_actions: u32,
    pub window_ms: u64,

    /// Cool-down applied once the window overflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_duration_ms: Option<u64>,
}

impl RateLimitConfig {
    pub fn new(max_actions: u32, window_ms: u64) -> Self {
        Self {
            max_actions,
            window_ms,
            block_duration_ms: None,
        }
    }

    pub fn with_block(mut self, block_duration_ms: u64) -> Self {
        self.block_duration_ms = Some(block_duration_ms);
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn block_duration(&self) -> Option<Duration> {
        self.block_duration_ms.map(Duration::from_millis)
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.max_actions == 0 {
            return Err(ConfigError::invalid(
                format!("{field}.max_actions"),
                "must be at least 1",
            ));
        }
        if self.window_ms == 0 {
            return Err(ConfigError::invalid(
                format!("{field}.window_ms"),
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Attempts before an action is dropped with `max-retries-exceeded`.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_queue_size: usize,

    /// Storage key of the persisted queue.
    pub storage_key: String,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_queue_size: 1_000,
            storage_key: "resync.offline_queue".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQueueConfig {
    /// Hard ceiling on any task's lifetime.
    pub max_timeout_ms: u64,
    pub max_size: usize,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_timeout_ms: 5_000,
            max_size: 32,
        }
    }
}

impl TaskQueueConfig {
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Capacity of each dedup window (sent and received).
    pub dedup_capacity: usize,
    pub max_payload_bytes: usize,

    /// Per-category limits, keyed by category name.
    pub rate_limits: BTreeMap<String, RateLimitConfig>,

    /// Limit for categories without their own entry; unlimited when unset.
    pub default_rate_limit: Option<RateLimitConfig>,

    pub offline: OfflineConfig,
    pub tasks: TaskQueueConfig,

    /// Duration of the completion task scheduled for each applied remote
    /// change. Disabled when unset.
    pub settle_ms: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 100,
            max_payload_bytes: 64 * 1024,
            rate_limits: BTreeMap::new(),
            default_rate_limit: None,
            offline: OfflineConfig::default(),
            tasks: TaskQueueConfig::default(),
            settle_ms: None,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn with_rate_limit(mut self, category: impl Into<String>, limit: RateLimitConfig) -> Self {
        self.rate_limits.insert(category.into(), limit);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dedup_capacity == 0 {
            return Err(ConfigError::invalid("dedup_capacity", "must be at least 1"));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::invalid("max_payload_bytes", "must be at least 1"));
        }
        for (category, limit) in &self.rate_limits {
            limit.validate(&format!("rate_limits.{category}"))?;
        }
        if let Some(limit) = &self.default_rate_limit {
            limit.validate("default_rate_limit")?;
        }
        if self.offline.max_retries == 0 {
            return Err(ConfigError::invalid("offline.max_retries", "must be at least 1"));
        }
        if self.offline.max_queue_size == 0 {
            return Err(ConfigError::invalid("offline.max_queue_size", "must be at least 1"));
        }
        if self.offline.max_delay_ms < self.offline.base_delay_ms {
            return Err(ConfigError::invalid(
                "offline.max_delay_ms",
                "must not be smaller than base_delay_ms",
            ));
        }
        if self.offline.storage_key.trim().is_empty() {
            return Err(ConfigError::invalid("offline.storage_key", "must not be empty"));
        }
        if self.tasks.max_size == 0 {
            return Err(ConfigError::invalid("tasks.max_size", "must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dedup_capacity, 100);
        assert_eq!(config.offline.max_retries, 3);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SyncConfig::from_json_str(
            r#"{
                "rate_limits": {
                    "message.send": { "max_actions": 3, "window_ms": 1000, "block_duration_ms": 2000 }
                },
                "offline": { "max_retries": 5 }
            }"#,
        )
        .unwrap();

        let limit = config.rate_limits["message.send"];
        assert_eq!(limit.max_actions, 3);
        assert_eq!(limit.block_duration(), Some(Duration::from_secs(2)));
        assert_eq!(config.offline.max_retries, 5);
        assert_eq!(config.offline.base_delay_ms, 1_000);
        assert_eq!(config.dedup_capacity, 100);
    }

    #[rstest]
    #[case::zero_capacity(r#"{"dedup_capacity": 0}"#, "dedup_capacity")]
    #[case::zero_retries(r#"{"offline": {"max_retries": 0}}"#, "offline.max_retries")]
    #[case::zero_actions(
        r#"{"rate_limits": {"chat": {"max_actions": 0, "window_ms": 10}}}"#,
        "rate_limits.chat.max_actions"
    )]
    #[case::delay_order(
        r#"{"offline": {"base_delay_ms": 10, "max_delay_ms": 5}}"#,
        "offline.max_delay_ms"
    )]
    fn invalid_values_are_rejected(#[case] json: &str, #[case] field: &str) {
        let err = SyncConfig::from_json_str(json).unwrap_err();
        assert!(
            matches!(&err, ConfigError::Invalid { field: f, .. } if f == field),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            SyncConfig::from_json_str("{"),
            Err(ConfigError::Parse(_))
        ));
    }
}
