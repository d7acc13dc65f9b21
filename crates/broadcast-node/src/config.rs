//! Configuration loading and management

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use broadcast_core::EngineConfig;
use serde::{Deserialize, Serialize};

/// Main configuration for a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Dissemination engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Forward delivery settings
    #[serde(default)]
    pub rpc: RetryConfig,
}

/// Timeout and retry behavior for forwards sent to other nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// How long to wait for an acknowledgement per attempt (default: 1s)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum attempts per forward (None = retry until acknowledged)
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Delay before the first retry (default: 100ms)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Cap on the delay between retries (default: 2s)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Randomize each delay within [delay/2, delay]
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_attempts: None,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_true(),
        }
    }
}

impl RetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check if `attempts` used up the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.map(|max| attempts >= max).unwrap_or(false)
    }
}

/// Calculates the delay before retry number `attempt` (1-based) using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let delay_ms = config.initial_backoff_ms as f64
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_millis(delay_ms.min(config.max_backoff_ms as f64) as u64)
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl NodeConfig {
    /// Load configuration from a JSON file, falling back to defaults if it doesn't exist
    pub fn load(config_file: &Path) -> Result<Self> {
        if config_file.exists() {
            let content = std::fs::read_to_string(config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: NodeConfig = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", config_file))?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            Ok(NodeConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broadcast_core::AckMode;

    // ==================== Backoff calculation ====================

    #[test]
    fn test_calculate_backoff_exponential() {
        let config = RetryConfig::default();

        // 100ms, 200ms, 400ms, ... capped at 2s
        assert_eq!(calculate_backoff(1, &config), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(200));
        assert_eq!(calculate_backoff(3, &config), Duration::from_millis(400));
        assert_eq!(calculate_backoff(5, &config), Duration::from_millis(1600));
        assert_eq!(calculate_backoff(6, &config), Duration::from_millis(2000));
        assert_eq!(calculate_backoff(30, &config), Duration::from_millis(2000));
    }

    #[test]
    fn test_calculate_backoff_custom_config() {
        let config = RetryConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            backoff_factor: 3.0,
            ..Default::default()
        };

        // 10ms, 30ms, 90ms, 100ms (capped)
        assert_eq!(calculate_backoff(1, &config), Duration::from_millis(10));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(30));
        assert_eq!(calculate_backoff(3, &config), Duration::from_millis(90));
        assert_eq!(calculate_backoff(4, &config), Duration::from_millis(100));
    }

    #[test]
    fn test_exhausted() {
        let unlimited = RetryConfig::default();
        assert!(!unlimited.exhausted(1000));

        let limited = RetryConfig {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(!limited.exhausted(2));
        assert!(limited.exhausted(3));
    }

    // ==================== Loading ====================

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load(&dir.path().join("node.json")).unwrap();
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(
            &path,
            r#"{"engine": {"ack_mode": "after-fanout"}, "rpc": {"timeout_ms": 250, "max_attempts": 4}}"#,
        )
        .unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.engine.ack_mode, AckMode::AfterFanout);
        assert!(config.engine.dedup);
        assert_eq!(config.rpc.timeout(), Duration::from_millis(250));
        assert_eq!(config.rpc.max_attempts, Some(4));
        assert_eq!(config.rpc.initial_backoff_ms, 100);
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = NodeConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
