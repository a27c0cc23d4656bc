use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::error::{AnalyticsError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "expa-analytics.toml";
pub const ENV_PREFIX: &str = "EXPA";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Endpoint that receives event batches
    #[serde(default)]
    pub api_url: Option<Url>,
    /// Fixed anonymous id; generated when unset
    #[serde(default)]
    pub anonymous_id: Option<String>,
    /// Queue length that triggers a background flush
    #[serde(default = "default_flush_at")]
    pub flush_at: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Events per request
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Directory for the persisted queue and identity. Memory only when unset.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_flush_at() -> usize {
    20
}
fn default_flush_interval_ms() -> u64 {
    30_000
}
fn default_max_queue_size() -> usize {
    1000
}
fn default_max_batch_size() -> usize {
    100
}
fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            anonymous_id: None,
            flush_at: default_flush_at(),
            flush_interval_ms: default_flush_interval_ms(),
            max_queue_size: default_max_queue_size(),
            max_batch_size: default_max_batch_size(),
            request_timeout_ms: default_request_timeout_ms(),
            storage_dir: None,
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AnalyticsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.flush_at == 0 {
            return Err(AnalyticsError::invalid_config("flush_at must be > 0"));
        }
        if self.flush_interval_ms == 0 {
            return Err(AnalyticsError::invalid_config("flush_interval_ms must be > 0"));
        }
        if self.max_queue_size == 0 {
            return Err(AnalyticsError::invalid_config("max_queue_size must be > 0"));
        }
        if self.max_queue_size < self.flush_at {
            return Err(AnalyticsError::invalid_config(
                "max_queue_size must be >= flush_at",
            ));
        }
        if self.max_batch_size == 0 {
            return Err(AnalyticsError::invalid_config("max_batch_size must be > 0"));
        }
        if self.request_timeout_ms == 0 {
            return Err(AnalyticsError::invalid_config("request_timeout_ms must be > 0"));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(AnalyticsError::invalid_config("retry.base_delay_ms must be > 0"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(AnalyticsError::invalid_config(
                "retry.max_delay_ms must be >= retry.base_delay_ms",
            ));
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(AnalyticsError::invalid_config(format!(
                "logging.level must be one of {valid_levels:?}"
            )));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn queue_path(&self) -> Option<PathBuf> {
        self.storage_dir.as_ref().map(|dir| dir.join("queue.json"))
    }

    pub fn identity_path(&self) -> Option<PathBuf> {
        self.storage_dir.as_ref().map(|dir| dir.join("identity.json"))
    }
}

/// Backoff applied to timer-driven flushes after a retryable failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay before the next attempt after `attempts` consecutive failures:
    /// base, 2x base, 4x base, ... capped at max.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::{AnalyticsConfig, DEFAULT_CONFIG_FILE, ENV_PREFIX};
    use crate::error::{AnalyticsError, Result};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Load settings from `path` (or `expa-analytics.toml` in the working
    /// directory) overlaid with `EXPA__*` environment variables, then validate.
    pub fn load_config(path: Option<&str>) -> Result<AnalyticsConfig> {
        let mut builder = Config::builder();
        let file = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if file.exists() {
            builder = builder.add_source(File::from(file));
        } else if let Some(p) = path {
            return Err(AnalyticsError::invalid_config(format!(
                "config file not found: {p}"
            )));
        }
        // e.g. EXPA__FLUSH_AT=50, EXPA__RETRY__MAX_DELAY_MS=120000
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| AnalyticsError::invalid_config(format!("config build error: {e}")))?;
        let merged: AnalyticsConfig = cfg.try_deserialize().map_err(|e| {
            AnalyticsError::invalid_config(format!("config deserialize error: {e}"))
        })?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AnalyticsConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.flush_at, 20);
        assert_eq!(cfg.flush_interval(), Duration::from_secs(30));
        assert!(cfg.queue_path().is_none());
    }

    #[test]
    fn test_queue_smaller_than_flush_threshold_rejected() {
        let cfg = AnalyticsConfig {
            flush_at: 50,
            max_queue_size: 10,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_queue_size must be >= flush_at"));
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut cfg = AnalyticsConfig::default();
        cfg.logging.level = "loud".into();
        assert!(matches!(
            cfg.validate(),
            Err(AnalyticsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(1_000));
        assert_eq!(retry.backoff(2), Duration::from_millis(2_000));
        assert_eq!(retry.backoff(3), Duration::from_millis(4_000));
        assert_eq!(retry.backoff(4), Duration::from_millis(5_000));
        assert_eq!(retry.backoff(100), Duration::from_millis(5_000));
    }

    #[test]
    fn test_storage_paths() {
        let cfg = AnalyticsConfig {
            storage_dir: Some(PathBuf::from("/var/lib/expa")),
            ..Default::default()
        };
        assert_eq!(cfg.queue_path(), Some(PathBuf::from("/var/lib/expa/queue.json")));
        assert_eq!(
            cfg.identity_path(),
            Some(PathBuf::from("/var/lib/expa/identity.json"))
        );
    }
}
