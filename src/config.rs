//! Configuration management for Ratewindow.

use std::num::NonZeroU32;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, WindowError};
use crate::ratelimit::{CounterOptions, DEFAULT_MAX_RETRY, DEFAULT_PREFIX};

/// Environment variable prefix, e.g. `RATEWINDOW__REDIS__URL`.
const ENV_PREFIX: &str = "RATEWINDOW";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for Ratewindow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatewindowConfig {
    /// Counter configuration
    #[serde(default)]
    pub counter: CounterConfig,

    /// Redis connection configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Counter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Namespace for every window key
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Attempts per operation under contention; values below 1 mean 1
    #[serde(default = "default_max_retry")]
    pub max_retry: i64,

    /// Upper bound of the random pause between attempts, 0 for none
    #[serde(default)]
    pub retry_jitter_ms: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            max_retry: default_max_retry(),
            retry_jitter_ms: 0,
        }
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_max_retry() -> i64 {
    i64::from(DEFAULT_MAX_RETRY)
}

impl CounterConfig {
    /// Validate into counter options.
    ///
    /// A non-positive `max_retry` is raised to 1.
    pub fn validate(&self) -> Result<CounterOptions> {
        if self.prefix.is_empty() {
            return Err(WindowError::Config("counter prefix must not be empty".to_string()));
        }

        let max_retry = u32::try_from(self.max_retry.max(1)).unwrap_or(u32::MAX);
        if i64::from(max_retry) != self.max_retry {
            warn!(
                configured = self.max_retry,
                effective = max_retry,
                "Adjusted max_retry into the supported range"
            );
        }

        Ok(CounterOptions {
            prefix: self.prefix.clone(),
            max_retry: NonZeroU32::new(max_retry).unwrap_or(NonZeroU32::MIN),
            retry_jitter: Duration::from_millis(self.retry_jitter_ms),
        })
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Maximum pooled connections; bounds concurrent transactions
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// How long to wait for a pooled connection, in milliseconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connection_timeout_ms: default_connection_timeout(),
        }
    }
}

impl RedisConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_pool_size() -> u32 {
    16
}

fn default_connection_timeout() -> u64 {
    5000
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RatewindowConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WindowError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional file, then apply `RATEWINDOW__*`
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| WindowError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RatewindowConfig::default();
        assert_eq!(config.counter.prefix, "limiter");
        assert_eq!(config.counter.max_retry, 3);
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379");
        assert_eq!(config.redis.connection_timeout(), Duration::from_secs(5));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
counter:
  prefix: rl
redis:
  url: redis://cache:6379/2
"#;
        let config = RatewindowConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.counter.prefix, "rl");
        assert_eq!(config.counter.max_retry, 3);
        assert_eq!(config.redis.url, "redis://cache:6379/2");
        assert_eq!(config.redis.pool_size, 16);
    }

    #[test]
    fn test_invalid_yaml() {
        let err = RatewindowConfig::from_yaml("counter: [1, 2").unwrap_err();
        assert!(matches!(err, WindowError::Config(_)));
    }

    #[test]
    fn test_max_retry_is_clamped() {
        for (configured, effective) in [(-4, 1), (0, 1), (1, 1), (7, 7)] {
            let config = CounterConfig {
                max_retry: configured,
                ..CounterConfig::default()
            };
            let options = config.validate().unwrap();
            assert_eq!(options.max_retry.get(), effective, "max_retry {configured}");
        }

        let config = CounterConfig {
            max_retry: i64::MAX,
            ..CounterConfig::default()
        };
        assert_eq!(config.validate().unwrap().max_retry.get(), u32::MAX);
    }

    #[test]
    fn test_empty_prefix_rejected() {
        let config = CounterConfig {
            prefix: String::new(),
            ..CounterConfig::default()
        };
        assert!(matches!(config.validate(), Err(WindowError::Config(_))));
    }

    #[test]
    fn test_jitter_option() {
        let config = CounterConfig {
            retry_jitter_ms: 25,
            ..CounterConfig::default()
        };
        assert_eq!(
            config.validate().unwrap().retry_jitter,
            Duration::from_millis(25)
        );
    }

    #[test]
    fn test_load_file_with_env_override() {
        let path = std::env::temp_dir().join(format!(
            "ratewindow-config-{}.yaml",
            std::process::id()
        ));
        std::fs::write(&path, "counter:\n  prefix: fromfile\n  max_retry: 9\n").unwrap();

        std::env::set_var("RATEWINDOW__REDIS__POOL_SIZE", "4");
        let config = RatewindowConfig::load(path.to_str()).unwrap();
        std::env::remove_var("RATEWINDOW__REDIS__POOL_SIZE");
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.counter.prefix, "fromfile");
        assert_eq!(config.counter.max_retry, 9);
        assert_eq!(config.redis.pool_size, 4);
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379");
    }
}
