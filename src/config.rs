//! Configuration management for QuotaGuard.
//!
//! Settings are layered: a YAML file first, then environment variables
//! prefixed with `QUOTAGUARD_`, using `__` between nested keys
//! (for example `QUOTAGUARD_STORE__REDIS_URL`).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::clock::Clock;
use crate::error::{QuotaGuardError, Result};
use crate::ratelimit::{LimiterRegistry, RuleSet};
use crate::store::{MemoryStore, RedisStore, StoreSet, DEFAULT_MAX_ENTRIES};

/// Main configuration for QuotaGuard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaGuardConfig {
    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Limiter and composite rules
    #[serde(default)]
    pub rules: RuleSet,
}

/// Which store backs window and log state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process only
    #[default]
    Memory,
    /// Shared through Redis
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Maximum number of keys held by the in-process store
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Interval between sweeps of expired in-process entries
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Default bound on a single store round trip in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            max_entries: default_max_entries(),
            sweep_interval_secs: default_sweep_interval(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_timeout_ms() -> u64 {
    250
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
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

impl StoreConfig {
    /// Sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Default store timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl QuotaGuardConfig {
    /// Load configuration from a YAML file, overlaid with environment variables.
    pub fn from_file(path: &str) -> Result<Self> {
        info!(path = %path, "Loading configuration");

        let config: QuotaGuardConfig = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix("QUOTAGUARD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QuotaGuardConfig = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check settings that can be validated without building limiters.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(QuotaGuardError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        if self.store.max_entries == 0 {
            return Err(QuotaGuardError::Config(
                "store.max_entries must be greater than zero".to_string(),
            ));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(QuotaGuardError::Config(
                "store.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(QuotaGuardError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Open the configured stores.
    pub async fn build_stores(&self) -> Result<StoreSet> {
        let local = Arc::new(MemoryStore::with_max_entries(self.store.max_entries));

        match (self.store.backend, &self.store.redis_url) {
            (StoreBackend::Redis, Some(url)) => {
                let redis = RedisStore::connect(url).await?;
                Ok(StoreSet::redis(redis, local))
            }
            (StoreBackend::Redis, None) => Err(QuotaGuardError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            )),
            (StoreBackend::Memory, _) => Ok(StoreSet::memory(local)),
        }
    }

    /// Build every configured limiter against `stores`.
    pub fn build_registry(
        &self,
        stores: &StoreSet,
        clock: Arc<dyn Clock>,
    ) -> Result<LimiterRegistry> {
        LimiterRegistry::build(&self.rules, stores, clock, self.store.timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_defaults() {
        let config = QuotaGuardConfig::default();

        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.max_entries, DEFAULT_MAX_ENTRIES);
        assert_eq!(config.store.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.store.timeout(), Duration::from_millis(250));
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.rules.limiters.is_empty());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
store:
  backend: memory
  max_entries: 500
  sweep_interval_secs: 5
logging:
  level: debug
  json: true
rules:
  limiters:
    - name: api
      algorithm: fixed_window
      max_requests: 20
      window_ms: 60000
"#;
        let config = QuotaGuardConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.store.max_entries, 500);
        assert_eq!(config.store.sweep_interval_secs, 5);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.rules.limiters.len(), 1);
        assert_eq!(config.rules.limiters[0].max_requests, Some(20));
    }

    #[test]
    fn test_redis_requires_url() {
        let yaml = r#"
store:
  backend: redis
"#;
        let err = QuotaGuardConfig::from_yaml(yaml).err().unwrap();
        assert!(err.to_string().contains("redis_url"));
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(QuotaGuardConfig::from_yaml("store:\n  max_entries: 0\n").is_err());
        assert!(QuotaGuardConfig::from_yaml("store:\n  timeout_ms: 0\n").is_err());
        assert!(QuotaGuardConfig::from_yaml("store:\n  sweep_interval_secs: 0\n").is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(QuotaGuardConfig::from_file("/nonexistent/quotaguard.yaml").is_err());
    }

    #[tokio::test]
    async fn test_build_memory_registry() {
        let yaml = r#"
rules:
  limiters:
    - name: api
      algorithm: sliding_window
      max_requests: 2
      window_ms: 1000
"#;
        let config = QuotaGuardConfig::from_yaml(yaml).unwrap();
        let stores = config.build_stores().await.unwrap();
        let registry = config
            .build_registry(&stores, Arc::new(ManualClock::new(0)))
            .unwrap();

        let api = registry.get("api").unwrap();
        assert!(api.check("user:1").await.allowed);
        assert!(api.check("user:1").await.allowed);
        assert!(!api.check("user:1").await.allowed);
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_to_build() {
        let config = QuotaGuardConfig {
            store: StoreConfig {
                backend: StoreBackend::Redis,
                redis_url: Some("redis://127.0.0.1:1".to_string()),
                ..StoreConfig::default()
            },
            ..QuotaGuardConfig::default()
        };

        assert!(matches!(
            config.build_stores().await,
            Err(QuotaGuardError::Store(_))
        ));
    }
}
