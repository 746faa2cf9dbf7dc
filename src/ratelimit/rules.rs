//! Limiter rules configuration and the registry built from them.
//!
//! Rules declare named limiters and composites in YAML. Building a
//! [`LimiterRegistry`] validates every rule up front, so invalid parameters
//! fail at startup rather than at check time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::composite::CompositeLimiter;
use super::fixed_window::FixedWindowLimiter;
use super::limiter::{FailurePolicy, Limiter, LimiterOptions, WindowConfig};
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::{TokenBucketConfig, TokenBucketLimiter};
use super::token_quota::{TokenQuotaConfig, TokenQuotaLimiter};
use crate::clock::Clock;
use crate::error::{QuotaGuardError, Result};
use crate::store::StoreSet;

/// A complete set of limiter and composite rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    /// Individual limiters
    #[serde(default)]
    pub limiters: Vec<LimiterRule>,
    /// Composites over previously declared limiters or composites
    #[serde(default)]
    pub composites: Vec<CompositeRule>,
}

/// Counting algorithm of a limiter rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    TokenQuota,
}

/// A single named limiter.
///
/// Which parameters are required depends on the algorithm:
/// - `fixed_window`, `sliding_window`: `max_requests`, `window_ms`
/// - `token_bucket`: `max_tokens`, `refill_per_second`
/// - `token_quota`: `max_tokens`, `window_ms`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterRule {
    /// Unique name, also the default key prefix
    pub name: String,
    /// Counting algorithm
    pub algorithm: Algorithm,
    #[serde(default)]
    pub max_requests: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub refill_per_second: Option<f64>,
    /// Key prefix, defaults to the name
    #[serde(default)]
    pub key_prefix: Option<String>,
    /// Message attached to rejections
    #[serde(default)]
    pub message: Option<String>,
    /// Behaviour when the store fails
    #[serde(default)]
    pub on_store_error: FailurePolicy,
    /// Store round-trip timeout override
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Identities that bypass this limiter
    #[serde(default)]
    pub skip: Vec<String>,
}

/// A named composite of other rules, checked in the listed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeRule {
    /// Unique name
    pub name: String,
    /// Names of member limiters or earlier composites
    pub members: Vec<String>,
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| QuotaGuardError::Config(format!("Failed to parse limiter rules: {}", e)))
    }
}

impl LimiterRule {
    fn required(&self, field: &str, value: Option<u64>) -> Result<u64> {
        value.ok_or_else(|| {
            QuotaGuardError::Config(format!(
                "limiter '{}' ({:?}) requires {}",
                self.name, self.algorithm, field
            ))
        })
    }

    fn window(&self) -> Result<Duration> {
        Ok(Duration::from_millis(self.required("window_ms", self.window_ms)?))
    }

    fn options(&self, default_timeout: Duration) -> LimiterOptions {
        let mut options = LimiterOptions::new(self.key_prefix.as_deref().unwrap_or(&self.name))
            .on_store_error(self.on_store_error)
            .store_timeout(
                self.timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default_timeout),
            );
        if let Some(message) = &self.message {
            options = options.message(message.clone());
        }
        if !self.skip.is_empty() {
            let skip = self.skip.clone();
            options = options.skip(move |identity| skip.iter().any(|s| s == identity));
        }
        options
    }
}

/// Named limiters built from a [`RuleSet`].
#[derive(Default)]
pub struct LimiterRegistry {
    limiters: HashMap<String, Arc<dyn Limiter>>,
    quotas: HashMap<String, Arc<TokenQuotaLimiter>>,
    buckets: HashMap<String, Arc<TokenBucketLimiter>>,
}

impl LimiterRegistry {
    /// Validate `rules` and build every limiter against `stores`.
    pub fn build(
        rules: &RuleSet,
        stores: &StoreSet,
        clock: Arc<dyn Clock>,
        default_timeout: Duration,
    ) -> Result<Self> {
        let mut registry = Self::default();

        for rule in &rules.limiters {
            registry.ensure_unique(&rule.name)?;
            let options = rule.options(default_timeout);

            let limiter: Arc<dyn Limiter> = match rule.algorithm {
                Algorithm::FixedWindow => {
                    let config = WindowConfig::new(
                        rule.required("max_requests", rule.max_requests)?,
                        rule.window()?,
                    )?;
                    Arc::new(FixedWindowLimiter::new(
                        config,
                        options,
                        stores.windows.clone(),
                        clock.clone(),
                    )?)
                }
                Algorithm::SlidingWindow => {
                    let config = WindowConfig::new(
                        rule.required("max_requests", rule.max_requests)?,
                        rule.window()?,
                    )?;
                    Arc::new(SlidingWindowLimiter::new(
                        config,
                        options,
                        stores.logs.clone(),
                        clock.clone(),
                    )?)
                }
                Algorithm::TokenBucket => {
                    let refill = rule.refill_per_second.ok_or_else(|| {
                        QuotaGuardError::Config(format!(
                            "limiter '{}' (TokenBucket) requires refill_per_second",
                            rule.name
                        ))
                    })?;
                    let config = TokenBucketConfig::new(
                        rule.required("max_tokens", rule.max_tokens)?,
                        refill,
                    )?;
                    let bucket = Arc::new(TokenBucketLimiter::new(
                        config,
                        options,
                        stores.local.clone(),
                        clock.clone(),
                    )?);
                    registry.buckets.insert(rule.name.clone(), bucket.clone());
                    bucket
                }
                Algorithm::TokenQuota => {
                    let config = TokenQuotaConfig::new(
                        rule.required("max_tokens", rule.max_tokens)?,
                        rule.window()?,
                    )?;
                    let quota = Arc::new(TokenQuotaLimiter::new(
                        config,
                        options,
                        stores.windows.clone(),
                        clock.clone(),
                    )?);
                    registry.quotas.insert(rule.name.clone(), quota.clone());
                    quota
                }
            };

            debug!(name = %rule.name, algorithm = ?rule.algorithm, "Built limiter");
            registry.limiters.insert(rule.name.clone(), limiter);
        }

        for rule in &rules.composites {
            registry.ensure_unique(&rule.name)?;

            let mut builder = CompositeLimiter::builder();
            for member in &rule.members {
                let limiter = registry.get(member).ok_or_else(|| {
                    QuotaGuardError::Config(format!(
                        "composite '{}' references unknown limiter '{}'",
                        rule.name, member
                    ))
                })?;
                builder = builder.with(member, limiter);
            }

            let composite = builder.build().map_err(|e| {
                QuotaGuardError::Config(format!("composite '{}': {}", rule.name, e))
            })?;
            debug!(name = %rule.name, members = ?rule.members, "Built composite limiter");
            registry.limiters.insert(rule.name.clone(), Arc::new(composite));
        }

        info!(count = registry.limiters.len(), "Limiter registry built");
        Ok(registry)
    }

    fn ensure_unique(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(QuotaGuardError::Config("limiter names must not be empty".to_string()));
        }
        if self.limiters.contains_key(name) {
            return Err(QuotaGuardError::Config(format!("duplicate limiter name: {}", name)));
        }
        Ok(())
    }

    /// Look up any limiter or composite by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Limiter>> {
        self.limiters.get(name).cloned()
    }

    /// Look up a token quota limiter by name.
    pub fn quota(&self, name: &str) -> Option<Arc<TokenQuotaLimiter>> {
        self.quotas.get(name).cloned()
    }

    /// Look up a token bucket limiter by name.
    pub fn token_bucket(&self, name: &str) -> Option<Arc<TokenBucketLimiter>> {
        self.buckets.get(name).cloned()
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.limiters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered limiters and composites.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::limiter::DEFAULT_STORE_TIMEOUT;
    use crate::store::MemoryStore;

    const CHAT_RULES: &str = r#"
limiters:
  - name: chat-per-minute
    algorithm: fixed_window
    max_requests: 5
    window_ms: 60000
    key_prefix: chat:min
    message: Too many messages, slow down
  - name: chat-per-hour
    algorithm: sliding_window
    max_requests: 10
    window_ms: 3600000
    key_prefix: chat:hour
  - name: auth
    algorithm: fixed_window
    max_requests: 3
    window_ms: 900000
    on_store_error: closed
    skip: ["10.0.0.1"]
  - name: burst
    algorithm: token_bucket
    max_tokens: 5
    refill_per_second: 5
  - name: ai-tokens
    algorithm: token_quota
    max_tokens: 1000
    window_ms: 3600000
composites:
  - name: chat
    members: [chat-per-minute, chat-per-hour]
"#;

    fn build(yaml: &str) -> Result<LimiterRegistry> {
        let rules = RuleSet::from_yaml(yaml)?;
        LimiterRegistry::build(
            &rules,
            &StoreSet::memory(Arc::new(MemoryStore::new())),
            Arc::new(ManualClock::new(0)),
            DEFAULT_STORE_TIMEOUT,
        )
    }

    #[test]
    fn test_parse_rules() {
        let rules = RuleSet::from_yaml(CHAT_RULES).unwrap();

        assert_eq!(rules.limiters.len(), 5);
        assert_eq!(rules.limiters[0].algorithm, Algorithm::FixedWindow);
        assert_eq!(rules.limiters[2].on_store_error, FailurePolicy::Closed);
        assert_eq!(rules.limiters[3].refill_per_second, Some(5.0));
        assert_eq!(rules.composites[0].members, vec!["chat-per-minute", "chat-per-hour"]);
    }

    #[test]
    fn test_build_registry() {
        let registry = build(CHAT_RULES).unwrap();

        assert_eq!(
            registry.names(),
            vec!["ai-tokens", "auth", "burst", "chat", "chat-per-hour", "chat-per-minute"]
        );
        assert!(registry.quota("ai-tokens").is_some());
        assert!(registry.quota("chat").is_none());
        assert!(registry.token_bucket("burst").is_some());
    }

    #[tokio::test]
    async fn test_composite_from_rules() {
        let registry = build(CHAT_RULES).unwrap();
        let chat = registry.get("chat").unwrap();

        for _ in 0..5 {
            assert!(chat.check("user:1").await.allowed);
        }
        let decision = chat.check("user:1").await;
        assert!(!decision.allowed);
        assert_eq!(decision.failed_limiter.as_deref(), Some("chat-per-minute"));
        assert_eq!(decision.message.as_deref(), Some("Too many messages, slow down"));
    }

    #[tokio::test]
    async fn test_skip_list_from_rules() {
        let registry = build(CHAT_RULES).unwrap();
        let auth = registry.get("auth").unwrap();

        for _ in 0..10 {
            assert!(auth.check("10.0.0.1").await.allowed);
        }
        for _ in 0..3 {
            assert!(auth.check("10.0.0.2").await.allowed);
        }
        assert!(!auth.check("10.0.0.2").await.allowed);
    }

    #[test]
    fn test_missing_parameter_rejected() {
        let yaml = r#"
limiters:
  - name: broken
    algorithm: fixed_window
    max_requests: 5
"#;
        let err = build(yaml).err().unwrap();
        assert!(err.to_string().contains("window_ms"));
    }

    #[test]
    fn test_invalid_parameter_rejected() {
        let yaml = r#"
limiters:
  - name: broken
    algorithm: token_bucket
    max_tokens: 5
    refill_per_second: 0
"#;
        assert!(matches!(build(yaml), Err(QuotaGuardError::Config(_))));
    }

    #[test]
    fn test_out_of_range_window_rejected() {
        let yaml = r#"
limiters:
  - name: forever
    algorithm: fixed_window
    max_requests: 5
    window_ms: 18446744073709551615
"#;
        let err = build(yaml).err().unwrap();
        assert!(err.to_string().contains("window must be at most"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
limiters:
  - name: api
    algorithm: fixed_window
    max_requests: 5
    window_ms: 1000
composites:
  - name: api
    members: [api]
"#;
        let err = build(yaml).err().unwrap();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_unknown_member_rejected() {
        let yaml = r#"
composites:
  - name: chat
    members: [missing]
"#;
        let err = build(yaml).err().unwrap();
        assert!(err.to_string().contains("unknown limiter 'missing'"));
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let yaml = r#"
limiters:
  - name: api
    algorithm: leaky_bucket
"#;
        assert!(RuleSet::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_empty_rules() {
        let registry = build("{}").unwrap();
        assert!(registry.is_empty());
    }
}
