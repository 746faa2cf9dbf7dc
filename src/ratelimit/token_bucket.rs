//! Token bucket rate limiter.
//!
//! Tokens refill continuously at a fixed rate up to a capacity, and each
//! request consumes tokens. Bursts up to the capacity are allowed while the
//! long-run rate stays bounded by the refill rate. Refills are computed lazily
//! from elapsed time on each check.
//!
//! Buckets live in the in-process [`MemoryStore`]; the refill math is cheap to
//! duplicate per process.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::decision::Decision;
use super::limiter::{Limiter, LimiterOptions, MAX_WINDOW};
use crate::clock::Clock;
use crate::error::{QuotaGuardError, Result};
use crate::store::{MemoryStore, TokenBucketState};

/// Capacity and refill rate of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketConfig {
    max_tokens: u64,
    refill_per_ms: f64,
}

impl TokenBucketConfig {
    /// Validate and build a bucket configuration.
    pub fn new(max_tokens: u64, refill_per_second: f64) -> Result<Self> {
        if max_tokens == 0 {
            return Err(QuotaGuardError::Config(
                "max_tokens must be greater than zero".to_string(),
            ));
        }
        if !refill_per_second.is_finite() || refill_per_second <= 0.0 {
            return Err(QuotaGuardError::Config(format!(
                "refill_per_second must be a positive number, got {}",
                refill_per_second
            )));
        }
        let refill_per_ms = refill_per_second / 1000.0;
        let full_refill_ms = max_tokens as f64 / refill_per_ms;
        if full_refill_ms > MAX_WINDOW.as_millis() as f64 {
            return Err(QuotaGuardError::Config(format!(
                "refilling {} tokens at {}/s takes longer than {:?}",
                max_tokens, refill_per_second, MAX_WINDOW
            )));
        }
        Ok(Self {
            max_tokens,
            refill_per_ms,
        })
    }

    /// Bucket capacity.
    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    /// Refill rate in tokens per millisecond.
    pub fn refill_per_ms(&self) -> f64 {
        self.refill_per_ms
    }

    /// Milliseconds for an empty bucket to fill.
    fn full_refill_ms(&self) -> u64 {
        (self.max_tokens as f64 / self.refill_per_ms).ceil() as u64
    }
}

struct Outcome {
    allowed: bool,
    tokens: f64,
    full_at: u64,
}

/// Allows bursts up to `max_tokens`, refilling at a fixed rate.
pub struct TokenBucketLimiter {
    config: TokenBucketConfig,
    options: LimiterOptions,
    store: Arc<MemoryStore>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    /// Create a new token bucket limiter.
    pub fn new(
        config: TokenBucketConfig,
        options: LimiterOptions,
        store: Arc<MemoryStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            config,
            options,
            store,
            clock,
        })
    }

    /// The limiter's configuration.
    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    /// Consume one token for `identity`.
    pub async fn check(&self, identity: &str) -> Decision {
        self.check_cost(identity, 1).await
    }

    /// Consume `cost` tokens for `identity` if that many are available.
    ///
    /// A cost above the bucket capacity can never succeed and is rejected
    /// without a retry hint.
    pub async fn check_cost(&self, identity: &str, cost: u64) -> Decision {
        let max = self.config.max_tokens as f64;
        let rate = self.config.refill_per_ms;
        let now = self.clock.now_ms();

        if self.options.should_skip(identity) {
            return Decision::allowed(
                self.config.max_tokens,
                now.saturating_add(self.config.full_refill_ms()),
            );
        }

        let key = self.options.key(identity);
        trace!(key = %key, cost, "Checking token bucket");

        let cost_f64 = cost as f64;
        let outcome = self.store.update_bucket(
            &key.to_store_key(),
            now,
            TokenBucketState::full(max, now),
            |state| {
                let elapsed = now.saturating_sub(state.last_refill);
                state.tokens = (state.tokens + elapsed as f64 * rate).min(max);
                state.last_refill = state.last_refill.max(now);

                let allowed = state.tokens >= cost_f64;
                if allowed {
                    state.tokens -= cost_f64;
                }

                let full_at = now.saturating_add(((max - state.tokens) / rate).ceil() as u64);
                let outcome = Outcome {
                    allowed,
                    tokens: state.tokens,
                    full_at,
                };
                (outcome, full_at)
            },
        );

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                return self.options.on_failure(
                    &key,
                    &e,
                    self.config.max_tokens,
                    now,
                    self.config.full_refill_ms(),
                )
            }
        };

        let remaining = outcome.tokens.floor() as u64;
        if outcome.allowed {
            return Decision::allowed(remaining, outcome.full_at);
        }

        let retry_after = if cost_f64 > max {
            None
        } else {
            Some(((cost_f64 - outcome.tokens) / rate / 1000.0).ceil() as u64)
        };

        debug!(
            key = %key,
            cost,
            tokens = outcome.tokens,
            retry_after = ?retry_after,
            "Token bucket exhausted"
        );
        Decision::rejected(remaining, outcome.full_at, retry_after)
            .with_message(self.options.message.as_deref())
    }

    /// Drop the bucket for `identity`, refilling it completely.
    pub async fn reset(&self, identity: &str) -> Result<()> {
        let key = self.options.key(identity);
        self.store.reset_bucket(&key.to_store_key());
        debug!(key = %key, "Reset token bucket");
        Ok(())
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    async fn check(&self, identity: &str) -> Decision {
        self.check(identity).await
    }

    async fn reset(&self, identity: &str) -> Result<()> {
        self.reset(identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::limiter::FailurePolicy;
    use std::time::Duration;

    fn create_limiter(max: u64, per_second: f64) -> (TokenBucketLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = TokenBucketLimiter::new(
            TokenBucketConfig::new(max, per_second).unwrap(),
            LimiterOptions::new("test"),
            Arc::new(MemoryStore::new()),
            clock.clone(),
        )
        .unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_config_validation() {
        assert!(TokenBucketConfig::new(0, 1.0).is_err());
        assert!(TokenBucketConfig::new(5, 0.0).is_err());
        assert!(TokenBucketConfig::new(5, -1.0).is_err());
        assert!(TokenBucketConfig::new(5, f64::NAN).is_err());
        assert!(TokenBucketConfig::new(5, f64::INFINITY).is_err());
        assert!(TokenBucketConfig::new(5, 1e-17).is_err());
        // One token a day.
        assert!(TokenBucketConfig::new(365, 1.0 / 86_400.0).is_ok());
        assert!(TokenBucketConfig::new(367, 1.0 / 86_400.0).is_err());

        let config = TokenBucketConfig::new(5, 5.0).unwrap();
        assert_eq!(config.refill_per_ms(), 0.005);
        assert_eq!(config.full_refill_ms(), 1_000);
    }

    #[tokio::test]
    async fn test_burst_then_reject() {
        let (limiter, _) = create_limiter(5, 5.0);

        for expected in (0..5).rev() {
            let decision = limiter.check("user:1").await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let decision = limiter.check("user:1").await;
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Some(1));
        assert_eq!(decision.reset_time, 1_000);
    }

    #[tokio::test]
    async fn test_refill_precision() {
        let (limiter, clock) = create_limiter(5, 5.0);

        for _ in 0..5 {
            assert!(limiter.check("user:1").await.allowed);
        }
        assert!(!limiter.check("user:1").await.allowed);

        clock.advance(Duration::from_millis(250));
        assert!(limiter.check("user:1").await.allowed);
        assert!(!limiter.check("user:1").await.allowed);
    }

    #[tokio::test]
    async fn test_refill_is_capped() {
        let (limiter, clock) = create_limiter(3, 10.0);

        limiter.check("user:1").await;
        clock.advance(Duration::from_secs(3_600));

        let decision = limiter.check("user:1").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_variable_cost() {
        let (limiter, clock) = create_limiter(10, 1.0);

        let decision = limiter.check_cost("user:1", 7).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 3);

        let decision = limiter.check_cost("user:1", 5).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 3);
        assert_eq!(decision.retry_after, Some(2));

        clock.advance(Duration::from_secs(2));
        assert!(limiter.check_cost("user:1", 5).await.allowed);
    }

    #[tokio::test]
    async fn test_cost_above_capacity_never_succeeds() {
        let (limiter, _) = create_limiter(5, 5.0);

        let decision = limiter.check_cost("user:1", 6).await;
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, None);
        assert_eq!(decision.remaining, 5);
    }

    #[tokio::test]
    async fn test_reset_refills() {
        let (limiter, _) = create_limiter(1, 0.001);

        assert!(limiter.check("user:1").await.allowed);
        assert!(!limiter.check("user:1").await.allowed);

        limiter.reset("user:1").await.unwrap();
        assert!(limiter.check("user:1").await.allowed);
    }

    #[tokio::test]
    async fn test_skip_predicate_reports_full_bucket() {
        let store = Arc::new(MemoryStore::new());
        let limiter = TokenBucketLimiter::new(
            TokenBucketConfig::new(5, 5.0).unwrap(),
            LimiterOptions::new("test").skip(|identity| identity == "internal"),
            store.clone(),
            Arc::new(ManualClock::new(10_000)),
        )
        .unwrap();

        let decision = limiter.check_cost("internal", 50).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
        assert_eq!(decision.reset_time, 11_000);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_exhaustion_policies() {
        let store = Arc::new(MemoryStore::with_max_entries(1));
        let clock = Arc::new(ManualClock::new(0));
        let config = TokenBucketConfig::new(5, 5.0).unwrap();

        let open = TokenBucketLimiter::new(
            config,
            LimiterOptions::new("open"),
            store.clone(),
            clock.clone(),
        )
        .unwrap();
        let closed = TokenBucketLimiter::new(
            config,
            LimiterOptions::new("closed").on_store_error(FailurePolicy::Closed),
            store.clone(),
            clock.clone(),
        )
        .unwrap();

        assert!(open.check("user:1").await.allowed);

        let decision = open.check("user:2").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
        assert_eq!(decision.reset_time, 1_000);

        let decision = closed.check("user:3").await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after, Some(1));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_full_buckets_are_swept() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let limiter = TokenBucketLimiter::new(
            TokenBucketConfig::new(5, 5.0).unwrap(),
            LimiterOptions::new("test"),
            store.clone(),
            clock.clone(),
        )
        .unwrap();

        limiter.check("user:1").await;
        assert_eq!(store.sweep(100), 0);
        // One token takes 200ms to come back.
        assert_eq!(store.sweep(200), 1);
    }
}
