//! Cost-metered quota for work whose true cost is only known afterwards,
//! such as AI token usage.
//!
//! The gate is split in two: [`TokenQuotaLimiter::check_pre_request`] is a
//! non-mutating preview against an estimate, and
//! [`TokenQuotaLimiter::record_usage`] is the only debit, made once the actual
//! cost is known. Callers are expected to record against the same window the
//! preview observed; previews that are never followed by a recording are not
//! reconciled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::decision::{retry_after_secs, Decision};
use super::limiter::{window_millis, Limiter, LimiterOptions};
use crate::clock::Clock;
use crate::error::{QuotaGuardError, Result};
use crate::store::WindowStore;

/// Quota size and window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenQuotaConfig {
    max_tokens: u64,
    window_ms: u64,
}

impl TokenQuotaConfig {
    /// Validate and build a quota configuration.
    pub fn new(max_tokens: u64, window: Duration) -> Result<Self> {
        if max_tokens == 0 {
            return Err(QuotaGuardError::Config(
                "max_tokens must be greater than zero".to_string(),
            ));
        }
        let window_ms = window_millis(window)?;
        Ok(Self {
            max_tokens,
            window_ms,
        })
    }

    /// Tokens allowed per window.
    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }
}

/// Recorded consumption for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    /// Tokens recorded in the current window
    pub used: u64,
    /// Tokens left in the current window
    pub remaining: u64,
    /// When the window ends (ms since epoch)
    pub reset_time: u64,
}

/// Meters token consumption per identity within a window.
pub struct TokenQuotaLimiter {
    config: TokenQuotaConfig,
    options: LimiterOptions,
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
}

impl TokenQuotaLimiter {
    /// Create a new token quota limiter.
    pub fn new(
        config: TokenQuotaConfig,
        options: LimiterOptions,
        store: Arc<dyn WindowStore>,
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
    pub fn config(&self) -> &TokenQuotaConfig {
        &self.config
    }

    /// Preview whether `estimated_cost` more tokens fit in the quota.
    ///
    /// Nothing is debited. With no active window the projection assumes a
    /// fresh window starting now.
    pub async fn check_pre_request(&self, identity: &str, estimated_cost: u64) -> Decision {
        let max = self.config.max_tokens;
        let window_ms = self.config.window_ms;
        let now = self.clock.now_ms();

        if self.options.should_skip(identity) {
            return Decision::allowed(max, now.saturating_add(window_ms));
        }

        let key = self.options.key(identity);
        trace!(key = %key, estimated_cost, "Pre-checking token quota");

        let state = match self
            .options
            .guarded(self.store.get(&key.to_store_key(), now))
            .await
        {
            Ok(state) => state,
            Err(e) => return self.options.on_failure(&key, &e, max, now, window_ms),
        };

        let (used, reset_time) = state.map_or((0, now.saturating_add(window_ms)), |s| {
            (s.count, s.reset_time)
        });
        let projected = used.saturating_add(estimated_cost);

        if projected <= max {
            return Decision::allowed(max - projected, reset_time);
        }

        // An estimate above the whole quota cannot fit in any window.
        let retry_after = if state.is_some() && estimated_cost <= max {
            Some(retry_after_secs(reset_time, now))
        } else {
            None
        };

        debug!(
            key = %key,
            used,
            estimated_cost,
            limit = max,
            "Token quota would be exceeded"
        );
        Decision::rejected(max.saturating_sub(used), reset_time, retry_after)
            .with_message(self.options.message.as_deref())
    }

    /// Debit `actual_cost` tokens against the window active now.
    pub async fn record_usage(&self, identity: &str, actual_cost: u64) -> Result<QuotaUsage> {
        let max = self.config.max_tokens;
        let now = self.clock.now_ms();

        if self.options.should_skip(identity) {
            return Ok(QuotaUsage {
                used: 0,
                remaining: max,
                reset_time: now.saturating_add(self.config.window_ms),
            });
        }

        let key = self.options.key(identity);
        let state = self
            .options
            .guarded(self.store.increment(
                &key.to_store_key(),
                actual_cost,
                self.config.window_ms,
                now,
            ))
            .await?;

        if state.count > max {
            warn!(
                key = %key,
                used = state.count,
                limit = max,
                "Recorded token usage exceeds quota"
            );
        } else {
            debug!(key = %key, actual_cost, used = state.count, "Recorded token usage");
        }

        Ok(QuotaUsage {
            used: state.count,
            remaining: max.saturating_sub(state.count),
            reset_time: state.reset_time,
        })
    }

    /// Read the current usage for `identity`.
    pub async fn get_usage(&self, identity: &str) -> Result<QuotaUsage> {
        let max = self.config.max_tokens;
        let now = self.clock.now_ms();
        let key = self.options.key(identity);

        let state = self
            .options
            .guarded(self.store.get(&key.to_store_key(), now))
            .await?;

        Ok(match state {
            Some(state) => QuotaUsage {
                used: state.count,
                remaining: max.saturating_sub(state.count),
                reset_time: state.reset_time,
            },
            None => QuotaUsage {
                used: 0,
                remaining: max,
                reset_time: now.saturating_add(self.config.window_ms),
            },
        })
    }

    /// Clear the quota window for `identity`.
    pub async fn reset(&self, identity: &str) -> Result<()> {
        let key = self.options.key(identity);
        self.options
            .guarded(self.store.reset_window(&key.to_store_key()))
            .await?;
        debug!(key = %key, "Reset token quota");
        Ok(())
    }
}

/// As a plain limiter, a quota allows while at least one token is left.
#[async_trait]
impl Limiter for TokenQuotaLimiter {
    async fn check(&self, identity: &str) -> Decision {
        self.check_pre_request(identity, 1).await
    }

    async fn reset(&self, identity: &str) -> Result<()> {
        self.reset(identity).await
    }
}
