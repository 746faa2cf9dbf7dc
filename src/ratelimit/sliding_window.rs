//! Sliding window (timestamp log) rate limiter.
//!
//! Each identity keeps a log of the timestamps of its allowed requests.
//! A check trims entries older than one window and allows the request only if
//! fewer than `max_requests` remain, which removes the boundary burst of the
//! fixed window at the cost of O(max_requests) work and storage per identity.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::decision::{retry_after_secs, Decision};
use super::limiter::{Limiter, LimiterOptions, WindowConfig};
use crate::clock::Clock;
use crate::error::{QuotaGuardError, Result};
use crate::store::LogStore;

/// Upper bound on `max_requests`, which bounds per-identity log length.
pub const MAX_SLIDING_REQUESTS: u64 = 10_000;

/// Allows at most `max_requests` in any trailing window.
pub struct SlidingWindowLimiter {
    config: WindowConfig,
    options: LimiterOptions,
    store: Arc<dyn LogStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Create a new sliding window limiter.
    pub fn new(
        config: WindowConfig,
        options: LimiterOptions,
        store: Arc<dyn LogStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        options.validate()?;
        if config.max_requests() > MAX_SLIDING_REQUESTS {
            return Err(QuotaGuardError::Config(format!(
                "sliding window max_requests must be at most {}",
                MAX_SLIDING_REQUESTS
            )));
        }
        Ok(Self {
            config,
            options,
            store,
            clock,
        })
    }

    /// The limiter's configuration.
    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Count one request for `identity` if the trailing window has room.
    pub async fn check(&self, identity: &str) -> Decision {
        let max = self.config.max_requests();
        let window_ms = self.config.window_ms();
        let now = self.clock.now_ms();

        if self.options.should_skip(identity) {
            return Decision::allowed(max, now.saturating_add(window_ms));
        }

        let key = self.options.key(identity);
        trace!(key = %key, "Checking sliding window");

        let snapshot = match self
            .options
            .guarded(
                self.store
                    .append_if_below(&key.to_store_key(), now, window_ms, max),
            )
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => return self.options.on_failure(&key, &e, max, now, window_ms),
        };

        let reset_time = snapshot
            .oldest
            .unwrap_or(now)
            .saturating_add(window_ms);

        if snapshot.appended {
            let remaining = max.saturating_sub(snapshot.count + 1);
            return Decision::allowed(remaining, reset_time);
        }

        debug!(
            key = %key,
            count = snapshot.count,
            limit = max,
            "Sliding window limit exceeded"
        );
        Decision::rejected(
            max.saturating_sub(snapshot.count),
            reset_time,
            Some(retry_after_secs(reset_time, now)),
        )
        .with_message(self.options.message.as_deref())
    }

    /// Clear the log for `identity`.
    pub async fn reset(&self, identity: &str) -> Result<()> {
        let key = self.options.key(identity);
        self.options
            .guarded(self.store.reset_log(&key.to_store_key()))
            .await?;
        debug!(key = %key, "Reset sliding window");
        Ok(())
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    async fn check(&self, identity: &str) -> Decision {
        self.check(identity).await
    }

    async fn reset(&self, identity: &str) -> Result<()> {
        self.reset(identity).await
    }
}
