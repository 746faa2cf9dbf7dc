//! Fixed window rate limiter.
//!
//! Windows start at an identity's first access rather than on calendar
//! boundaries, so a caller can issue close to `2 * max_requests` in a short
//! span straddling a window boundary. Accounting stays O(1) per check.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::decision::{retry_after_secs, Decision};
use super::limiter::{Limiter, LimiterOptions, WindowConfig};
use crate::clock::Clock;
use crate::error::Result;
use crate::store::WindowStore;

/// Counts units per identity in windows of fixed length.
pub struct FixedWindowLimiter {
    config: WindowConfig,
    options: LimiterOptions,
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    /// Create a new fixed window limiter.
    pub fn new(
        config: WindowConfig,
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
    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Count one request for `identity`.
    pub async fn check(&self, identity: &str) -> Decision {
        let max = self.config.max_requests();
        let window_ms = self.config.window_ms();
        let now = self.clock.now_ms();

        if self.options.should_skip(identity) {
            return Decision::allowed(max, now.saturating_add(window_ms));
        }

        let key = self.options.key(identity);
        trace!(key = %key, "Checking fixed window");

        let state = match self
            .options
            .guarded(self.store.increment(&key.to_store_key(), 1, window_ms, now))
            .await
        {
            Ok(state) => state,
            Err(e) => return self.options.on_failure(&key, &e, max, now, window_ms),
        };

        let remaining = max.saturating_sub(state.count);
        if state.count <= max {
            return Decision::allowed(remaining, state.reset_time);
        }

        debug!(
            key = %key,
            count = state.count,
            limit = max,
            "Fixed window limit exceeded"
        );
        Decision::rejected(
            remaining,
            state.reset_time,
            Some(retry_after_secs(state.reset_time, now)),
        )
        .with_message(self.options.message.as_deref())
    }

    /// Clear the window for `identity`.
    pub async fn reset(&self, identity: &str) -> Result<()> {
        let key = self.options.key(identity);
        self.options
            .guarded(self.store.reset_window(&key.to_store_key()))
            .await?;
        debug!(key = %key, "Reset fixed window");
        Ok(())
    }
}

#[async_trait]
impl Limiter for FixedWindowLimiter {
    async fn check(&self, identity: &str) -> Decision {
        self.check(identity).await
    }

    async fn reset(&self, identity: &str) -> Result<()> {
        self.reset(identity).await
    }
}
