//! The common limiter contract and the options every limiter shares.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::decision::Decision;
use super::key::IdentityKey;
use crate::error::{QuotaGuardError, Result};
use crate::store::StoreError;

/// Default bound on a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Longest accepted window, and longest accepted token bucket refill.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// How long a fail-closed rejection asks the caller to back off.
const FAIL_CLOSED_RETRY_MS: u64 = 1_000;

/// Validate a window length and convert it to milliseconds.
pub(crate) fn window_millis(window: Duration) -> Result<u64> {
    if window > MAX_WINDOW {
        return Err(QuotaGuardError::Config(format!(
            "window must be at most {:?}, got {:?}",
            MAX_WINDOW, window
        )));
    }
    let window_ms = u64::try_from(window.as_millis())
        .map_err(|_| QuotaGuardError::Config(format!("window {:?} is out of range", window)))?;
    if window_ms == 0 {
        return Err(QuotaGuardError::Config(
            "window must be at least one millisecond".to_string(),
        ));
    }
    Ok(window_ms)
}

/// Trait implemented by every limiter, including composites.
///
/// `check` never fails: store problems are resolved by the limiter's
/// [`FailurePolicy`] and exceeding the limit is a normal rejected
/// [`Decision`].
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Count one unit of work for `identity` and decide whether it may proceed.
    async fn check(&self, identity: &str) -> Decision;

    /// Clear all state held for `identity`.
    async fn reset(&self, identity: &str) -> Result<()>;
}

/// What a limiter does when its store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Allow the request and log a warning
    #[default]
    Open,
    /// Reject the request
    Closed,
}

/// Predicate deciding that an identity bypasses a limiter entirely.
pub type SkipPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Limit parameters for the window-based limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    max_requests: u64,
    window_ms: u64,
}

impl WindowConfig {
    /// Validate and build a window configuration.
    pub fn new(max_requests: u64, window: Duration) -> Result<Self> {
        if max_requests == 0 {
            return Err(QuotaGuardError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        let window_ms = window_millis(window)?;
        Ok(Self {
            max_requests,
            window_ms,
        })
    }

    /// Maximum units per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }
}

/// Options shared by all limiters.
#[derive(Clone)]
pub struct LimiterOptions {
    /// Prefix scoping this limiter's keys
    pub key_prefix: String,
    /// Message attached to rejections
    pub message: Option<String>,
    /// Identities for which the limiter is bypassed
    pub skip: Option<SkipPredicate>,
    /// Behaviour when the store fails or times out
    pub on_store_error: FailurePolicy,
    /// Bound on each store round trip
    pub store_timeout: Duration,
}

impl std::fmt::Debug for LimiterOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterOptions")
            .field("key_prefix", &self.key_prefix)
            .field("message", &self.message)
            .field("skip", &self.skip.is_some())
            .field("on_store_error", &self.on_store_error)
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

impl LimiterOptions {
    /// Options with the given key prefix and defaults for everything else.
    pub fn new(key_prefix: &str) -> Self {
        Self {
            key_prefix: key_prefix.to_string(),
            message: None,
            skip: None,
            on_store_error: FailurePolicy::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Set the rejection message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Bypass the limiter for identities matching `predicate`.
    pub fn skip(mut self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.skip = Some(Arc::new(predicate));
        self
    }

    /// Set the store failure policy.
    pub fn on_store_error(mut self, policy: FailurePolicy) -> Self {
        self.on_store_error = policy;
        self
    }

    /// Set the store round-trip timeout.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(QuotaGuardError::Config(
                "key_prefix must not be empty".to_string(),
            ));
        }
        if self.store_timeout.is_zero() {
            return Err(QuotaGuardError::Config(
                "store_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn key(&self, identity: &str) -> IdentityKey {
        IdentityKey::new(&self.key_prefix, identity)
    }

    pub(crate) fn should_skip(&self, identity: &str) -> bool {
        self.skip.as_ref().is_some_and(|skip| skip(identity))
    }

    /// Run one store round trip under the configured timeout.
    pub(crate) async fn guarded<T, F>(&self, call: F) -> std::result::Result<T, StoreError>
    where
        F: Future<Output = std::result::Result<T, StoreError>> + Send,
    {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }

    /// Resolve a store failure on a check path into a decision.
    pub(crate) fn on_failure(
        &self,
        key: &IdentityKey,
        err: &StoreError,
        limit: u64,
        now: u64,
        window_ms: u64,
    ) -> Decision {
        match self.on_store_error {
            FailurePolicy::Open => {
                warn!(key = %key, error = %err, "Store failure, failing open");
                Decision::allowed(limit, now.saturating_add(window_ms))
            }
            FailurePolicy::Closed => {
                error!(key = %key, error = %err, "Store failure, failing closed");
                Decision::rejected(
                    0,
                    now.saturating_add(FAIL_CLOSED_RETRY_MS),
                    Some(FAIL_CLOSED_RETRY_MS / 1000),
                )
                .with_message(self.message.as_deref())
            }
        }
    }
}
