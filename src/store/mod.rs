//! Counter persistence for the limiters.
//!
//! Two store shapes are exposed as traits so limiters can run against either
//! the in-process [`MemoryStore`] or the shared [`RedisStore`]:
//!
//! - [`WindowStore`]: windowed counters (`increment`, `get`, `reset_window`)
//! - [`LogStore`]: ordered timestamp logs with trim-below-floor semantics
//!
//! Implementations must make each call atomic per key. Token buckets are kept
//! in-process only and live on [`MemoryStore`] directly.

mod memory;
mod redis_store;

pub use self::memory::{MemoryStore, SweeperHandle, DEFAULT_MAX_ENTRIES};
pub use self::redis_store::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures of a backing store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The round trip did not complete in time
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The in-process store is full of live entries
    #[error("store is at capacity ({0} entries)")]
    CapacityExceeded(usize),

    /// The backend returned something we cannot interpret
    #[error("corrupt store value: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::TypeError => StoreError::Corrupt(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// Counter state for one identity within one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    /// Units counted in the current window
    pub count: u64,
    /// When the window ends (ms since epoch)
    pub reset_time: u64,
}

impl WindowState {
    /// Start a window at `now`.
    pub fn fresh(now: u64, window_ms: u64) -> Self {
        Self {
            count: 0,
            reset_time: now.saturating_add(window_ms),
        }
    }

    /// Whether the window is over at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.reset_time
    }
}

/// Result of one conditional append to a timestamp log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSnapshot {
    /// Entries inside the window before this attempt
    pub count: u64,
    /// Oldest entry still inside the window, after any append
    pub oldest: Option<u64>,
    /// Whether `now` was appended
    pub appended: bool,
}

/// Token bucket state for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    /// Available tokens, always within `[0, max_tokens]`
    pub tokens: f64,
    /// Last time the bucket was refilled (ms since epoch)
    pub last_refill: u64,
}

impl TokenBucketState {
    /// A full bucket as of `now`.
    pub fn full(max_tokens: f64, now: u64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: now,
        }
    }
}

/// Windowed counter persistence.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Add `amount` to the counter for `key`, starting a new window of
    /// `window_ms` when none is active at `now`. Returns the state after the
    /// increment.
    async fn increment(
        &self,
        key: &str,
        amount: u64,
        window_ms: u64,
        now: u64,
    ) -> Result<WindowState, StoreError>;

    /// Read the active window for `key`, if any.
    async fn get(&self, key: &str, now: u64) -> Result<Option<WindowState>, StoreError>;

    /// Drop the counter for `key`.
    async fn reset_window(&self, key: &str) -> Result<(), StoreError>;
}

/// Sliding timestamp log persistence.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Trim entries with `timestamp + window_ms <= now`, then append `now`
    /// only if fewer than `max` entries remain. One atomic step per key.
    async fn append_if_below(
        &self,
        key: &str,
        now: u64,
        window_ms: u64,
        max: u64,
    ) -> Result<LogSnapshot, StoreError>;

    /// Drop the log for `key`.
    async fn reset_log(&self, key: &str) -> Result<(), StoreError>;
}

/// The stores a set of limiters runs against.
///
/// Window and log state may be shared across processes; token buckets always
/// live in the in-process store.
#[derive(Clone)]
pub struct StoreSet {
    /// Backing store for fixed windows and token quotas
    pub windows: Arc<dyn WindowStore>,
    /// Backing store for sliding window logs
    pub logs: Arc<dyn LogStore>,
    /// In-process store, used for token buckets and swept in the background
    pub local: Arc<MemoryStore>,
}

impl StoreSet {
    /// Keep everything in one in-process store.
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            windows: store.clone(),
            logs: store.clone(),
            local: store,
        }
    }

    /// Share windows and logs through Redis; buckets stay in `local`.
    pub fn redis(store: RedisStore, local: Arc<MemoryStore>) -> Self {
        let shared = Arc::new(store);
        Self {
            windows: shared.clone(),
            logs: shared,
            local,
        }
    }
}

/// Store that refuses every call.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct UnavailableStore;

#[cfg(test)]
impl UnavailableStore {
    fn error() -> StoreError {
        StoreError::Unavailable("connection refused".to_string())
    }
}

#[cfg(test)]
#[async_trait]
impl WindowStore for UnavailableStore {
    async fn increment(&self, _: &str, _: u64, _: u64, _: u64) -> Result<WindowState, StoreError> {
        Err(Self::error())
    }

    async fn get(&self, _: &str, _: u64) -> Result<Option<WindowState>, StoreError> {
        Err(Self::error())
    }

    async fn reset_window(&self, _: &str) -> Result<(), StoreError> {
        Err(Self::error())
    }
}

#[cfg(test)]
#[async_trait]
impl LogStore for UnavailableStore {
    async fn append_if_below(
        &self,
        _: &str,
        _: u64,
        _: u64,
        _: u64,
    ) -> Result<LogSnapshot, StoreError> {
        Err(Self::error())
    }

    async fn reset_log(&self, _: &str) -> Result<(), StoreError> {
        Err(Self::error())
    }
}
