//! In-process store backed by sharded concurrent maps.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::{LogSnapshot, LogStore, StoreError, TokenBucketState, WindowState, WindowStore};
use crate::clock::Clock;

/// Default cap on live keys across all three maps.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Minimum spacing between inline sweeps triggered by a full store.
const INLINE_SWEEP_INTERVAL_MS: u64 = 1_000;

const NEVER: u64 = u64::MAX;

#[derive(Debug)]
struct LogEntry {
    timestamps: VecDeque<u64>,
    window_ms: u64,
}

impl LogEntry {
    fn trim(&mut self, now: u64) {
        while self
            .timestamps
            .front()
            .is_some_and(|&ts| ts.saturating_add(self.window_ms) <= now)
        {
            self.timestamps.pop_front();
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        match self.timestamps.back() {
            Some(&newest) => newest.saturating_add(self.window_ms) <= now,
            None => true,
        }
    }
}

#[derive(Debug)]
struct BucketEntry {
    state: TokenBucketState,
    expires_at: u64,
}

/// In-process store for windows, timestamp logs and token buckets.
///
/// Per-key updates happen under the owning shard's lock, so each operation is
/// atomic for its key while unrelated keys proceed in parallel. Expired
/// entries are evicted by [`sweep`](Self::sweep), either from a background
/// sweeper or inline when the store reaches `max_entries`. Inline sweeps run
/// at most once per second; in between, new keys in a full store fail fast
/// with [`StoreError::CapacityExceeded`].
#[derive(Debug)]
pub struct MemoryStore {
    windows: DashMap<String, WindowState>,
    logs: DashMap<String, LogEntry>,
    buckets: DashMap<String, BucketEntry>,
    max_entries: usize,
    /// Keys held or reserved across all maps
    entries: AtomicUsize,
    last_inline_sweep: AtomicU64,
}

impl MemoryStore {
    /// Create a store with the default capacity.
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    /// Create a store that holds at most `max_entries` live keys.
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            windows: DashMap::new(),
            logs: DashMap::new(),
            buckets: DashMap::new(),
            max_entries: max_entries.max(1),
            entries: AtomicUsize::new(0),
            last_inline_sweep: AtomicU64::new(NEVER),
        }
    }

    /// Number of stored keys, expired or not.
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every entry whose window or TTL has elapsed at `now`.
    ///
    /// Returns the number of evicted entries.
    pub fn sweep(&self, now: u64) -> usize {
        let mut evicted = 0;
        self.windows.retain(|_, state| {
            let keep = !state.is_expired(now);
            evicted += usize::from(!keep);
            keep
        });
        self.logs.retain(|_, log| {
            let keep = !log.is_expired(now);
            evicted += usize::from(!keep);
            keep
        });
        self.buckets.retain(|_, bucket| {
            let keep = bucket.expires_at > now;
            evicted += usize::from(!keep);
            keep
        });
        self.release(evicted);
        evicted
    }

    /// Run [`sweep`](Self::sweep) every `interval` on the tokio runtime.
    ///
    /// The task holds only a weak reference and stops once the store is
    /// dropped, or when the returned handle is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> SweeperHandle {
        let store = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let evicted = store.sweep(clock.now_ms());
                if evicted > 0 {
                    debug!(evicted, remaining = store.len(), "Swept expired entries");
                }
            }

            debug!("Memory store sweeper stopped");
        });

        info!(
            interval_ms = interval.as_millis() as u64,
            max_entries = self.max_entries,
            "Memory store sweeper started"
        );

        SweeperHandle { task }
    }

    /// Apply `update` to the token bucket for `key`, creating it from `init`
    /// if absent. `update` returns its result plus the time after which the
    /// bucket may be evicted.
    pub fn update_bucket<R>(
        &self,
        key: &str,
        now: u64,
        init: TokenBucketState,
        update: impl FnOnce(&mut TokenBucketState) -> (R, u64),
    ) -> Result<R, StoreError> {
        if !self.buckets.contains_key(key) {
            self.make_room(now);
        }

        let mut entry = match self.buckets.entry(key.to_owned()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                self.reserve()?;
                entry.insert(BucketEntry {
                    state: init,
                    expires_at: now,
                })
            }
        };
        let (result, expires_at) = update(&mut entry.state);
        entry.expires_at = expires_at;
        Ok(result)
    }

    /// Read the token bucket for `key` without refilling it.
    pub fn get_bucket(&self, key: &str) -> Option<TokenBucketState> {
        self.buckets.get(key).map(|entry| entry.state)
    }

    /// Drop the token bucket for `key`.
    pub fn reset_bucket(&self, key: &str) {
        if self.buckets.remove(key).is_some() {
            self.release(1);
        }
    }

    /// Sweep inline if the store is full, at most once per
    /// `INLINE_SWEEP_INTERVAL_MS`.
    fn make_room(&self, now: u64) {
        if self.len() < self.max_entries {
            return;
        }

        let last = self.last_inline_sweep.load(Ordering::Acquire);
        if last != NEVER && now < last.saturating_add(INLINE_SWEEP_INTERVAL_MS) {
            return;
        }
        // Only one caller sweeps per interval.
        if self
            .last_inline_sweep
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let evicted = self.sweep(now);
        trace!(evicted, "Inline sweep at capacity");
    }

    /// Claim a slot for a new key.
    fn reserve(&self) -> Result<(), StoreError> {
        self.entries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_entries).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| StoreError::CapacityExceeded(self.max_entries))
    }

    fn release(&self, count: usize) {
        if count > 0 {
            self.entries.fetch_sub(count, Ordering::AcqRel);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn increment(
        &self,
        key: &str,
        amount: u64,
        window_ms: u64,
        now: u64,
    ) -> Result<WindowState, StoreError> {
        if !self.windows.contains_key(key) {
            self.make_room(now);
        }

        let mut state = match self.windows.entry(key.to_owned()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                self.reserve()?;
                entry.insert(WindowState::fresh(now, window_ms))
            }
        };

        if state.is_expired(now) {
            *state = WindowState::fresh(now, window_ms);
        }
        state.count += amount;

        Ok(*state)
    }

    async fn get(&self, key: &str, now: u64) -> Result<Option<WindowState>, StoreError> {
        Ok(self
            .windows
            .get(key)
            .map(|state| *state)
            .filter(|state| !state.is_expired(now)))
    }

    async fn reset_window(&self, key: &str) -> Result<(), StoreError> {
        if self.windows.remove(key).is_some() {
            self.release(1);
        }
        Ok(())
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn append_if_below(
        &self,
        key: &str,
        now: u64,
        window_ms: u64,
        max: u64,
    ) -> Result<LogSnapshot, StoreError> {
        if !self.logs.contains_key(key) {
            self.make_room(now);
        }

        let mut log = match self.logs.entry(key.to_owned()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                self.reserve()?;
                entry.insert(LogEntry {
                    timestamps: VecDeque::new(),
                    window_ms,
                })
            }
        };
        log.window_ms = window_ms;
        log.trim(now);

        let count = log.timestamps.len() as u64;
        let appended = count < max;
        if appended {
            log.timestamps.push_back(now);
        }

        Ok(LogSnapshot {
            count,
            oldest: log.timestamps.front().copied(),
            appended,
        })
    }

    async fn reset_log(&self, key: &str) -> Result<(), StoreError> {
        if self.logs.remove(key).is_some() {
            self.release(1);
        }
        Ok(())
    }
}

/// Handle to a running sweeper task. Dropping it stops the sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper.
    pub fn shutdown(self) {
        // Drop aborts the task.
    }

    /// Whether the sweeper task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_increment_starts_fresh_window() {
        let store = MemoryStore::new();

        let state = store.increment("k", 1, 1_000, 0).await.unwrap();
        assert_eq!(state, WindowState { count: 1, reset_time: 1_000 });

        let state = store.increment("k", 1, 1_000, 500).await.unwrap();
        assert_eq!(state, WindowState { count: 2, reset_time: 1_000 });
    }

    #[tokio::test]
    async fn test_increment_resets_at_reset_time() {
        let store = MemoryStore::new();

        store.increment("k", 3, 1_000, 0).await.unwrap();
        let state = store.increment("k", 1, 1_000, 1_000).await.unwrap();

        assert_eq!(state, WindowState { count: 1, reset_time: 2_000 });
    }

    #[tokio::test]
    async fn test_get_ignores_expired_window() {
        let store = MemoryStore::new();

        assert_eq!(store.get("k", 0).await.unwrap(), None);

        store.increment("k", 7, 1_000, 0).await.unwrap();
        assert_eq!(store.get("k", 999).await.unwrap().map(|s| s.count), Some(7));
        assert_eq!(store.get("k", 1_000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reset_window() {
        let store = MemoryStore::new();

        store.increment("k", 1, 1_000, 0).await.unwrap();
        store.reset_window("k").await.unwrap();

        assert_eq!(store.get("k", 0).await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_log_appends_until_max() {
        let store = MemoryStore::new();

        for expected in 0..3 {
            let snapshot = store.append_if_below("k", 0, 1_000, 3).await.unwrap();
            assert_eq!(snapshot.count, expected);
            assert!(snapshot.appended);
            assert_eq!(snapshot.oldest, Some(0));
        }

        let snapshot = store.append_if_below("k", 10, 1_000, 3).await.unwrap();
        assert_eq!(snapshot.count, 3);
        assert!(!snapshot.appended);
    }

    #[tokio::test]
    async fn test_log_trims_entries_at_floor() {
        let store = MemoryStore::new();

        store.append_if_below("k", 0, 1_000, 2).await.unwrap();
        store.append_if_below("k", 400, 1_000, 2).await.unwrap();

        // The entry at 0 is exactly one window old and drops out.
        let snapshot = store.append_if_below("k", 1_000, 1_000, 2).await.unwrap();
        assert_eq!(snapshot.count, 1);
        assert!(snapshot.appended);
        assert_eq!(snapshot.oldest, Some(400));
    }

    #[tokio::test]
    async fn test_rejected_attempts_are_not_logged() {
        let store = MemoryStore::new();

        store.append_if_below("k", 0, 1_000, 1).await.unwrap();
        for now in [100, 200, 300] {
            let snapshot = store.append_if_below("k", now, 1_000, 1).await.unwrap();
            assert!(!snapshot.appended);
        }

        let snapshot = store.append_if_below("k", 1_000, 1_000, 1).await.unwrap();
        assert_eq!(snapshot.count, 0);
        assert!(snapshot.appended);
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired_entries() {
        let store = MemoryStore::new();

        store.increment("window", 1, 1_000, 0).await.unwrap();
        store.append_if_below("log", 0, 2_000, 5).await.unwrap();
        store
            .update_bucket("bucket", 0, TokenBucketState::full(5.0, 0), |_| ((), 3_000))
            .unwrap();
        assert_eq!(store.len(), 3);

        assert_eq!(store.sweep(1_000), 1);
        assert_eq!(store.sweep(2_000), 1);
        assert_eq!(store.sweep(3_000), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_is_bounded() {
        let store = MemoryStore::with_max_entries(2);

        store.increment("a", 1, 1_000, 0).await.unwrap();
        store.increment("b", 1, 1_000, 0).await.unwrap();

        let err = store.increment("c", 1, 1_000, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded(2)));

        // Existing keys still work at capacity.
        assert_eq!(store.increment("a", 1, 1_000, 0).await.unwrap().count, 2);

        // Once the old windows expire, the inline sweep makes room.
        assert_eq!(store.increment("c", 1, 1_000, 1_000).await.unwrap().count, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_inline_sweep_is_throttled_at_capacity() {
        let store = MemoryStore::with_max_entries(2);

        store.increment("short", 1, 1_000, 0).await.unwrap();
        store.increment("long", 1, 10_000, 0).await.unwrap();

        // Sweeps at 500 and finds nothing to evict.
        assert!(store.increment("new:1", 1, 1_000, 500).await.is_err());

        // "short" has expired, but a second sweep is not due until 1_500.
        for now in [1_000, 1_200, 1_499] {
            let err = store.increment("new:2", 1, 1_000, now).await.unwrap_err();
            assert!(matches!(err, StoreError::CapacityExceeded(2)));
        }
        assert_eq!(store.len(), 2);

        assert!(store.increment("new:3", 1, 1_000, 1_500).await.is_ok());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_respect_capacity() {
        let store = Arc::new(MemoryStore::with_max_entries(10));

        let handles: Vec<_> = (0..200)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.increment(&format!("k{}", i), 1, 60_000, 0).await.is_ok()
                })
            })
            .collect();

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                inserted += 1;
            }
        }

        assert_eq!(inserted, 10);
        assert_eq!(store.len(), 10);
    }

    #[tokio::test]
    async fn test_len_tracks_removals() {
        let store = MemoryStore::new();

        store.increment("window", 1, 1_000, 0).await.unwrap();
        store.append_if_below("log", 0, 1_000, 5).await.unwrap();
        store
            .update_bucket("bucket", 0, TokenBucketState::full(5.0, 0), |_| ((), 1_000))
            .unwrap();
        assert_eq!(store.len(), 3);

        store.reset_window("window").await.unwrap();
        store.reset_window("window").await.unwrap();
        store.reset_log("log").await.unwrap();
        store.reset_bucket("bucket");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_update_bucket_creates_from_init() {
        let store = MemoryStore::new();

        let tokens = store
            .update_bucket("k", 0, TokenBucketState::full(5.0, 0), |state| {
                state.tokens -= 1.0;
                (state.tokens, 1_000)
            })
            .unwrap();

        assert_eq!(tokens, 4.0);
        assert_eq!(store.get_bucket("k").map(|s| s.tokens), Some(4.0));

        store.reset_bucket("k");
        assert!(store.get_bucket("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_periodically() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));

        store.increment("k", 1, 1_000, 0).await.unwrap();
        let handle = store.spawn_sweeper(clock.clone(), Duration::from_secs(1));

        clock.set(5_000);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        tokio::task::yield_now().await;

        assert!(store.is_empty());
        assert!(!handle.is_finished());
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_when_store_dropped() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let handle = store.spawn_sweeper(clock, Duration::from_secs(1));

        drop(store);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        tokio::task::yield_now().await;

        assert!(handle.is_finished());
    }
}
