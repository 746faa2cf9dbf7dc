//! Shared store backed by Redis (or any RESP-compatible server such as
//! Dragonfly).
//!
//! Every mutation is a single server-side script so concurrent callers in
//! different processes can never interleave a read and a write for the same
//! key. Keys carry a TTL equal to their window, so idle identities expire
//! without a sweep.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info, warn};

use super::{LogSnapshot, LogStore, StoreError, WindowState, WindowStore};

/// INCRBY, and when the key did not exist before also PEXPIRE. A key that
/// lost its TTL is given one again rather than living forever.
const INCREMENT_SCRIPT: &str = r#"
local existed = redis.call('EXISTS', KEYS[1])
local current = redis.call('INCRBY', KEYS[1], ARGV[1])
local ttl = redis.call('PTTL', KEYS[1])
if existed == 0 or ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    ttl = tonumber(ARGV[2])
end
return {current, ttl}
"#;

/// Trim the sorted set below the floor, count, append only if below the
/// maximum, refresh the TTL and report the oldest surviving score.
const SLIDING_LOG_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
local appended = 0
if count < max then
    redis.call('ZADD', KEYS[1], now, ARGV[4])
    appended = 1
end
redis.call('PEXPIRE', KEYS[1], window)
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local oldest_score = -1
if oldest[2] then
    oldest_score = tonumber(oldest[2])
end
return {count, appended, oldest_score}
"#;

/// Redis-backed [`WindowStore`] and [`LogStore`].
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    increment_script: Script,
    sliding_log_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url` and verify the server answers PING.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| {
            warn!(error = %e, "Failed to create Redis client");
            StoreError::from(e)
        })?;

        let connection_manager = ConnectionManager::new(client).await.map_err(|e| {
            warn!(error = %e, "Failed to create Redis connection manager");
            StoreError::from(e)
        })?;

        let mut conn = connection_manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to ping Redis");
                StoreError::from(e)
            })?;

        info!("Connected to Redis store");

        Ok(Self {
            connection_manager,
            increment_script: Script::new(INCREMENT_SCRIPT),
            sliding_log_script: Script::new(SLIDING_LOG_SCRIPT),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("DEL").arg(key).query_async::<i64>(&mut conn).await?;
        debug!(key = %key, "Deleted Redis key");
        Ok(())
    }
}

fn reset_time_from_ttl(now: u64, ttl_ms: i64) -> Result<u64, StoreError> {
    if ttl_ms < 0 {
        return Err(StoreError::Corrupt(format!("unexpected PTTL {ttl_ms}")));
    }
    Ok(now.saturating_add(ttl_ms as u64))
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn increment(
        &self,
        key: &str,
        amount: u64,
        window_ms: u64,
        now: u64,
    ) -> Result<WindowState, StoreError> {
        let mut conn = self.connection_manager.clone();
        let (count, ttl_ms): (u64, i64) = self
            .increment_script
            .key(key)
            .arg(amount)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowState {
            count,
            reset_time: reset_time_from_ttl(now, ttl_ms)?,
        })
    }

    async fn get(&self, key: &str, now: u64) -> Result<Option<WindowState>, StoreError> {
        let mut conn = self.connection_manager.clone();
        let (count, ttl_ms): (Option<u64>, i64) = redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await?;

        match count {
            // -2 means the key vanished between commands; treat as no window.
            Some(count) if ttl_ms >= 0 => Ok(Some(WindowState {
                count,
                reset_time: reset_time_from_ttl(now, ttl_ms)?,
            })),
            _ => Ok(None),
        }
    }

    async fn reset_window(&self, key: &str) -> Result<(), StoreError> {
        self.delete(key).await
    }
}

#[async_trait]
impl LogStore for RedisStore {
    async fn append_if_below(
        &self,
        key: &str,
        now: u64,
        window_ms: u64,
        max: u64,
    ) -> Result<LogSnapshot, StoreError> {
        // Members must be unique even when two calls share a millisecond.
        let member = format!("{}-{}", now, uuid::Uuid::new_v4().simple());

        let mut conn = self.connection_manager.clone();
        let (count, appended, oldest): (u64, i64, i64) = self
            .sliding_log_script
            .key(key)
            .arg(now)
            .arg(window_ms)
            .arg(max)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        Ok(LogSnapshot {
            count,
            oldest: u64::try_from(oldest).ok(),
            appended: appended == 1,
        })
    }

    async fn reset_log(&self, key: &str) -> Result<(), StoreError> {
        self.delete(key).await
    }
}
