//! Redis-backed counting store.
//!
//! Shares window and bucket state across every instance of a service.
//!
//! ## Data model
//!
//! - Sliding windows: one sorted set per key, scored by epoch milliseconds,
//!   with members `"<ms>-<uuid>"` so concurrent requests in the same
//!   millisecond stay distinct. `PEXPIRE` of one window.
//! - Token buckets: one hash per key with fields `tokens` and `last_refill`,
//!   expiring after the bucket TTL.
//!
//! Every operation is a single Lua script, executed atomically by Redis, so
//! no two instances can interleave a read and a write on the same key.
//!
//! ## Example
//!
//! ```rust,ignore
//! use request_throttle::{RateLimitGuard, RedisStore, SystemClock, ThrottleConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = RedisStore::connect("redis://127.0.0.1/")
//!         .await
//!         .expect("Failed to connect to Redis");
//!
//!     let config = ThrottleConfig::load("throttle.yaml").expect("invalid config");
//!     let guard = RateLimitGuard::new(&config, Arc::new(store), Arc::new(SystemClock::new()))
//!         .expect("invalid config");
//! }
//! ```

use crate::application::ports::{CountingStore, StoreError};
use crate::domain::bucket::{BucketDecision, BucketParams};
use crate::domain::window::{IncrementResult, WindowDecision};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

const WINDOW_INCREMENT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
redis.call('ZADD', key, now, ARGV[3])
redis.call('PEXPIRE', key, window)

local count = redis.call('ZCARD', key)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local reset = now + window
if oldest[2] then
    reset = tonumber(oldest[2]) + window
end
return {count, reset}
"#;

const WINDOW_CHECK: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)

local allowed = 0
local remaining = 0
if count < max then
    redis.call('ZADD', key, now, ARGV[4])
    allowed = 1
    remaining = max - count - 1
end
redis.call('PEXPIRE', key, window)

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local reset = now + window
if oldest[2] then
    reset = tonumber(oldest[2]) + window
end
return {allowed, remaining, reset}
"#;

const WINDOW_DECREMENT: &str = r#"
redis.call('ZPOPMAX', KEYS[1])
return 1
"#;

const BUCKET_CONSUME: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local size = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
    tokens = size
    last = now
end

local elapsed = math.max(0, now - last) / 1000
tokens = math.min(size, math.max(0, tokens + elapsed * rate))
last = math.max(last, now)

local allowed = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'last_refill', string.format('%d', last))
redis.call('PEXPIRE', key, ttl)
return {allowed, tostring(tokens)}
"#;

/// Redis-backed counting store for distributed rate limiting.
///
/// Cloning is cheap: clones share one multiplexed `ConnectionManager`, which
/// reconnects on its own after the server comes back.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    window_increment: Script,
    window_check: Script,
    window_decrement: Script,
    bucket_consume: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1/")
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the first connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(connection))
    }

    /// Wrap an existing connection manager.
    pub fn with_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            window_increment: Script::new(WINDOW_INCREMENT),
            window_check: Script::new(WINDOW_CHECK),
            window_decrement: Script::new(WINDOW_DECREMENT),
            bucket_consume: Script::new(BUCKET_CONSUME),
        }
    }
}

fn unavailable(error: RedisError) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

fn member(now_ms: u64) -> String {
    format!("{}-{}", now_ms, Uuid::new_v4())
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CountingStore for RedisStore {
    async fn window_increment(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<IncrementResult, StoreError> {
        let mut conn = self.connection.clone();
        let (total_hits, reset_time_ms): (u64, u64) = self
            .window_increment
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(member(now_ms))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(IncrementResult {
            total_hits,
            reset_time_ms,
        })
    }

    async fn window_check(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u64,
    ) -> Result<WindowDecision, StoreError> {
        let mut conn = self.connection.clone();
        let (allowed, remaining, reset_time_ms): (u8, u64, u64) = self
            .window_check
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(max_requests)
            .arg(member(now_ms))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(WindowDecision {
            allowed: allowed == 1,
            remaining,
            reset_time_ms,
        })
    }

    async fn window_decrement(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = self
            .window_decrement
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn bucket_consume(
        &self,
        key: &str,
        now_ms: u64,
        params: BucketParams,
        ttl: Duration,
    ) -> Result<BucketDecision, StoreError> {
        let mut conn = self.connection.clone();
        let (allowed, tokens): (u8, String) = self
            .bucket_consume
            .key(key)
            .arg(now_ms)
            .arg(params.bucket_size)
            .arg(params.refill_per_sec)
            .arg(duration_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let tokens_remaining = tokens
            .parse::<f64>()
            .map_err(|_| StoreError::Corrupt(format!("bucket tokens `{}`", tokens)))?;

        Ok(BucketDecision {
            allowed: allowed == 1,
            tokens_remaining,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await.map_err(unavailable)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
