//! Redis Counter Store
//!
//! Shared backend for deployments with more than one gate instance. Each
//! window is a single integer key with a millisecond TTL, so Redis expiry
//! provides the absent-after-ttl guarantee and `INCR` provides atomicity
//! across processes.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tracing::info;

use super::config::DEFAULT_WINDOW_MS;
use super::store::{expiry_after, RateLimitStore, RateWindowRecord, StoreError};

/// Increment, make sure the key carries a TTL, and report both
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

pub const DEFAULT_KEY_PREFIX: &str = "metergate:ratelimit:";

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Redis-backed counter store
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    key_prefix: String,
    default_window: Duration,
    increment_script: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("default_window", &self.default_window)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `redis_url` with the default prefix and window
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!(url = %redis_url, "Connected to Redis counter store");

        Ok(Self {
            connection,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_window: Duration::from_millis(DEFAULT_WINDOW_MS),
            increment_script: redis::Script::new(INCREMENT_SCRIPT),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_default_window(mut self, window: Duration) -> Self {
        self.default_window = window;
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<RateWindowRecord>, StoreError> {
        let mut conn = self.connection.clone();
        let key = self.key(key);

        let (count, pttl): (Option<u64>, i64) = redis::pipe()
            .get(&key)
            .pttl(&key)
            .query_async(&mut conn)
            .await?;

        let Some(count) = count else {
            return Ok(None);
        };

        let now = Utc::now();
        let remaining = match pttl {
            // Key vanished between GET and PTTL
            -2 => return Ok(None),
            ms if ms < 0 => self.default_window,
            ms => Duration::from_millis(ms as u64),
        };

        Ok(Some(RateWindowRecord {
            count,
            reset_at: expiry_after(now, remaining),
        }))
    }

    async fn set(
        &self,
        key: &str,
        record: RateWindowRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(record.count)
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        record: RateWindowRecord,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(record.count)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn increment(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<RateWindowRecord, StoreError> {
        let mut conn = self.connection.clone();
        let (count, pttl): (u64, u64) = self
            .increment_script
            .key(self.key(key))
            .arg(ttl_ms(window))
            .invoke_async(&mut conn)
            .await?;
        Ok(RateWindowRecord {
            count,
            reset_at: expiry_after(Utc::now(), Duration::from_millis(pttl)),
        })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
