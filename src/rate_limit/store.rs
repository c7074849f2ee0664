//! Counter Store
//!
//! Storage contract for per-key rate windows plus the in-memory backend.
//! The Redis backend lives in `redis_store.rs` behind the `redis` feature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Per-key counter state for one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateWindowRecord {
    /// Requests admitted in the current window
    pub count: u64,

    /// Window expiry
    pub reset_at: DateTime<Utc>,
}

impl RateWindowRecord {
    /// Empty record for a window starting now
    pub fn fresh(window: Duration) -> Self {
        Self {
            count: 0,
            reset_at: expiry_after(Utc::now(), window),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }
}

/// Store failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable or returned an error
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Call did not complete in time
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// Stored value could not be decoded
    #[error("corrupt store entry: {0}")]
    Corrupt(String),
}

/// Counter store contract shared by every backend
///
/// `increment` must be atomic per key: concurrent callers never observe the
/// same count twice within one window.
#[async_trait]
pub trait RateLimitStore: Send + Sync + Debug {
    /// Live record for `key`, or `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<RateWindowRecord>, StoreError>;

    /// Upsert `record`; it becomes unreadable once `ttl` elapses
    async fn set(&self, key: &str, record: RateWindowRecord, ttl: Duration)
        -> Result<(), StoreError>;

    /// Store `record` only if no live record exists. Returns whether it was stored.
    async fn insert_if_absent(
        &self,
        key: &str,
        record: RateWindowRecord,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Add one to the count and return the updated record
    ///
    /// Starts a `window`-long window at count 1 when none is live.
    async fn increment(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<RateWindowRecord, StoreError>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Copy)]
struct StoredWindow {
    record: RateWindowRecord,
    expires_at: DateTime<Utc>,
}

impl StoredWindow {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Process-local store
///
/// Expired entries are hidden on read and removed by [`InMemoryStore::purge_expired`].
/// Counts are only consistent within one process; multi-instance deployments
/// need a shared backend.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    windows: Arc<RwLock<HashMap<String, StoredWindow>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Drop expired windows, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut windows = self.windows.write().await;
        let before = windows.len();
        windows.retain(|_, window| window.is_live(now));
        before - windows.len()
    }

    /// Number of live windows
    pub async fn len(&self) -> usize {
        let now = Utc::now();
        let windows = self.windows.read().await;
        windows.values().filter(|w| w.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        self.windows.write().await.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<RateWindowRecord>, StoreError> {
        let now = Utc::now();
        let windows = self.windows.read().await;
        Ok(windows
            .get(key)
            .filter(|w| w.is_live(now))
            .map(|w| w.record))
    }

    async fn set(
        &self,
        key: &str,
        record: RateWindowRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let expires_at = expiry_after(Utc::now(), ttl);
        let mut windows = self.windows.write().await;
        windows.insert(key.to_string(), StoredWindow { record, expires_at });
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        record: RateWindowRecord,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut windows = self.windows.write().await;

        if windows.get(key).is_some_and(|w| w.is_live(now)) {
            return Ok(false);
        }

        windows.insert(
            key.to_string(),
            StoredWindow {
                record,
                expires_at: expiry_after(now, ttl),
            },
        );
        Ok(true)
    }

    async fn increment(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<RateWindowRecord, StoreError> {
        let now = Utc::now();
        let mut windows = self.windows.write().await;

        match windows.get_mut(key) {
            Some(stored) if stored.is_live(now) => {
                stored.record.count += 1;
                Ok(stored.record)
            }
            _ => {
                let reset_at = expiry_after(now, window);
                let record = RateWindowRecord { count: 1, reset_at };
                windows.insert(
                    key.to_string(),
                    StoredWindow {
                        record,
                        expires_at: reset_at,
                    },
                );
                Ok(record)
            }
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
