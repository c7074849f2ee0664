//! Rate Limiting Module
//!
//! Per-key fixed-window request admission with pluggable counter storage.
//!
//! # Features
//!
//! - Four named tiers (`free`, `pro`, `enterprise`, `api`) plus custom budgets
//! - Store contract with atomic `increment` and absent-after-ttl expiry
//! - In-memory backend, Redis backend behind the `redis` feature
//! - Explicit fail-open / fail-closed behaviour on store errors and timeouts
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 RateLimiter                   │
//! │   get → insert_if_absent → increment → cmp    │
//! ├──────────────────────────────────────────────┤
//! │            dyn RateLimitStore                 │
//! │   ┌──────────────┐      ┌──────────────┐      │
//! │   │ InMemoryStore│      │  RedisStore  │      │
//! │   └──────────────┘      └──────────────┘      │
//! └──────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod limiter;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;

#[cfg(test)]
mod proptests;

pub use config::{
    KeyStrategy, RateLimitConfig, RateLimitSpec, RateLimitTier, StoreBackend, StoreFailurePolicy,
};
pub use limiter::{RateLimitResult, RateLimiter};
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use store::{InMemoryStore, RateLimitStore, RateWindowRecord, StoreError};
