//! Rate Limiter
//!
//! Fixed-window admission gate over a [`RateLimitStore`].

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::config::{RateLimitSpec, RateLimitTier, StoreFailurePolicy, DEFAULT_STORE_TIMEOUT_MS};
use super::store::{RateLimitStore, RateWindowRecord, StoreError};
use crate::error::GateError;
use crate::metrics::{RATE_LIMIT_DECISIONS_TOTAL, RATE_LIMIT_STORE_ERRORS_TOTAL};

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    /// Whether the request is allowed
    pub allowed: bool,

    /// Window budget
    pub limit: u32,

    /// Count observed for this request (0 when the store was not consulted)
    pub count: u64,

    /// Requests left in the window
    pub remaining: u32,

    /// When the current window ends
    pub reset_at: DateTime<Utc>,

    /// Seconds until the window resets (if not allowed)
    pub retry_after_secs: Option<u64>,

    /// Admitted without consulting the store (fail-open)
    pub degraded: bool,

    /// Reason for denial or degradation
    pub reason: Option<String>,
}

impl RateLimitResult {
    /// Create an allowed result
    pub fn allowed(limit: u32, count: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit,
            count,
            remaining: remaining(limit, count),
            reset_at,
            retry_after_secs: None,
            degraded: false,
            reason: None,
        }
    }

    /// Create a denied result
    pub fn denied(limit: u32, count: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            limit,
            count,
            remaining: 0,
            reset_at,
            retry_after_secs: Some(seconds_until(reset_at)),
            degraded: false,
            reason: Some("Rate limit exceeded".to_string()),
        }
    }

    /// Allowed because the store failed and the policy is fail-open
    pub fn degraded(limit: u32, reason: String) -> Self {
        Self {
            allowed: true,
            limit,
            count: 0,
            remaining: limit,
            reset_at: Utc::now(),
            retry_after_secs: None,
            degraded: true,
            reason: Some(reason),
        }
    }

    /// Allowed because rate limiting is disabled
    pub fn bypass() -> Self {
        Self {
            allowed: true,
            limit: u32::MAX,
            count: 0,
            remaining: u32::MAX,
            reset_at: Utc::now(),
            retry_after_secs: None,
            degraded: false,
            reason: None,
        }
    }

    /// Convert a denial into [`GateError::RateLimited`]
    pub fn into_admission(self) -> Result<Self, GateError> {
        if self.allowed {
            return Ok(self);
        }
        Err(GateError::RateLimited {
            limit: self.limit,
            reset_at: self.reset_at,
            retry_after_secs: self.retry_after_secs.unwrap_or(1),
        })
    }
}

fn remaining(limit: u32, count: u64) -> u32 {
    u64::from(limit).saturating_sub(count) as u32
}

fn seconds_until(reset_at: DateTime<Utc>) -> u64 {
    let millis = (reset_at - Utc::now()).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}

/// Request gate for one budget
#[derive(Debug, Clone)]
pub struct RateLimiter {
    spec: RateLimitSpec,
    store: Arc<dyn RateLimitStore>,
    failure_policy: StoreFailurePolicy,
    store_timeout: Duration,
    label: String,
}

impl RateLimiter {
    /// Create a limiter for an explicit `{limit, window}` budget
    pub fn new(spec: impl Into<RateLimitSpec>, store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            spec: spec.into(),
            store,
            failure_policy: StoreFailurePolicy::default(),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            label: "custom".to_string(),
        }
    }

    /// Create a limiter for a named tier
    pub fn for_tier(tier: RateLimitTier, store: Arc<dyn RateLimitStore>) -> Self {
        Self::new(tier, store).with_label(tier.as_str())
    }

    /// Create a limiter from a tier name such as `"pro"`
    pub fn from_tier_name(name: &str, store: Arc<dyn RateLimitStore>) -> Result<Self, GateError> {
        let tier: RateLimitTier = name.parse()?;
        Ok(Self::for_tier(tier, store))
    }

    pub fn with_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Metric label for this limiter
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn spec(&self) -> RateLimitSpec {
        self.spec
    }

    /// Count a request against `key` and decide whether it may proceed
    ///
    /// Only returns an error when the store fails under the fail-closed policy.
    pub async fn check(&self, key: &str) -> Result<RateLimitResult, GateError> {
        match self.count_request(key).await {
            Ok(RateWindowRecord { count, reset_at }) => {
                let result = if count > u64::from(self.spec.limit) {
                    debug!(key = %key, count, limit = self.spec.limit, "Rate limit exceeded");
                    RateLimitResult::denied(self.spec.limit, count, reset_at)
                } else {
                    RateLimitResult::allowed(self.spec.limit, count, reset_at)
                };

                let decision = if result.allowed { "allowed" } else { "denied" };
                RATE_LIMIT_DECISIONS_TOTAL
                    .with_label_values(&[self.label.as_str(), decision])
                    .inc();
                Ok(result)
            }
            Err(err) => self.on_store_failure(key, err),
        }
    }

    /// Like [`RateLimiter::check`], but a denial becomes [`GateError::RateLimited`]
    pub async fn enforce(&self, key: &str) -> Result<RateLimitResult, GateError> {
        self.check(key).await?.into_admission()
    }

    async fn count_request(&self, key: &str) -> Result<RateWindowRecord, StoreError> {
        if self.call(self.store.get(key)).await?.is_none() {
            let fresh = RateWindowRecord::fresh(self.spec.window);
            // Losing this race is fine: another request opened the window first
            self.call(self.store.insert_if_absent(key, fresh, self.spec.window))
                .await?;
        }

        // The window may roll over before this lands, so trust the returned record
        self.call(self.store.increment(key, self.spec.window)).await
    }

    async fn call<T>(
        &self,
        operation: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.store_timeout, operation)
            .await
            .map_err(|_| StoreError::Timeout(self.store_timeout))?
    }

    fn on_store_failure(&self, key: &str, err: StoreError) -> Result<RateLimitResult, GateError> {
        let kind = match err {
            StoreError::Timeout(_) => "timeout",
            _ => "error",
        };
        RATE_LIMIT_STORE_ERRORS_TOTAL
            .with_label_values(&[self.store.name(), kind])
            .inc();

        match self.failure_policy {
            StoreFailurePolicy::FailOpen => {
                warn!(
                    key = %key,
                    store = self.store.name(),
                    error = %err,
                    "Rate limit store failed, admitting request (fail-open)"
                );
                RATE_LIMIT_DECISIONS_TOTAL
                    .with_label_values(&[self.label.as_str(), "degraded"])
                    .inc();
                Ok(RateLimitResult::degraded(self.spec.limit, err.to_string()))
            }
            StoreFailurePolicy::FailClosed => {
                warn!(
                    key = %key,
                    store = self.store.name(),
                    error = %err,
                    "Rate limit store failed, rejecting request (fail-closed)"
                );
                RATE_LIMIT_DECISIONS_TOTAL
                    .with_label_values(&[self.label.as_str(), "store_error"])
                    .inc();
                Err(GateError::StoreUnavailable(err.to_string()))
            }
        }
    }
}
