//! Rate Limit Configuration
//!
//! Tier table and limiter configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::GateError;

/// Default window for every tier (one minute)
pub const DEFAULT_WINDOW_MS: u64 = 60_000;

/// Default timeout for a single store call
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 500;

/// A request budget: at most `limit` admitted requests per `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSpec {
    /// Maximum requests per window
    pub limit: u32,

    /// Window duration
    pub window: Duration,
}

impl RateLimitSpec {
    pub fn new(limit: u32, window_ms: u64) -> Self {
        Self {
            limit,
            window: Duration::from_millis(window_ms),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

/// Named rate limit tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitTier {
    Free,
    Pro,
    Enterprise,
    Api,
}

impl RateLimitTier {
    pub const ALL: [RateLimitTier; 4] = [
        RateLimitTier::Free,
        RateLimitTier::Pro,
        RateLimitTier::Enterprise,
        RateLimitTier::Api,
    ];

    /// Fixed limits for this tier
    pub fn spec(&self) -> RateLimitSpec {
        match self {
            RateLimitTier::Free => RateLimitSpec::new(60, DEFAULT_WINDOW_MS),
            RateLimitTier::Pro => RateLimitSpec::new(300, DEFAULT_WINDOW_MS),
            RateLimitTier::Enterprise => RateLimitSpec::new(1000, DEFAULT_WINDOW_MS),
            RateLimitTier::Api => RateLimitSpec::new(100, DEFAULT_WINDOW_MS),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitTier::Free => "free",
            RateLimitTier::Pro => "pro",
            RateLimitTier::Enterprise => "enterprise",
            RateLimitTier::Api => "api",
        }
    }
}

impl From<RateLimitTier> for RateLimitSpec {
    fn from(tier: RateLimitTier) -> Self {
        tier.spec()
    }
}

impl fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitTier {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(RateLimitTier::Free),
            "pro" => Ok(RateLimitTier::Pro),
            "enterprise" => Ok(RateLimitTier::Enterprise),
            "api" => Ok(RateLimitTier::Api),
            other => Err(GateError::Config(format!("unknown rate limit tier '{other}'"))),
        }
    }
}

/// What the limiter does when its store cannot answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Admit the request and flag the decision as degraded
    FailOpen,
    /// Reject the request with STORE_UNAVAILABLE
    #[default]
    FailClosed,
}

impl FromStr for StoreFailurePolicy {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_open" | "open" => Ok(StoreFailurePolicy::FailOpen),
            "fail_closed" | "closed" => Ok(StoreFailurePolicy::FailClosed),
            other => Err(GateError::Config(format!(
                "unknown store failure policy '{other}'"
            ))),
        }
    }
}

/// How the rate limit key is derived from a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Client IP address
    #[default]
    Ip,
    /// Bearer token or `x-api-key` header
    ApiKey,
    /// Authenticated user id
    User,
    /// Organization id
    Organization,
}

/// Counter store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Rate limit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Tier applied to organizations without an explicit assignment
    pub default_tier: RateLimitTier,

    /// Behaviour when the counter store errors or times out
    pub failure_policy: StoreFailurePolicy,

    /// Caller identity used as the counter key
    pub key_strategy: KeyStrategy,

    /// Timeout for a single store call in milliseconds
    pub store_timeout_ms: u64,

    /// Per-organization tier assignments
    pub organization_tiers: HashMap<String, RateLimitTier>,

    /// Counter store backend
    pub store: StoreBackend,

    /// Redis connection URL (redis backend only)
    pub redis_url: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_tier: RateLimitTier::Free,
            failure_policy: StoreFailurePolicy::default(),
            key_strategy: KeyStrategy::default(),
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            organization_tiers: HashMap::new(),
            store: StoreBackend::default(),
            redis_url: None,
        }
    }
}

impl RateLimitConfig {
    /// Create a new rate limit configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `METERGATE_*` environment overrides on top of this configuration
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("METERGATE_RATE_LIMIT_ENABLED") {
            self.enabled = val.parse().unwrap_or(true);
        }

        if let Ok(val) = std::env::var("METERGATE_RATE_LIMIT_TIER") {
            if let Ok(tier) = val.parse() {
                self.default_tier = tier;
            }
        }

        if let Ok(val) = std::env::var("METERGATE_RATE_LIMIT_FAILURE_POLICY") {
            if let Ok(policy) = val.parse() {
                self.failure_policy = policy;
            }
        }

        if let Ok(val) = std::env::var("METERGATE_STORE_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.store_timeout_ms = ms;
            }
        }

        if let Ok(url) = std::env::var("METERGATE_REDIS_URL") {
            self.redis_url = Some(url);
            self.store = StoreBackend::Redis;
        }

        self
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Tier for an organization, falling back to the default tier
    pub fn tier_for(&self, organization_id: Option<&str>) -> RateLimitTier {
        organization_id
            .and_then(|org| self.organization_tiers.get(org))
            .copied()
            .unwrap_or(self.default_tier)
    }

    /// Disable rate limiting (for testing)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}
