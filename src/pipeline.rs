//! Gate Pipeline
//!
//! Admission runs as an ordered list of gates over a [`RequestContext`]. Each
//! gate either enriches the context and lets it continue or rejects the
//! request; the first rejection ends the run.
//!
//! ```text
//! RequestContext ──▶ RateLimitGate ──▶ CreditCheckGate ──▶ admitted context
//!                         │                   │
//!                         ▼                   ▼
//!                   RATE_LIMITED      UNAUTHORIZED / INSUFFICIENT_CREDITS
//! ```

use async_trait::async_trait;
use axum::http::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::credits::{CreditCheckContext, CreditCheckParams, CreditGate, RequestMetadata};
use crate::error::GateError;
use crate::metrics::GATE_DURATION_SECONDS;
use crate::rate_limit::{
    KeyStrategy, RateLimitConfig, RateLimitResult, RateLimitStore, RateLimitTier, RateLimiter,
};

pub const ORGANIZATION_HEADER: &str = "x-organization-id";
pub const USER_HEADER: &str = "x-user-id";
pub const API_KEY_HEADER: &str = "x-api-key";

/// State carried through the gates for one request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    /// Identity used for rate limiting
    pub caller_key: String,
    pub organization_id: Option<String>,
    pub user_id: Option<String>,
    pub metadata: RequestMetadata,
    pub estimated_tokens: u64,
    /// Set by [`RateLimitGate`]
    pub rate_limit: Option<RateLimitResult>,
    /// Set by [`CreditCheckGate`]
    pub credit: Option<CreditCheckContext>,
}

impl RequestContext {
    pub fn new(caller_key: impl Into<String>, estimated_tokens: u64) -> Self {
        Self {
            caller_key: caller_key.into(),
            organization_id: None,
            user_id: None,
            metadata: RequestMetadata::default(),
            estimated_tokens,
            rate_limit: None,
            credit: None,
        }
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Build a context from request headers
    ///
    /// Identity comes from the upstream-authenticated `x-organization-id` and
    /// `x-user-id` headers. The caller key follows `strategy` and falls back to
    /// the client IP when the chosen identity is missing.
    pub fn from_headers(headers: &HeaderMap, strategy: KeyStrategy, estimated_tokens: u64) -> Self {
        let metadata = crate::credits::extract_request_metadata(headers);
        let organization_id = header_value(headers, ORGANIZATION_HEADER);
        let user_id = header_value(headers, USER_HEADER);

        let identity = match strategy {
            KeyStrategy::Ip => None,
            KeyStrategy::ApiKey => api_key(headers).map(|key| format!("key:{key}")),
            KeyStrategy::User => user_id.as_ref().map(|id| format!("user:{id}")),
            KeyStrategy::Organization => organization_id.as_ref().map(|id| format!("org:{id}")),
        };
        let caller_key = identity.unwrap_or_else(|| format!("ip:{}", metadata.ip_address));

        Self {
            caller_key,
            organization_id,
            user_id,
            metadata,
            estimated_tokens,
            rate_limit: None,
            credit: None,
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn api_key(headers: &HeaderMap) -> Option<String> {
    header_value(headers, API_KEY_HEADER).or_else(|| {
        header_value(headers, "authorization")
            .and_then(|auth| auth.strip_prefix("Bearer ").map(|t| t.trim().to_string()))
            .filter(|t| !t.is_empty())
    })
}

/// Result of one gate
#[derive(Debug)]
pub enum GateOutcome {
    Continue(RequestContext),
    Reject(GateError),
}

#[async_trait]
pub trait Gate: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &'static str;

    async fn evaluate(&self, ctx: RequestContext) -> GateOutcome;
}

/// Ordered gate composition
#[derive(Clone, Default)]
pub struct GatePipeline {
    gates: Vec<Arc<dyn Gate>>,
}

impl std::fmt::Debug for GatePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.gates.iter().map(|g| g.name()).collect();
        f.debug_struct("GatePipeline").field("gates", &names).finish()
    }
}

impl GatePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gate(mut self, gate: impl Gate + 'static) -> Self {
        self.gates.push(Arc::new(gate));
        self
    }

    pub fn gate_names(&self) -> Vec<&'static str> {
        self.gates.iter().map(|g| g.name()).collect()
    }

    /// Run every gate in order, stopping at the first rejection
    pub async fn run(&self, mut ctx: RequestContext) -> Result<RequestContext, GateError> {
        for gate in &self.gates {
            let start = Instant::now();
            let outcome = gate.evaluate(ctx).await;
            let elapsed = start.elapsed().as_secs_f64();

            match outcome {
                GateOutcome::Continue(next) => {
                    GATE_DURATION_SECONDS
                        .with_label_values(&[gate.name(), "continue"])
                        .observe(elapsed);
                    ctx = next;
                }
                GateOutcome::Reject(err) => {
                    GATE_DURATION_SECONDS
                        .with_label_values(&[gate.name(), "reject"])
                        .observe(elapsed);
                    debug!(gate = gate.name(), code = err.code(), "Request rejected");
                    return Err(err);
                }
            }
        }
        Ok(ctx)
    }
}

/// Per-tier rate limiting over one shared store
#[derive(Debug, Clone)]
pub struct RateLimitGate {
    config: RateLimitConfig,
    limiters: HashMap<RateLimitTier, RateLimiter>,
}

impl RateLimitGate {
    pub fn new(config: RateLimitConfig, store: Arc<dyn RateLimitStore>) -> Self {
        let limiters = RateLimitTier::ALL
            .into_iter()
            .map(|tier| {
                let limiter = RateLimiter::for_tier(tier, store.clone())
                    .with_failure_policy(config.failure_policy)
                    .with_store_timeout(config.store_timeout());
                (tier, limiter)
            })
            .collect();
        Self { config, limiters }
    }
}

#[async_trait]
impl Gate for RateLimitGate {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn evaluate(&self, mut ctx: RequestContext) -> GateOutcome {
        if !self.config.enabled {
            ctx.rate_limit = Some(RateLimitResult::bypass());
            return GateOutcome::Continue(ctx);
        }

        let tier = self.config.tier_for(ctx.organization_id.as_deref());
        let Some(limiter) = self.limiters.get(&tier) else {
            return GateOutcome::Reject(GateError::Config(format!("no limiter for tier {tier}")));
        };
        let key = format!("{}:{}", tier, ctx.caller_key);

        match limiter.enforce(&key).await {
            Ok(result) => {
                ctx.rate_limit = Some(result);
                GateOutcome::Continue(ctx)
            }
            Err(err) => GateOutcome::Reject(err),
        }
    }
}

/// Pre-flight credit check
#[derive(Debug, Clone)]
pub struct CreditCheckGate {
    credits: CreditGate,
}

impl CreditCheckGate {
    pub fn new(credits: CreditGate) -> Self {
        Self { credits }
    }
}

#[async_trait]
impl Gate for CreditCheckGate {
    fn name(&self) -> &'static str {
        "credit_check"
    }

    async fn evaluate(&self, mut ctx: RequestContext) -> GateOutcome {
        let params = CreditCheckParams {
            organization_id: ctx.organization_id.clone(),
            user_id: ctx.user_id.clone(),
            estimated_tokens: ctx.estimated_tokens,
        };

        match self.credits.admit(params).await {
            Ok(credit) => {
                ctx.credit = Some(credit);
                GateOutcome::Continue(ctx)
            }
            Err(err) => GateOutcome::Reject(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::InMemoryLedger;
    use crate::error::UnauthorizedReason;
    use crate::rate_limit::InMemoryStore;
    use axum::http::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pipeline(config: RateLimitConfig, balances: &[(&str, i64)]) -> GatePipeline {
        let store: Arc<dyn RateLimitStore> = Arc::new(InMemoryStore::new());
        let ledger = InMemoryLedger::with_balances(balances.iter().map(|(o, b)| (*o, *b)));
        GatePipeline::new()
            .with_gate(RateLimitGate::new(config, store))
            .with_gate(CreditCheckGate::new(CreditGate::new(Arc::new(ledger))))
    }

    fn ctx(caller: &str, org: &str) -> RequestContext {
        RequestContext::new(caller, 1000)
            .with_organization(org)
            .with_user("user-1")
    }

    /// Counts how often it runs
    struct CountingGate(Arc<AtomicUsize>);

    #[async_trait]
    impl Gate for CountingGate {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn evaluate(&self, ctx: RequestContext) -> GateOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            GateOutcome::Continue(ctx)
        }
    }

    struct RejectingGate;

    #[async_trait]
    impl Gate for RejectingGate {
        fn name(&self) -> &'static str {
            "rejecting"
        }

        async fn evaluate(&self, _ctx: RequestContext) -> GateOutcome {
            GateOutcome::Reject(GateError::InvalidRequest("nope".to_string()))
        }
    }

    #[tokio::test]
    async fn test_empty_pipeline_passes_through() {
        let result = GatePipeline::new().run(ctx("ip:1", "org-1")).await.unwrap();
        assert!(result.rate_limit.is_none());
        assert!(result.credit.is_none());
    }

    #[tokio::test]
    async fn test_first_rejection_stops_pipeline() {
        let runs = Arc::new(AtomicUsize::new(0));
        let pipeline = GatePipeline::new()
            .with_gate(CountingGate(runs.clone()))
            .with_gate(RejectingGate)
            .with_gate(CountingGate(runs.clone()));

        let err = pipeline.run(ctx("ip:1", "org-1")).await.unwrap_err();

        assert_eq!(err.code(), "INVALID_REQUEST");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.gate_names(), vec!["counting", "rejecting", "counting"]);
    }

    #[tokio::test]
    async fn test_admitted_context_carries_both_results() {
        let pipeline = pipeline(RateLimitConfig::default(), &[("org-1", 5)]);

        let admitted = pipeline.run(ctx("ip:1", "org-1")).await.unwrap();

        let rate = admitted.rate_limit.unwrap();
        assert_eq!(rate.limit, 60);
        assert_eq!(rate.remaining, 59);
        let credit = admitted.credit.unwrap();
        assert_eq!(credit.organization_id, "org-1");
        assert_eq!(credit.estimated_credits, 1);
    }

    #[tokio::test]
    async fn test_tier_assignment_by_organization() {
        let mut config = RateLimitConfig::default();
        config
            .organization_tiers
            .insert("org-pro".to_string(), RateLimitTier::Pro);
        let pipeline = pipeline(config, &[("org-pro", 5), ("org-free", 5)]);

        let pro = pipeline.run(ctx("ip:1", "org-pro")).await.unwrap();
        let free = pipeline.run(ctx("ip:1", "org-free")).await.unwrap();

        assert_eq!(pro.rate_limit.unwrap().limit, 300);
        assert_eq!(free.rate_limit.unwrap().limit, 60);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_before_credit_check() {
        let pipeline = pipeline(RateLimitConfig::default(), &[]);

        // Unknown org has no credits, but the limiter answers first once exhausted
        for _ in 0..60 {
            let err = pipeline.run(ctx("ip:9", "org-broke")).await.unwrap_err();
            assert_eq!(err.code(), "INSUFFICIENT_CREDITS");
        }
        let err = pipeline.run(ctx("ip:9", "org-broke")).await.unwrap_err();
        assert!(matches!(err, GateError::RateLimited { limit: 60, .. }));
    }

    #[tokio::test]
    async fn test_disabled_rate_limit_bypasses() {
        let pipeline = pipeline(RateLimitConfig::disabled(), &[("org-1", 5)]);

        let admitted = pipeline.run(ctx("ip:1", "org-1")).await.unwrap();
        assert_eq!(admitted.rate_limit.unwrap().limit, u32::MAX);
    }

    #[tokio::test]
    async fn test_missing_user_is_unauthorized() {
        let pipeline = pipeline(RateLimitConfig::default(), &[("org-1", 5)]);
        let context = RequestContext::new("ip:1", 1000).with_organization("org-1");

        let err = pipeline.run(context).await.unwrap_err();
        assert!(matches!(
            err,
            GateError::Unauthorized(UnauthorizedReason::MissingUser)
        ));
    }

    #[test]
    fn test_context_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(ORGANIZATION_HEADER, HeaderValue::from_static("org-1"));
        headers.insert(USER_HEADER, HeaderValue::from_static("user-7"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-test"));

        let by_ip = RequestContext::from_headers(&headers, KeyStrategy::Ip, 500);
        assert_eq!(by_ip.caller_key, "ip:10.0.0.1");
        assert_eq!(by_ip.organization_id.as_deref(), Some("org-1"));
        assert_eq!(by_ip.user_id.as_deref(), Some("user-7"));
        assert_eq!(by_ip.estimated_tokens, 500);

        let by_user = RequestContext::from_headers(&headers, KeyStrategy::User, 500);
        assert_eq!(by_user.caller_key, "user:user-7");

        let by_org = RequestContext::from_headers(&headers, KeyStrategy::Organization, 500);
        assert_eq!(by_org.caller_key, "org:org-1");

        let by_key = RequestContext::from_headers(&headers, KeyStrategy::ApiKey, 500);
        assert_eq!(by_key.caller_key, "key:sk-test");
    }

    #[test]
    fn test_missing_identity_falls_back_to_ip() {
        let headers = HeaderMap::new();
        let ctx = RequestContext::from_headers(&headers, KeyStrategy::User, 1000);
        assert_eq!(ctx.caller_key, "ip:unknown");
        assert!(ctx.organization_id.is_none());
    }
}
