// HTTP sidecar for the metering gate
//
// Callers ask for admission before a billable AI call and report usage after
// it. Identity comes from upstream-authenticated headers:
// - x-organization-id (tenant)
// - x-user-id (actor)
//
// Routes:
// - GET  /health, GET /metrics
// - POST /v1/meter/admit, POST /v1/meter/settle
// - GET  /v1/credits/balance, GET /v1/credits/transactions
// - /admin/* for grants and reconciliation (when enabled)

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::credits::{
    extract_request_metadata, run_reconciliation_loop, CreditCheckContext, CreditGate,
    CreditLedger, InMemoryLedger, LedgerError, ReconciliationQueue, RequestMetadata, UsageReport,
};
use crate::error::{GateError, UnauthorizedReason};
use crate::metrics;
use crate::pipeline::{
    CreditCheckGate, GatePipeline, RateLimitGate, RequestContext, ORGANIZATION_HEADER,
};
use crate::rate_limit::{
    InMemoryStore, RateLimitConfig, RateLimitResult, RateLimitStore, StoreBackend,
};

const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const RATE_LIMIT_DEGRADED: HeaderName = HeaderName::from_static("x-ratelimit-degraded");

/// How often expired in-memory windows are swept
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Shared handles for the request handlers
#[derive(Debug, Clone)]
pub struct AppState {
    pub pipeline: GatePipeline,
    pub credit_gate: CreditGate,
    pub ledger: Arc<dyn CreditLedger>,
    pub reconciliation: ReconciliationQueue,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the gate pipeline over the given store and ledger
    pub fn new(
        config: Config,
        store: Arc<dyn RateLimitStore>,
        ledger: Arc<dyn CreditLedger>,
        reconciliation: ReconciliationQueue,
    ) -> Self {
        let credit_gate = CreditGate::new(ledger.clone())
            .with_reconciliation(reconciliation.clone())
            .with_ledger_timeout(config.credits.ledger_timeout());

        let pipeline = GatePipeline::new()
            .with_gate(RateLimitGate::new(config.rate_limit.clone(), store))
            .with_gate(CreditCheckGate::new(credit_gate.clone()));

        Self {
            pipeline,
            credit_gate,
            ledger,
            reconciliation,
            config: Arc::new(config),
        }
    }
}

/// Build the router for `state`
pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/v1/meter/admit", post(admit_handler))
        .route("/v1/meter/settle", post(settle_handler))
        .route("/v1/credits/balance", get(balance_handler))
        .route("/v1/credits/transactions", get(transactions_handler));

    if state.config.metrics.enabled {
        app = app.route("/metrics", get(metrics_handler));
    }

    if state.config.server.admin_enabled {
        app = app
            .route("/admin/credits/grant", post(grant_handler))
            .route("/admin/reconciliation", get(reconciliation_handler))
            .route("/admin/reconciliation/retry", post(retry_handler))
            .route("/admin/reconciliation/{id}", delete(discard_handler));
    }

    let timeout = state.config.server.request_timeout();
    app.with_state(state)
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
}

/// Start the sidecar and serve until Ctrl-C
pub async fn start_server(config: Config) -> Result<()> {
    if let Err(e) = metrics::init() {
        warn!("Metrics registry already initialized: {}", e);
    }

    let store = build_store(&config.rate_limit).await?;
    let ledger: Arc<dyn CreditLedger> = Arc::new(InMemoryLedger::with_balances(
        config.credits.initial_balances.clone(),
    ));
    let reconciliation = ReconciliationQueue::new(config.credits.retry.clone())
        .with_ledger_timeout(config.credits.ledger_timeout());

    tokio::spawn(run_reconciliation_loop(
        reconciliation.clone(),
        ledger.clone(),
        config.credits.retry.clone(),
        config.credits.reconciliation_interval(),
    ));

    let addr = config.server.bind_address();
    let state = AppState::new(config, store, ledger, reconciliation);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("metergate listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("metergate stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

/// Counter store selected by configuration
pub async fn build_store(config: &RateLimitConfig) -> Result<Arc<dyn RateLimitStore>> {
    match config.store {
        StoreBackend::Memory => {
            let store = InMemoryStore::new();
            let sweeper = store.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PURGE_INTERVAL);
                loop {
                    ticker.tick().await;
                    let purged = sweeper.purge_expired().await;
                    if purged > 0 {
                        tracing::debug!(purged, "Purged expired rate limit windows");
                    }
                }
            });
            Ok(Arc::new(store))
        }
        StoreBackend::Redis => redis_store(config).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_store(config: &RateLimitConfig) -> Result<Arc<dyn RateLimitStore>> {
    let url = config
        .redis_url
        .as_deref()
        .context("Redis store selected but no redis_url configured")?;
    let store = crate::rate_limit::RedisStore::connect(url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", url))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn redis_store(_config: &RateLimitConfig) -> Result<Arc<dyn RateLimitStore>> {
    anyhow::bail!("Redis store selected but metergate was built without the 'redis' feature")
}

fn caller_organization(headers: &HeaderMap) -> Result<String, GateError> {
    headers
        .get(ORGANIZATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(GateError::Unauthorized(UnauthorizedReason::MissingOrganization))
}

fn ledger_error(err: LedgerError) -> GateError {
    match err {
        LedgerError::InvalidAmount(msg) => GateError::InvalidRequest(msg),
        other => GateError::StoreUnavailable(other.to_string()),
    }
}

fn rate_limit_headers(result: &RateLimitResult) -> Vec<(HeaderName, HeaderValue)> {
    let mut headers = vec![
        (RATE_LIMIT_LIMIT, HeaderValue::from(result.limit)),
        (RATE_LIMIT_REMAINING, HeaderValue::from(result.remaining)),
        (RATE_LIMIT_RESET, HeaderValue::from(result.reset_at.timestamp())),
    ];
    if result.degraded {
        headers.push((RATE_LIMIT_DEGRADED, HeaderValue::from_static("true")));
    }
    headers
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdmitBody {
    #[serde(default)]
    estimated_tokens: Option<u64>,
}

/// Pre-flight admission: rate limit then credit check
async fn admit_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GateError> {
    let body: AdmitBody = if body.is_empty() {
        AdmitBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| GateError::InvalidRequest(e.to_string()))?
    };

    let estimated_tokens = body
        .estimated_tokens
        .unwrap_or(state.config.credits.default_estimated_tokens);
    let ctx = RequestContext::from_headers(
        &headers,
        state.config.rate_limit.key_strategy,
        estimated_tokens,
    );

    let admitted = state.pipeline.run(ctx).await?;
    let credit = admitted
        .credit
        .ok_or_else(|| GateError::Config("credit check gate not configured".to_string()))?;

    let mut response = Json(credit).into_response();
    if let Some(rate_limit) = &admitted.rate_limit {
        response.headers_mut().extend(rate_limit_headers(rate_limit));
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct SettleBody {
    context: CreditCheckContext,
    usage: UsageReport,
}

/// Post-flight accounting; failures are reported in the body, not the status
async fn settle_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SettleBody>,
) -> Result<Response, GateError> {
    let organization_id = caller_organization(&headers)?;
    if organization_id != body.context.organization_id {
        warn!(
            caller = %organization_id,
            context = %body.context.organization_id,
            request_id = %body.context.request_id,
            "Settlement attempted for another organization"
        );
        return Err(GateError::Unauthorized(
            UnauthorizedReason::OrganizationMismatch,
        ));
    }

    let mut usage = body.usage;
    if usage.metadata == RequestMetadata::default() {
        usage.metadata = extract_request_metadata(&headers);
    }

    let outcome = state
        .credit_gate
        .process_deduction(&body.context, usage)
        .await;
    Ok(Json(outcome).into_response())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    organization_id: String,
    balance: i64,
}

async fn balance_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GateError> {
    let organization_id = caller_organization(&headers)?;
    let balance = state
        .ledger
        .balance(&organization_id)
        .await
        .map_err(ledger_error)?;

    Ok(Json(BalanceResponse {
        organization_id,
        balance,
    })
    .into_response())
}

async fn transactions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GateError> {
    let organization_id = caller_organization(&headers)?;
    let transactions = state
        .ledger
        .transactions(&organization_id)
        .await
        .map_err(ledger_error)?;

    Ok(Json(json!({
        "organizationId": organization_id,
        "transactions": transactions,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantBody {
    organization_id: String,
    credits: u64,
    #[serde(default)]
    description: Option<String>,
}

async fn grant_handler(
    State(state): State<AppState>,
    Json(body): Json<GrantBody>,
) -> Result<Response, GateError> {
    if body.organization_id.trim().is_empty() {
        return Err(GateError::InvalidRequest(
            "organizationId must not be empty".to_string(),
        ));
    }

    let transaction = state
        .ledger
        .grant(&body.organization_id, body.credits, body.description)
        .await
        .map_err(ledger_error)?;

    info!(
        organization_id = %transaction.organization_id,
        credits = transaction.credits,
        balance = transaction.balance_after,
        "Credits granted"
    );
    Ok((StatusCode::CREATED, Json(transaction)).into_response())
}

async fn reconciliation_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "pending": state.reconciliation.pending().await,
        "deadLetters": state.reconciliation.dead_letters().await,
    }))
}

async fn retry_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state
        .reconciliation
        .retry_pending(state.ledger.as_ref(), &state.config.credits.retry)
        .await;
    Json(report)
}

/// Drop a pending or dead-lettered entry once it has been settled by hand
async fn discard_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.reconciliation.discard(&id).await {
        info!(id = %id, "Reconciliation entry discarded");
        return StatusCode::NO_CONTENT.into_response();
    }

    let body = json!({
        "error": "NOT_FOUND",
        "message": format!("No reconciliation entry with id {id}"),
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}
