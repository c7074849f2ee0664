// Prometheus metrics for the metering gate
//
// Exposed on the sidecar's /metrics endpoint:
// - Rate limit decisions per tier (counter)
// - Counter store failures (counter)
// - Credit check outcomes and deductions (counter)
// - Reconciliation backlog (gauge)
// - Per-gate evaluation latency (histogram)

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Rate limiting
    pub static ref RATE_LIMIT_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rate_limit_decisions_total", "Rate limit decisions by tier and outcome"),
        &["tier", "decision"]
    ).expect("Failed to create rate limit decisions metric");

    pub static ref RATE_LIMIT_STORE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rate_limit_store_errors_total", "Counter store failures by backend and kind"),
        &["store", "kind"]
    ).expect("Failed to create store errors metric");

    // Credits
    pub static ref CREDIT_CHECKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("credit_checks_total", "Pre-flight credit checks by outcome"),
        &["outcome"]
    ).expect("Failed to create credit checks metric");

    pub static ref CREDIT_DEDUCTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("credit_deductions_total", "Post-flight deductions by outcome"),
        &["outcome"]
    ).expect("Failed to create credit deductions metric");

    pub static ref CREDITS_DEDUCTED_TOTAL: IntCounter = IntCounter::new(
        "credits_deducted_total",
        "Total credits deducted from organizations"
    ).expect("Failed to create credits deducted metric");

    pub static ref RECONCILIATION_PENDING: IntGauge = IntGauge::new(
        "reconciliation_pending",
        "Failed deductions awaiting reconciliation"
    ).expect("Failed to create reconciliation pending metric");

    // Pipeline
    pub static ref GATE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("gate_duration_seconds", "Gate evaluation time in seconds")
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["gate", "outcome"]
    ).expect("Failed to create gate duration metric");
}

/// Initialize metrics registry - must be called once at startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(RATE_LIMIT_DECISIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RATE_LIMIT_STORE_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CREDIT_CHECKS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CREDIT_DEDUCTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CREDITS_DEDUCTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_PENDING.clone()))?;
    REGISTRY.register(Box::new(GATE_DURATION_SECONDS.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
