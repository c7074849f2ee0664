// Reconciliation of failed post-flight deductions
//
// A deduction that fails after the protected work already ran is kept here
// and retried with exponential backoff:
// - Backoff 1s, 2s, 4s, 8s, 16s (capped at max_delay_ms)
// - Optional ±20% jitter
// - Dead-lettered after max_retries for manual review
//
// Retrying is safe because ledger deductions are idempotent on request id.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::gate::DEFAULT_LEDGER_TIMEOUT_MS;
use super::ledger::{CreditLedger, DeductionRequest, LedgerError};
use crate::metrics::RECONCILIATION_PENDING;
use crate::rate_limit::store::expiry_after;

/// Retry strategy configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Base delay in milliseconds (default 1000ms)
    pub base_delay_ms: u64,
    /// Attempts after the original failure before dead-lettering (default 5)
    pub max_retries: u32,
    /// Cap on a single delay in milliseconds (default 60000ms)
    pub max_delay_ms: u64,
    /// Add jitter to delay (default true)
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_retries: 5,
            max_delay_ms: 60_000,
            use_jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry after this many milliseconds
    Retry(u64),
    /// Give up and dead-letter
    GiveUp,
}

/// Delay before retry number `attempt` (zero-indexed)
///
/// delay = min(base * 2^attempt, max_delay) ± jitter
pub fn calculate_retry_delay(attempt: u32, config: &RetryConfig) -> RetryDecision {
    if attempt >= config.max_retries {
        debug!(max_retries = config.max_retries, "Max retries exceeded, giving up");
        return RetryDecision::GiveUp;
    }

    let delay_ms = 2_u64
        .checked_pow(attempt)
        .map_or(u64::MAX, |factor| config.base_delay_ms.saturating_mul(factor))
        .min(config.max_delay_ms);

    let delay_ms = if config.use_jitter && delay_ms > 0 {
        let jitter = delay_ms / 5;
        let mut rng = rand::rng();
        let random_jitter = rng.random_range(0..=jitter);

        if rng.random_bool(0.5) {
            delay_ms.saturating_add(random_jitter)
        } else {
            delay_ms.saturating_sub(random_jitter)
        }
    } else {
        delay_ms
    };

    RetryDecision::Retry(delay_ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    DeadLettered,
}

/// A deduction awaiting reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDeduction {
    pub id: String,
    pub request: DeductionRequest,
    /// Failed attempts so far, including the original one
    pub attempt_count: u32,
    pub last_error: String,
    pub first_failed_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub status: PendingStatus,
}

impl PendingDeduction {
    fn new(request: DeductionRequest, error: String, config: &RetryConfig) -> Self {
        let now = Utc::now();
        let mut entry = Self {
            id: format!("recon-{}", Uuid::new_v4()),
            request,
            attempt_count: 1,
            last_error: error,
            first_failed_at: now,
            next_attempt_at: now,
            status: PendingStatus::Pending,
        };
        entry.schedule(now, config);
        entry
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == PendingStatus::Pending && self.next_attempt_at <= now
    }

    fn schedule(&mut self, now: DateTime<Utc>, config: &RetryConfig) {
        match calculate_retry_delay(self.attempt_count - 1, config) {
            RetryDecision::Retry(ms) => {
                self.next_attempt_at = expiry_after(now, Duration::from_millis(ms));
            }
            RetryDecision::GiveUp => {
                self.status = PendingStatus::DeadLettered;
                error!(
                    id = %self.id,
                    request_id = %self.request.request_id,
                    organization_id = %self.request.organization_id,
                    attempts = self.attempt_count,
                    last_error = %self.last_error,
                    "Deduction dead-lettered, manual reconciliation required"
                );
            }
        }
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub settled: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl ReconciliationReport {
    pub fn attempted(&self) -> usize {
        self.settled + self.failed + self.dead_lettered
    }
}

/// Shared queue of failed deductions
#[derive(Debug, Clone)]
pub struct ReconciliationQueue {
    entries: Arc<Mutex<Vec<PendingDeduction>>>,
    config: RetryConfig,
    ledger_timeout: Duration,
}

impl ReconciliationQueue {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            config,
            ledger_timeout: Duration::from_millis(DEFAULT_LEDGER_TIMEOUT_MS),
        }
    }

    /// Bound on each retried ledger call
    pub fn with_ledger_timeout(mut self, timeout: Duration) -> Self {
        self.ledger_timeout = timeout;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Record a failed deduction, returning the entry id
    ///
    /// A request id already in the queue is not added twice.
    pub async fn enqueue(&self, request: DeductionRequest, error: impl Into<String>) -> String {
        let error = error.into();
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.request.request_id == request.request_id)
        {
            existing.last_error = error;
            return existing.id.clone();
        }

        let entry = PendingDeduction::new(request, error, &self.config);
        let id = entry.id.clone();
        warn!(
            id = %id,
            request_id = %entry.request.request_id,
            organization_id = %entry.request.organization_id,
            credits = entry.request.credits(),
            "Deduction queued for reconciliation"
        );
        entries.push(entry);
        update_gauge(&entries);
        id
    }

    /// Entries still being retried
    pub async fn pending(&self) -> Vec<PendingDeduction> {
        self.with_status(PendingStatus::Pending).await
    }

    /// Entries that exhausted their retries
    pub async fn dead_letters(&self) -> Vec<PendingDeduction> {
        self.with_status(PendingStatus::DeadLettered).await
    }

    async fn with_status(&self, status: PendingStatus) -> Vec<PendingDeduction> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.status == status)
            .cloned()
            .collect()
    }

    /// Number of pending entries
    pub async fn len(&self) -> usize {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.status == PendingStatus::Pending)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop an entry after manual resolution
    pub async fn discard(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        update_gauge(&entries);
        entries.len() != before
    }

    /// Retry every pending entry now, ignoring its schedule
    pub async fn retry_pending(
        &self,
        ledger: &dyn CreditLedger,
        config: &RetryConfig,
    ) -> ReconciliationReport {
        self.retry_where(ledger, config, |e| e.status == PendingStatus::Pending)
            .await
    }

    /// Retry pending entries whose backoff has elapsed
    pub async fn retry_due(
        &self,
        ledger: &dyn CreditLedger,
        config: &RetryConfig,
    ) -> ReconciliationReport {
        let now = Utc::now();
        self.retry_where(ledger, config, |e| e.is_due(now)).await
    }

    async fn retry_where<F>(
        &self,
        ledger: &dyn CreditLedger,
        config: &RetryConfig,
        select: F,
    ) -> ReconciliationReport
    where
        F: Fn(&PendingDeduction) -> bool,
    {
        // Ledger calls happen without holding the queue lock
        let batch: Vec<PendingDeduction> = {
            let entries = self.entries.lock().await;
            entries.iter().filter(|e| select(e)).cloned().collect()
        };

        let mut results = Vec::with_capacity(batch.len());
        for entry in batch {
            let deduction = tokio::time::timeout(self.ledger_timeout, ledger.deduct(&entry.request));
            let result = deduction.await.unwrap_or_else(|_| {
                Err(LedgerError::Unavailable(format!(
                    "ledger timed out after {:?}",
                    self.ledger_timeout
                )))
            });
            results.push((entry.id, result));
        }

        let mut report = ReconciliationReport::default();
        let now = Utc::now();
        let mut entries = self.entries.lock().await;

        for (id, result) in results {
            match result {
                Ok(receipt) => {
                    info!(
                        id = %id,
                        request_id = %receipt.request_id,
                        credits = receipt.credits_deducted,
                        duplicate = receipt.duplicate,
                        "Reconciled deduction"
                    );
                    entries.retain(|e| e.id != id);
                    report.settled += 1;
                }
                Err(err) => {
                    let Some(entry) = entries.iter_mut().find(|e| e.id == id) else {
                        continue;
                    };
                    entry.attempt_count += 1;
                    entry.last_error = err.to_string();
                    entry.schedule(now, config);
                    if entry.status == PendingStatus::DeadLettered {
                        report.dead_lettered += 1;
                    } else {
                        debug!(
                            id = %id,
                            attempts = entry.attempt_count,
                            error = %err,
                            "Reconciliation attempt failed"
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        update_gauge(&entries);
        report
    }
}

impl Default for ReconciliationQueue {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

fn update_gauge(entries: &[PendingDeduction]) {
    let pending = entries
        .iter()
        .filter(|e| e.status == PendingStatus::Pending)
        .count();
    RECONCILIATION_PENDING.set(pending as i64);
}

/// Background task retrying due deductions every `interval`
pub async fn run_reconciliation_loop(
    queue: ReconciliationQueue,
    ledger: Arc<dyn CreditLedger>,
    config: RetryConfig,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs(), "Reconciliation loop started");

    loop {
        ticker.tick().await;
        if queue.is_empty().await {
            continue;
        }

        let report = queue.retry_due(ledger.as_ref(), &config).await;
        if report.attempted() > 0 {
            info!(
                settled = report.settled,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                "Reconciliation pass complete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::ledger::{InMemoryLedger, LedgerError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn request(request_id: &str) -> DeductionRequest {
        DeductionRequest {
            organization_id: "org-1".to_string(),
            user_id: "user-1".to_string(),
            tokens_used: 2000,
            prompt_tokens: None,
            completion_tokens: None,
            model: None,
            request_id: request_id.to_string(),
            description: None,
            ip_address: None,
            user_agent: None,
        }
    }

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            use_jitter: false,
            ..RetryConfig::default()
        }
    }

    /// Ledger that fails until switched on
    #[derive(Debug)]
    struct SwitchableLedger {
        inner: InMemoryLedger,
        online: AtomicBool,
        stalled: AtomicBool,
    }

    impl SwitchableLedger {
        fn offline(inner: InMemoryLedger) -> Self {
            Self {
                inner,
                online: AtomicBool::new(false),
                stalled: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl CreditLedger for SwitchableLedger {
        async fn balance(&self, org: &str) -> Result<i64, LedgerError> {
            self.inner.balance(org).await
        }

        async fn deduct(
            &self,
            request: &DeductionRequest,
        ) -> Result<crate::credits::ledger::DeductionReceipt, LedgerError> {
            if self.stalled.load(Ordering::SeqCst) {
                return std::future::pending().await;
            }
            if !self.online.load(Ordering::SeqCst) {
                return Err(LedgerError::Unavailable("connection refused".to_string()));
            }
            self.inner.deduct(request).await
        }

        async fn grant(
            &self,
            org: &str,
            credits: u64,
            description: Option<String>,
        ) -> Result<crate::credits::ledger::CreditTransaction, LedgerError> {
            self.inner.grant(org, credits, description).await
        }

        async fn transactions(
            &self,
            org: &str,
        ) -> Result<Vec<crate::credits::ledger::CreditTransaction>, LedgerError> {
            self.inner.transactions(org).await
        }

        async fn transaction_for_request(
            &self,
            request_id: &str,
        ) -> Result<Option<crate::credits::ledger::CreditTransaction>, LedgerError> {
            self.inner.transaction_for_request(request_id).await
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let config = RetryConfig::default();

        let delay0 = calculate_retry_delay(0, &config);
        assert!(matches!(delay0, RetryDecision::Retry(d) if (800..=1200).contains(&d)));

        let delay1 = calculate_retry_delay(1, &config);
        assert!(matches!(delay1, RetryDecision::Retry(d) if (1600..=2400).contains(&d)));

        let delay2 = calculate_retry_delay(2, &config);
        assert!(matches!(delay2, RetryDecision::Retry(d) if (3200..=4800).contains(&d)));
    }

    #[test]
    fn test_max_retries_exceeded() {
        let config = RetryConfig::default();
        assert_eq!(
            calculate_retry_delay(config.max_retries, &config),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_max_delay_capped() {
        let config = RetryConfig {
            max_delay_ms: 5000,
            max_retries: 100,
            use_jitter: false,
            ..RetryConfig::default()
        };

        assert_eq!(calculate_retry_delay(10, &config), RetryDecision::Retry(5000));
        assert_eq!(calculate_retry_delay(80, &config), RetryDecision::Retry(5000));
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates_request_id() {
        let queue = ReconciliationQueue::new(no_jitter());

        let first = queue.enqueue(request("req-1"), "timeout").await;
        let second = queue.enqueue(request("req-1"), "timeout again").await;

        assert_eq!(first, second);
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.pending().await[0].last_error, "timeout again");
    }

    #[tokio::test]
    async fn test_retry_settles_once_ledger_recovers() {
        let ledger = SwitchableLedger::offline(InMemoryLedger::with_balances([("org-1", 10)]));
        let config = no_jitter();
        let queue = ReconciliationQueue::new(config.clone());
        queue.enqueue(request("req-1"), "connection refused").await;

        let report = queue.retry_pending(&ledger, &config).await;
        assert_eq!(report.failed, 1);
        assert_eq!(queue.pending().await[0].attempt_count, 2);

        ledger.online.store(true, Ordering::SeqCst);
        let report = queue.retry_pending(&ledger, &config).await;

        assert_eq!(report.settled, 1);
        assert!(queue.is_empty().await);
        assert_eq!(ledger.balance("org-1").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_retry_due_respects_backoff() {
        let ledger = InMemoryLedger::with_balances([("org-1", 10)]);
        let config = no_jitter();
        let queue = ReconciliationQueue::new(config.clone());
        queue.enqueue(request("req-1"), "timeout").await;

        // First retry is scheduled one base delay out
        let report = queue.retry_due(&ledger, &config).await;
        assert_eq!(report.attempted(), 0);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_retries() {
        let ledger = SwitchableLedger::offline(InMemoryLedger::with_balances([("org-1", 10)]));
        let config = RetryConfig {
            max_retries: 2,
            use_jitter: false,
            ..RetryConfig::default()
        };
        let queue = ReconciliationQueue::new(config.clone());
        queue.enqueue(request("req-1"), "down").await;

        let report = queue.retry_pending(&ledger, &config).await;
        assert_eq!(report.failed, 1);

        let report = queue.retry_pending(&ledger, &config).await;
        assert_eq!(report.dead_lettered, 1);

        assert!(queue.is_empty().await);
        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt_count, 3);
        assert_eq!(dead[0].status, PendingStatus::DeadLettered);

        // Dead letters are not retried
        let report = queue.retry_pending(&ledger, &config).await;
        assert_eq!(report.attempted(), 0);
    }

    #[tokio::test]
    async fn test_retry_of_already_settled_request_is_duplicate() {
        let ledger = InMemoryLedger::with_balances([("org-1", 10)]);
        ledger.deduct(&request("req-1")).await.unwrap();

        let config = no_jitter();
        let queue = ReconciliationQueue::new(config.clone());
        queue.enqueue(request("req-1"), "response lost").await;

        let report = queue.retry_pending(&ledger, &config).await;

        assert_eq!(report.settled, 1);
        assert_eq!(ledger.balance("org-1").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_stalled_ledger_counts_as_failed_attempt() {
        let ledger = SwitchableLedger::offline(InMemoryLedger::with_balances([("org-1", 10)]));
        ledger.stalled.store(true, Ordering::SeqCst);
        let config = no_jitter();
        let queue =
            ReconciliationQueue::new(config.clone()).with_ledger_timeout(Duration::from_millis(20));
        queue.enqueue(request("req-1"), "connection refused").await;

        let report = queue.retry_pending(&ledger, &config).await;

        assert_eq!(report.failed, 1);
        let pending = queue.pending().await;
        assert_eq!(pending[0].attempt_count, 2);
        assert!(pending[0].last_error.contains("timed out"));
        assert_eq!(ledger.balance("org-1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_discard() {
        let queue = ReconciliationQueue::default();
        let id = queue.enqueue(request("req-1"), "down").await;

        assert!(queue.discard(&id).await);
        assert!(!queue.discard(&id).await);
        assert!(queue.is_empty().await);
    }
}
