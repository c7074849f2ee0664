//! Credit Gate
//!
//! Two-phase metering around a billable operation:
//!
//! 1. [`CreditGate::admit`] runs before the work. It rejects callers without
//!    an organization or user, compares the balance against the estimated
//!    cost and mints a request id for the accounting phase.
//! 2. [`CreditGate::process_deduction`] runs after the work with the actual
//!    usage. It never fails the request: errors are logged, counted and handed
//!    to the reconciliation queue.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::conversion::{tokens_to_credits, DEFAULT_ESTIMATED_TOKENS};
use super::ledger::{CreditLedger, DeductionReceipt, DeductionRequest, LedgerError};
use super::metadata::RequestMetadata;
use super::reconcile::ReconciliationQueue;
use crate::error::{GateError, UnauthorizedReason};
use crate::metrics::{CREDITS_DEDUCTED_TOTAL, CREDIT_CHECKS_TOTAL, CREDIT_DEDUCTIONS_TOTAL};

pub const DEFAULT_LEDGER_TIMEOUT_MS: u64 = 2000;

/// Pre-flight input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditCheckParams {
    pub organization_id: Option<String>,
    pub user_id: Option<String>,
    pub estimated_tokens: u64,
}

impl CreditCheckParams {
    pub fn new(organization_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            organization_id: Some(organization_id.into()),
            user_id: Some(user_id.into()),
            estimated_tokens: DEFAULT_ESTIMATED_TOKENS,
        }
    }

    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }
}

impl Default for CreditCheckParams {
    fn default() -> Self {
        Self {
            organization_id: None,
            user_id: None,
            estimated_tokens: DEFAULT_ESTIMATED_TOKENS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditCheck {
    pub has_credits: bool,
    pub balance: i64,
    pub required: u64,
}

/// Issued by a successful pre-flight check, consumed by the deduction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditCheckContext {
    pub organization_id: String,
    pub user_id: String,
    pub request_id: String,
    pub estimated_credits: u64,
}

/// Actual consumption reported after the work ran
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub tokens_used: u64,
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

/// Result of the accounting phase
///
/// Serializes as `{"success": true, ...receipt}` or
/// `{"success": false, "error": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeductionOutcome {
    pub success: bool,
    #[serde(flatten)]
    pub receipt: Option<DeductionReceipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeductionOutcome {
    pub fn settled(receipt: DeductionReceipt) -> Self {
        Self {
            success: true,
            receipt: Some(receipt),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            receipt: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

fn build_deduction(ctx: &CreditCheckContext, usage: UsageReport) -> DeductionRequest {
    DeductionRequest {
        organization_id: ctx.organization_id.clone(),
        user_id: ctx.user_id.clone(),
        tokens_used: usage.tokens_used,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        model: usage.model,
        request_id: ctx.request_id.clone(),
        description: usage.description,
        ip_address: Some(usage.metadata.ip_address),
        user_agent: Some(usage.metadata.user_agent),
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Pre-flight check and post-flight deduction against a [`CreditLedger`]
#[derive(Debug, Clone)]
pub struct CreditGate {
    ledger: Arc<dyn CreditLedger>,
    reconciliation: Option<ReconciliationQueue>,
    ledger_timeout: Duration,
}

impl CreditGate {
    pub fn new(ledger: Arc<dyn CreditLedger>) -> Self {
        Self {
            ledger,
            reconciliation: None,
            ledger_timeout: Duration::from_millis(DEFAULT_LEDGER_TIMEOUT_MS),
        }
    }

    /// Queue failed deductions for later retry
    pub fn with_reconciliation(mut self, queue: ReconciliationQueue) -> Self {
        self.reconciliation = Some(queue);
        self
    }

    pub fn with_ledger_timeout(mut self, timeout: Duration) -> Self {
        self.ledger_timeout = timeout;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn CreditLedger> {
        &self.ledger
    }

    pub fn reconciliation(&self) -> Option<&ReconciliationQueue> {
        self.reconciliation.as_ref()
    }

    /// Compare the balance of `organization_id` against an estimated token count
    pub async fn check_balance(
        &self,
        organization_id: &str,
        estimated_tokens: u64,
    ) -> Result<CreditCheck, GateError> {
        let required = tokens_to_credits(estimated_tokens);

        let balance = match tokio::time::timeout(
            self.ledger_timeout,
            self.ledger.balance(organization_id),
        )
        .await
        {
            Ok(Ok(balance)) => balance,
            Ok(Err(err)) => {
                error!(organization_id, error = %err, "Balance lookup failed");
                CREDIT_CHECKS_TOTAL.with_label_values(&["error"]).inc();
                return Err(GateError::StoreUnavailable(err.to_string()));
            }
            Err(_) => {
                error!(
                    organization_id,
                    timeout_ms = self.ledger_timeout.as_millis() as u64,
                    "Balance lookup timed out"
                );
                CREDIT_CHECKS_TOTAL.with_label_values(&["error"]).inc();
                return Err(GateError::StoreUnavailable(format!(
                    "ledger timed out after {:?}",
                    self.ledger_timeout
                )));
            }
        };

        let has_credits = i64::try_from(required).is_ok_and(|required| balance >= required);
        Ok(CreditCheck {
            has_credits,
            balance,
            required,
        })
    }

    /// Pre-flight admission
    pub async fn admit(&self, params: CreditCheckParams) -> Result<CreditCheckContext, GateError> {
        let organization_id = present(params.organization_id).ok_or_else(|| {
            CREDIT_CHECKS_TOTAL.with_label_values(&["unauthorized"]).inc();
            GateError::Unauthorized(UnauthorizedReason::MissingOrganization)
        })?;
        let user_id = present(params.user_id).ok_or_else(|| {
            CREDIT_CHECKS_TOTAL.with_label_values(&["unauthorized"]).inc();
            GateError::Unauthorized(UnauthorizedReason::MissingUser)
        })?;

        let check = self
            .check_balance(&organization_id, params.estimated_tokens)
            .await?;

        if !check.has_credits {
            info!(
                organization_id = %organization_id,
                user_id = %user_id,
                balance = check.balance,
                required = check.required,
                "Insufficient credits"
            );
            CREDIT_CHECKS_TOTAL.with_label_values(&["insufficient"]).inc();
            return Err(GateError::InsufficientCredits {
                balance: check.balance,
                required: check.required,
            });
        }

        CREDIT_CHECKS_TOTAL.with_label_values(&["admitted"]).inc();
        let request_id = Uuid::new_v4().to_string();
        debug!(
            organization_id = %organization_id,
            request_id = %request_id,
            estimated_credits = check.required,
            "Credit check passed"
        );

        Ok(CreditCheckContext {
            organization_id,
            user_id,
            request_id,
            estimated_credits: check.required,
        })
    }

    /// Post-flight accounting; never fails the request
    pub async fn process_deduction(
        &self,
        ctx: &CreditCheckContext,
        usage: UsageReport,
    ) -> DeductionOutcome {
        let request = build_deduction(ctx, usage);

        let result = match tokio::time::timeout(self.ledger_timeout, self.ledger.deduct(&request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Unavailable(format!(
                "ledger timed out after {:?}",
                self.ledger_timeout
            ))),
        };

        match result {
            Ok(receipt) => {
                if receipt.duplicate {
                    info!(
                        request_id = %receipt.request_id,
                        "Deduction already settled, not charging again"
                    );
                    CREDIT_DEDUCTIONS_TOTAL.with_label_values(&["duplicate"]).inc();
                } else {
                    debug!(
                        organization_id = %request.organization_id,
                        request_id = %receipt.request_id,
                        credits = receipt.credits_deducted,
                        balance = receipt.new_balance,
                        "Credits deducted"
                    );
                    CREDIT_DEDUCTIONS_TOTAL.with_label_values(&["settled"]).inc();
                    CREDITS_DEDUCTED_TOTAL.inc_by(receipt.credits_deducted);
                }
                DeductionOutcome::settled(receipt)
            }
            Err(err) => {
                error!(
                    organization_id = %request.organization_id,
                    user_id = %request.user_id,
                    request_id = %request.request_id,
                    tokens_used = request.tokens_used,
                    error = %err,
                    "Credit deduction failed"
                );
                CREDIT_DEDUCTIONS_TOTAL.with_label_values(&["failed"]).inc();
                let message = err.to_string();
                if let Some(queue) = &self.reconciliation {
                    queue.enqueue(request, message.clone()).await;
                }
                DeductionOutcome::failed(message)
            }
        }
    }
}
