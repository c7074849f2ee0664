//! Credit Metering Module
//!
//! Pre-flight balance checks and post-flight usage deductions for billable
//! operations, with a reconciliation queue for deductions that could not be
//! recorded.

pub mod conversion;
pub mod gate;
pub mod ledger;
pub mod metadata;
pub mod reconcile;

pub use conversion::{tokens_to_credits, DEFAULT_ESTIMATED_TOKENS, TOKENS_PER_CREDIT};
pub use gate::{
    CreditCheck, CreditCheckContext, CreditCheckParams, CreditGate, DeductionOutcome, UsageReport,
};
pub use ledger::{
    CreditLedger, CreditTransaction, DeductionReceipt, DeductionRequest, InMemoryLedger,
    LedgerError, TransactionKind,
};
pub use metadata::{extract_request_metadata, RequestMetadata};
pub use reconcile::{
    calculate_retry_delay, run_reconciliation_loop, PendingDeduction, PendingStatus,
    ReconciliationQueue, ReconciliationReport, RetryConfig, RetryDecision,
};
