//! Credit Ledger
//!
//! Balance and transaction persistence. Production deployments back this
//! with their billing database; [`InMemoryLedger`] is the reference
//! implementation used by the sidecar and in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::conversion::tokens_to_credits;

/// Post-flight deduction input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductionRequest {
    pub organization_id: String,
    pub user_id: String,
    pub tokens_used: u64,
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
    /// Idempotency key
    pub request_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl DeductionRequest {
    /// Credits charged for this request
    pub fn credits(&self) -> u64 {
        tokens_to_credits(self.tokens_used)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deduction,
    Grant,
}

/// A persisted balance change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditTransaction {
    pub id: Uuid,
    pub organization_id: String,
    pub user_id: Option<String>,
    pub kind: TransactionKind,
    /// Signed balance change (negative for deductions)
    pub credits: i64,
    pub tokens_used: Option<u64>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub model: Option<String>,
    pub request_id: Option<String>,
    pub description: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

/// Result of a deduction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductionReceipt {
    pub transaction_id: Uuid,
    pub request_id: String,
    pub credits_deducted: u64,
    pub new_balance: i64,
    /// The request id had already been settled; nothing was charged
    pub duplicate: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("unknown organization: {0}")]
    UnknownOrganization(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),
}

/// Balance store consumed by the credit gate
///
/// `deduct` must be atomic and idempotent on `request_id`: repeating a
/// settled request returns the original receipt with `duplicate = true`. A
/// failed deduction must not leave a transaction behind.
#[async_trait]
pub trait CreditLedger: Send + Sync + Debug {
    /// Current balance in credits (0 for organizations without a balance)
    async fn balance(&self, organization_id: &str) -> Result<i64, LedgerError>;

    async fn deduct(&self, request: &DeductionRequest) -> Result<DeductionReceipt, LedgerError>;

    /// Add credits to an organization, creating its balance if needed
    async fn grant(
        &self,
        organization_id: &str,
        credits: u64,
        description: Option<String>,
    ) -> Result<CreditTransaction, LedgerError>;

    /// Transactions for an organization, oldest first
    async fn transactions(&self, organization_id: &str)
        -> Result<Vec<CreditTransaction>, LedgerError>;

    async fn transaction_for_request(
        &self,
        request_id: &str,
    ) -> Result<Option<CreditTransaction>, LedgerError>;
}

fn signed(credits: u64) -> Result<i64, LedgerError> {
    i64::try_from(credits).map_err(|_| LedgerError::InvalidAmount(credits.to_string()))
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<String, i64>,
    transactions: Vec<CreditTransaction>,
    by_request: HashMap<String, usize>,
}

/// In-memory ledger; one lock covers balances, transactions and the request index
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger seeded with starting balances
    pub fn with_balances<I, S>(balances: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let state = LedgerState {
            balances: balances
                .into_iter()
                .map(|(org, balance)| (org.into(), balance))
                .collect(),
            ..LedgerState::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Number of recorded transactions across all organizations
    pub async fn transaction_count(&self) -> usize {
        self.state.read().await.transactions.len()
    }
}

#[async_trait]
impl CreditLedger for InMemoryLedger {
    async fn balance(&self, organization_id: &str) -> Result<i64, LedgerError> {
        let state = self.state.read().await;
        Ok(state.balances.get(organization_id).copied().unwrap_or(0))
    }

    async fn deduct(&self, request: &DeductionRequest) -> Result<DeductionReceipt, LedgerError> {
        let credits = request.credits();
        let amount = signed(credits)?;
        let mut state = self.state.write().await;

        if let Some(&index) = state.by_request.get(&request.request_id) {
            let existing = &state.transactions[index];
            debug!(request_id = %request.request_id, "Deduction already settled");
            return Ok(DeductionReceipt {
                transaction_id: existing.id,
                request_id: request.request_id.clone(),
                credits_deducted: existing.credits.unsigned_abs(),
                new_balance: existing.balance_after,
                duplicate: true,
            });
        }

        let balance = state
            .balances
            .get_mut(&request.organization_id)
            .ok_or_else(|| LedgerError::UnknownOrganization(request.organization_id.clone()))?;
        let balance_after = balance.checked_sub(amount).ok_or_else(|| {
            LedgerError::InvalidAmount(format!(
                "deducting {credits} credits would overflow the balance of {}",
                request.organization_id
            ))
        })?;
        *balance = balance_after;

        if balance_after < 0 {
            warn!(
                organization_id = %request.organization_id,
                request_id = %request.request_id,
                balance = balance_after,
                "Usage exceeded balance, organization is now negative"
            );
        }

        let transaction = CreditTransaction {
            id: Uuid::new_v4(),
            organization_id: request.organization_id.clone(),
            user_id: Some(request.user_id.clone()),
            kind: TransactionKind::Deduction,
            credits: -amount,
            tokens_used: Some(request.tokens_used),
            prompt_tokens: request.prompt_tokens,
            completion_tokens: request.completion_tokens,
            model: request.model.clone(),
            request_id: Some(request.request_id.clone()),
            description: request.description.clone(),
            ip_address: request.ip_address.clone(),
            user_agent: request.user_agent.clone(),
            balance_after,
            created_at: Utc::now(),
        };
        let transaction_id = transaction.id;

        let index = state.transactions.len();
        state.transactions.push(transaction);
        state.by_request.insert(request.request_id.clone(), index);

        Ok(DeductionReceipt {
            transaction_id,
            request_id: request.request_id.clone(),
            credits_deducted: credits,
            new_balance: balance_after,
            duplicate: false,
        })
    }

    async fn grant(
        &self,
        organization_id: &str,
        credits: u64,
        description: Option<String>,
    ) -> Result<CreditTransaction, LedgerError> {
        if credits == 0 {
            return Err(LedgerError::InvalidAmount("grant must be positive".to_string()));
        }
        let amount = signed(credits)?;
        let mut state = self.state.write().await;

        let balance = state
            .balances
            .entry(organization_id.to_string())
            .or_insert(0);
        *balance = balance.saturating_add(amount);

        let transaction = CreditTransaction {
            id: Uuid::new_v4(),
            organization_id: organization_id.to_string(),
            user_id: None,
            kind: TransactionKind::Grant,
            credits: amount,
            tokens_used: None,
            prompt_tokens: None,
            completion_tokens: None,
            model: None,
            request_id: None,
            description,
            ip_address: None,
            user_agent: None,
            balance_after: *balance,
            created_at: Utc::now(),
        };
        state.transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn transactions(
        &self,
        organization_id: &str,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.organization_id == organization_id)
            .cloned()
            .collect())
    }

    async fn transaction_for_request(
        &self,
        request_id: &str,
    ) -> Result<Option<CreditTransaction>, LedgerError> {
        let state = self.state.read().await;
        Ok(state
            .by_request
            .get(request_id)
            .map(|&index| state.transactions[index].clone()))
    }
}
