//! Gate Error Types
//!
//! Errors returned by the admission phase of the gate. Every variant maps to a
//! stable error code and an HTTP status so the sidecar and library callers
//! render rejections identically.
//!
//! Post-flight accounting failures are deliberately absent here: they are
//! reported through [`crate::credits::DeductionOutcome`] and never fail a
//! request.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::json;

/// Why a request was rejected as unauthorized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnauthorizedReason {
    /// No active organization (tenant) on the request
    MissingOrganization,
    /// No authenticated user (actor) on the request
    MissingUser,
    /// The caller tried to settle usage for another organization
    OrganizationMismatch,
}

impl UnauthorizedReason {
    pub fn message(&self) -> &'static str {
        match self {
            UnauthorizedReason::MissingOrganization => "No active organization",
            UnauthorizedReason::MissingUser => "User not authenticated",
            UnauthorizedReason::OrganizationMismatch => {
                "Credit context belongs to a different organization"
            }
        }
    }
}

/// Error types for gate admission
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    /// Missing tenant or actor
    #[error("Unauthorized: {}", .0.message())]
    Unauthorized(UnauthorizedReason),

    /// Window budget exhausted
    #[error("Rate limit exceeded: {limit} requests per window, resets at {reset_at}")]
    RateLimited {
        limit: u32,
        reset_at: DateTime<Utc>,
        retry_after_secs: u64,
    },

    /// Balance below the estimated cost
    #[error("Insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: u64 },

    /// Backing store unreachable or timed out while failing closed
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Malformed caller input
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl GateError {
    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            GateError::Unauthorized(_) => "UNAUTHORIZED",
            GateError::RateLimited { .. } => "RATE_LIMITED",
            GateError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            GateError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            GateError::InvalidRequest(_) => "INVALID_REQUEST",
            GateError::Config(_) => "CONFIG_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GateError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GateError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GateError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            GateError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GateError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GateError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            GateError::Unauthorized(reason) => reason.message().to_string(),
            GateError::RateLimited { .. } => "Too many requests. Try again later.".to_string(),
            GateError::InsufficientCredits { balance, required } => format!(
                "Insufficient credits. You have {balance} credits but need {required}. \
                 Please purchase more credits to continue."
            ),
            other => other.to_string(),
        }
    }

    /// JSON body rendered for this error
    pub fn body(&self) -> serde_json::Value {
        let mut body = json!({
            "error": self.code(),
            "message": self.message(),
        });
        match self {
            GateError::InsufficientCredits { balance, required } => {
                body["balance"] = json!(balance);
                body["required"] = json!(required);
            }
            GateError::RateLimited {
                limit,
                reset_at,
                retry_after_secs,
            } => {
                body["limit"] = json!(limit);
                body["resetAt"] = json!(reset_at.to_rfc3339());
                body["retryAfter"] = json!(retry_after_secs);
            }
            _ => {}
        }
        body
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.body())).into_response();

        if let GateError::RateLimited {
            retry_after_secs, ..
        } = &self
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}
