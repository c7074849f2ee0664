//! Metergate Library
//!
//! Rate limiting and credit metering for AI-consuming requests in a
//! multi-tenant service: fixed-window admission over a pluggable counter
//! store, two-phase credit checks against a ledger, and an HTTP sidecar that
//! exposes both.

pub mod config;
pub mod credits;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod server;

pub use error::{GateError, UnauthorizedReason};
