//! Error taxonomy for protected operations.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::store::StoreError;

use super::safety::SafetyViolation;

/// Errors surfaced by the ledger, locks, circuit breakers and the webhook
/// executor. Operations wrapped by these components return this type too,
/// so errors flow through every layer unchanged.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Lock not acquired before the deadline
    #[error("Lock '{key}' not acquired within {waited_ms}ms")]
    Concurrency { key: String, waited_ms: u64 },

    /// Dependency is known-bad; the operation was not invoked
    #[error("Circuit for '{service}' is open, next attempt allowed at {retry_at}")]
    CircuitOpen {
        service: String,
        retry_at: DateTime<Utc>,
    },

    /// Remote returned a status >= 400
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connection, TLS or protocol failure before a status was received
    #[error("Transport error: {0}")]
    Transport(String),

    /// Time limit exceeded; the outcome of the call is unknown
    #[error("Operation timed out after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout { elapsed_ms: u64, limit_ms: u64 },

    /// Request rejected before any network activity
    #[error("Security policy violation: {0}")]
    Security(#[from] SafetyViolation),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure raised by the wrapped operation itself
    #[error(transparent)]
    Operation(#[from] anyhow::Error),
}

impl GuardError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }

    /// HTTP status, when the remote answered with an error
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}
