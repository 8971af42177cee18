//! Domain types for hookguard.
//!
//! This module contains the records kept in the shared store:
//! - OperationRecord: idempotency ledger entries
//! - LockLease: cooperative lock ownership
//! - CircuitRecord: per-dependency failure bookkeeping

pub mod keys;
pub mod records;

// Re-export commonly used types
pub use keys::{canonical_json, hash_input, sanitize_key, KeySpace};
pub use records::{
    after, new_token, CircuitRecord, CircuitState, LockLease, OperationRecord, OperationStatus,
};
