//! Core coordination logic.
//!
//! This module contains:
//! - Ledger: Idempotent execution with TTL-bounded suppression
//! - Lock: Lease-and-poll (or compare-and-swap) mutual exclusion
//! - Breaker: Per-service circuit breakers
//! - Safety: Outbound URL and payload policy
//! - Sweeper: Expired record collection
//! - Context: Shared store and settings wiring

pub mod breaker;
pub mod context;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod safety;
pub mod sweeper;

// Re-export commonly used types
pub use breaker::{BreakerSettings, CircuitBreakerRegistry, CircuitStatus};
pub use context::{GuardContext, GuardSettings};
pub use error::GuardError;
pub use ledger::{IdempotencyLedger, IdempotencyOptions, Idempotent, LedgerSettings, SkipReason};
pub use lock::{CasLock, LeaseLock, LockCoordinator, LockGuard, LockManager, LockSettings};
pub use safety::{SafetyViolation, UrlPolicy};
pub use sweeper::{SweepReport, Sweeper, SweeperSettings};
