//! hookguard - Reliable outbound webhooks over a shared key-value store
//!
//! Protects outbound integration calls with three composed patterns, all
//! built on a single durable key-value store:
//! - An idempotency ledger that suppresses duplicate execution
//! - Cooperative lease locks with jittered polling
//! - Per-service circuit breakers with a single claimed half-open probe
//!
//! # Architecture
//!
//! ```text
//! caller → ledger (already completed?) → lock (optional) → breaker → HTTP
//!                ↑                                            │
//!                └──────────── outcome recorded ──────────────┘
//! ```
//!
//! The store is only assumed to offer get/set/delete with last-write-wins
//! visibility. Backends with compare-and-swap (SQLite, memory) let locks
//! and probe claims use it instead of write-then-reread.
//!
//! # Modules
//!
//! - `adapters`: Secure webhook executor and HTTP transport
//! - `core`: Ledger, locks, circuit breakers, URL policy, sweeper
//! - `domain`: Persisted records and key layout
//! - `store`: Shared store trait and backends (memory, file, sqlite)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Send a webhook (a repeat within the TTL is deduplicated)
//! hookguard send https://hooks.example.com/catch --data '{"id": 1}'
//!
//! # Inspect a circuit
//! hookguard circuit status webhook:hooks.example.com
//!
//! # Sweep expired records every 30 minutes
//! hookguard sweep --every 1800
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod store;

// Re-export main types at crate root for convenience
pub use adapters::{WebhookExecutor, WebhookOptions, WebhookResponse};
pub use self::core::{
    CircuitBreakerRegistry, GuardContext, GuardError, GuardSettings, IdempotencyLedger,
    IdempotencyOptions, Idempotent, LockManager, SweepReport, Sweeper,
};
pub use domain::{CircuitState, OperationRecord, OperationStatus};
pub use store::{FileStore, MemoryStore, SqliteStore, StateStore};
