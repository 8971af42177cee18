//! Records persisted in the shared state store.
//!
//! Every record is stored as a single UTF-8 JSON value under a prefixed key
//! (see [`super::keys::KeySpace`]). There are no relationships between
//! records; each category is isolated purely by key prefix.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Add a std duration to a timestamp, saturating far in the future.
pub fn after(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(3650));
    at.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Status of an idempotent operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Start marker written, operation running
    InProgress,

    /// Operation succeeded; suppresses re-execution until expiry
    Completed,

    /// Operation failed; kept for diagnostics, never suppresses retries
    Failed,
}

/// Ledger entry for one idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Sanitized operation key
    pub key: String,

    /// Current status
    pub status: OperationStatus,

    /// When the attempt started
    pub started_at: DateTime<Utc>,

    /// When the attempt completed (completed records only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// When the attempt failed (failed records only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    /// Serialized result of a completed operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_snapshot: Option<serde_json::Value>,

    /// Error message of a failed operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Wall time spent inside the operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,

    /// When this record stops being meaningful
    pub expires_at: DateTime<Utc>,
}

impl OperationRecord {
    /// Create an in-progress start marker
    pub fn started(key: String, started_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            key,
            status: OperationStatus::InProgress,
            started_at,
            completed_at: None,
            failed_at: None,
            result_snapshot: None,
            error: None,
            execution_time_ms: None,
            expires_at,
        }
    }

    /// Settle this attempt as completed
    pub fn complete(
        mut self,
        snapshot: serde_json::Value,
        execution_time_ms: u64,
        completed_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        self.status = OperationStatus::Completed;
        self.completed_at = Some(completed_at);
        self.result_snapshot = Some(snapshot);
        self.execution_time_ms = Some(execution_time_ms);
        self.expires_at = expires_at;
        self
    }

    /// Settle this attempt as failed
    pub fn fail(
        mut self,
        error: String,
        execution_time_ms: u64,
        failed_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        self.status = OperationStatus::Failed;
        self.failed_at = Some(failed_at);
        self.error = Some(error);
        self.execution_time_ms = Some(execution_time_ms);
        self.expires_at = expires_at;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether this record blocks another execution of the same key
    pub fn suppresses(&self, now: DateTime<Utc>) -> bool {
        self.status == OperationStatus::Completed && !self.is_expired(now)
    }

    /// The moment the record settled, falling back to its start
    pub fn settled_at(&self) -> DateTime<Utc> {
        self.completed_at
            .or(self.failed_at)
            .unwrap_or(self.started_at)
    }
}

/// Time-bounded ownership of a named lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    /// Sanitized lock name
    pub key: String,

    /// Random token identifying the holder
    pub holder_token: String,

    pub acquired_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,
}

impl LockLease {
    pub fn new(key: String, holder_token: String, acquired_at: DateTime<Utc>, lease: Duration) -> Self {
        Self {
            key,
            holder_token,
            acquired_at,
            expires_at: after(acquired_at, lease),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_held_by(&self, token: &str) -> bool {
        self.holder_token == token
    }
}

/// Circuit breaker state.
///
/// Only `Closed` and `Open` are ever persisted; `HalfOpen` is derived from an
/// open record whose `reset_at` has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        };
        f.write_str(name)
    }
}

/// Per-dependency failure bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitRecord {
    /// Sanitized service key
    pub service_key: String,

    /// Persisted state (`Closed` or `Open`)
    pub state: CircuitState,

    /// Consecutive failures since the last success
    pub failure_count: u32,

    #[serde(default)]
    pub last_failure: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,

    /// When an open circuit admits a probe
    #[serde(default)]
    pub reset_at: Option<DateTime<Utc>>,

    /// Token of the caller holding the half-open probe slot
    #[serde(default)]
    pub probe_token: Option<String>,

    #[serde(default)]
    pub probe_claimed_at: Option<DateTime<Utc>>,
}

impl CircuitRecord {
    /// A fresh closed circuit
    pub fn new(service_key: String) -> Self {
        Self {
            service_key,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            last_success: None,
            reset_at: None,
            probe_token: None,
            probe_claimed_at: None,
        }
    }

    /// State as seen at `now`, deriving half-open from `reset_at`
    pub fn effective_state(&self, now: DateTime<Utc>) -> CircuitState {
        match (self.state, self.reset_at) {
            (CircuitState::Open, Some(reset_at)) if now >= reset_at => CircuitState::HalfOpen,
            (CircuitState::Open, None) => CircuitState::HalfOpen,
            (state, _) => state,
        }
    }

    /// Whether a live probe claim exists at `now`
    pub fn probe_in_flight(&self, now: DateTime<Utc>, probe_timeout: Duration) -> bool {
        match self.probe_claimed_at {
            Some(claimed_at) => now < after(claimed_at, probe_timeout),
            None => false,
        }
    }

    /// Record a success: back to closed with a clean slate
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_success = Some(now);
        self.reset_at = None;
        self.clear_probe();
    }

    /// Record a failure. Returns `true` when this failure opened the circuit.
    pub fn record_failure(
        &mut self,
        now: DateTime<Utc>,
        was_probe: bool,
        threshold: u32,
        reset_timeout: Duration,
    ) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);

        let trips = was_probe
            || (self.state == CircuitState::Closed && self.failure_count >= threshold);

        if trips {
            self.state = CircuitState::Open;
            self.reset_at = Some(after(now, reset_timeout));
            self.clear_probe();
        }

        trips
    }

    /// Mark the probe slot as claimed by `token`
    pub fn claim_probe(&mut self, token: String, now: DateTime<Utc>) {
        self.probe_token = Some(token);
        self.probe_claimed_at = Some(now);
    }

    fn clear_probe(&mut self) {
        self.probe_token = None;
        self.probe_claimed_at = None;
    }
}

/// Fresh random holder token
pub fn new_token() -> String {
    Uuid::new_v4().to_string()
}
