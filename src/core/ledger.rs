//! Idempotency ledger.
//!
//! Suppresses duplicate execution of logically identical operations by
//! recording their outcome under a sanitized key:
//! - a start marker (`op-start:`) while the operation runs
//! - a settled record (`op:`) once it completes or fails
//!
//! Only a non-expired `completed` record suppresses execution. Failed
//! records are kept for diagnostics and never block a retry.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::domain::{after, sanitize_key, KeySpace, OperationRecord};
use crate::store::{encode_json, load_json, StateStore};

use super::error::GuardError;

/// Ledger retention settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    /// How long a completed record suppresses re-execution (default: 1 hour)
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// How long failed records and stale start markers are kept (default: 24 hours)
    #[serde(default = "default_failed_retention_ms")]
    pub failed_retention_ms: u64,
}

fn default_ttl_ms() -> u64 {
    60 * 60 * 1000
}
fn default_failed_retention_ms() -> u64 {
    24 * 60 * 60 * 1000
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            failed_retention_ms: default_failed_retention_ms(),
        }
    }
}

impl LedgerSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn failed_retention(&self) -> Duration {
        Duration::from_millis(self.failed_retention_ms)
    }
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct IdempotencyOptions {
    /// Override the completed-record TTL
    pub ttl: Option<Duration>,

    /// Execute even if a completed record exists
    pub force_retry: bool,

    /// Cancel the operation if it runs longer than this
    pub timeout: Option<Duration>,
}

impl IdempotencyOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn force_retry(mut self) -> Self {
        self.force_retry = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Why an execution was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyCompleted,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyCompleted => "already_completed",
        }
    }
}

/// Outcome of an idempotent run
#[derive(Debug, Clone, PartialEq)]
pub enum Idempotent<T> {
    /// The operation ran in this call
    Executed(T),

    /// A prior completed result was returned without running the operation
    Skipped {
        value: T,
        reason: SkipReason,
        completed_at: DateTime<Utc>,
    },
}

impl<T> Idempotent<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    pub fn value(&self) -> &T {
        match self {
            Self::Executed(value) | Self::Skipped { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Self::Executed(value) | Self::Skipped { value, .. } => value,
        }
    }
}

/// Idempotency ledger over the shared store
#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn StateStore>,
    settings: LedgerSettings,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn StateStore>, settings: LedgerSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    /// Run `operation` at most once per key within the TTL window.
    ///
    /// On success the result is stored and returned as `Executed`. If a
    /// non-expired completed record exists (and `force_retry` is off), the
    /// stored result is returned as `Skipped` and `operation` is never
    /// called. Failures are recorded and propagated unchanged.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn run<T, F, Fut>(
        &self,
        key: &str,
        options: IdempotencyOptions,
        operation: F,
    ) -> Result<Idempotent<T>, GuardError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, GuardError>> + Send,
    {
        let id = sanitize_key(key);
        let record_key = KeySpace::Operation.key(&id);
        let marker_key = KeySpace::StartMarker.key(&id);
        let now = Utc::now();

        if !options.force_retry {
            if let Some(skipped) = self.completed_result(&record_key, now).await? {
                return Ok(skipped);
            }
        }

        if let Some(marker) = load_json::<OperationRecord>(self.store.as_ref(), &marker_key).await? {
            if !marker.value.is_expired(now) {
                warn!(
                    started_at = %marker.value.started_at,
                    "Operation already in progress elsewhere, executing anyway"
                );
            }
        }

        let marker = OperationRecord::started(
            id.clone(),
            now,
            after(now, self.settings.failed_retention()),
        );
        self.store.set(&marker_key, &encode_json(&marker)?).await?;
        debug!("Start marker written");

        let started = Instant::now();
        let outcome = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => Err(GuardError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    limit_ms: limit.as_millis() as u64,
                }),
            },
            None => operation().await,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                let settled = Utc::now();
                let ttl = options.ttl.unwrap_or_else(|| self.settings.ttl());
                let record = marker.complete(
                    serde_json::to_value(&value)?,
                    elapsed_ms,
                    settled,
                    after(settled, ttl),
                );
                self.store.set(&record_key, &encode_json(&record)?).await?;
                self.store.delete(&marker_key).await?;

                info!(elapsed_ms, "Operation completed");
                Ok(Idempotent::Executed(value))
            }
            Err(e) => {
                let settled = Utc::now();
                let record = marker.fail(
                    e.to_string(),
                    elapsed_ms,
                    settled,
                    after(settled, self.settings.failed_retention()),
                );

                // The operation error wins over bookkeeping errors
                if let Err(store_err) = self.settle_failure(&record_key, &marker_key, &record).await {
                    warn!(error = %store_err, "Failed to record operation failure");
                }

                warn!(elapsed_ms, error = %e, "Operation failed");
                Err(e)
            }
        }
    }

    /// Fetch the settled record for a key, if any
    pub async fn record(&self, key: &str) -> Result<Option<OperationRecord>, GuardError> {
        let record_key = KeySpace::Operation.key(&sanitize_key(key));
        Ok(load_json(self.store.as_ref(), &record_key)
            .await?
            .map(|stored| stored.value))
    }

    /// Drop every ledger entry for a key, making it immediately re-runnable
    pub async fn forget(&self, key: &str) -> Result<(), GuardError> {
        let id = sanitize_key(key);
        self.store.delete(&KeySpace::Operation.key(&id)).await?;
        self.store.delete(&KeySpace::StartMarker.key(&id)).await?;
        Ok(())
    }

    async fn completed_result<T: DeserializeOwned>(
        &self,
        record_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Idempotent<T>>, GuardError> {
        let Some(stored) = load_json::<OperationRecord>(self.store.as_ref(), record_key).await? else {
            return Ok(None);
        };
        let record = stored.value;
        if !record.suppresses(now) {
            return Ok(None);
        }

        let snapshot = record.result_snapshot.clone().unwrap_or(serde_json::Value::Null);
        match serde_json::from_value(snapshot) {
            Ok(value) => {
                info!(completed_at = %record.settled_at(), "Already completed, skipping");
                Ok(Some(Idempotent::Skipped {
                    value,
                    reason: SkipReason::AlreadyCompleted,
                    completed_at: record.settled_at(),
                }))
            }
            Err(e) => {
                warn!(error = %e, "Stored result does not match the expected type, re-executing");
                Ok(None)
            }
        }
    }

    async fn settle_failure(
        &self,
        record_key: &str,
        marker_key: &str,
        record: &OperationRecord,
    ) -> Result<(), GuardError> {
        self.store.set(record_key, &encode_json(record)?).await?;
        self.store.delete(marker_key).await?;
        Ok(())
    }
}
