//! Maintenance sweeper.
//!
//! Garbage-collects bookkeeping the other components leave behind:
//! - completed ledger records past `expires_at`
//! - failed records and orphaned start markers past the failure retention
//! - lock leases past `expires_at`
//! - any record that no longer deserializes
//!
//! Circuit records are never expired. Deletes are conditional on the value
//! the sweeper judged when the store supports compare-and-swap, so a record
//! rewritten mid-sweep survives.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::domain::{after, CircuitRecord, KeySpace, LockLease, OperationRecord, OperationStatus};
use crate::store::{delete_if_unchanged, StateStore};

use super::error::GuardError;

/// Sweeper cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperSettings {
    /// Seconds between sweeps in daemon mode (default: 1800 = 30 min)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    30 * 60
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl SweeperSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Counts of deleted records per category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Total records deleted
    pub cleaned: usize,
    pub completed: usize,
    pub failed: usize,
    pub stale_markers: usize,
    pub leases: usize,
    pub corrupt: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Keep,
    ExpiredCompleted,
    ExpiredFailed,
    StaleMarker,
    ExpiredLease,
    Corrupt,
}

impl SweepReport {
    fn count(&mut self, verdict: Verdict) {
        let slot = match verdict {
            Verdict::Keep => return,
            Verdict::ExpiredCompleted => &mut self.completed,
            Verdict::ExpiredFailed => &mut self.failed,
            Verdict::StaleMarker => &mut self.stale_markers,
            Verdict::ExpiredLease => &mut self.leases,
            Verdict::Corrupt => &mut self.corrupt,
        };
        *slot += 1;
        self.cleaned += 1;
    }
}

/// Expired-record collector
#[derive(Clone)]
pub struct Sweeper {
    store: Arc<dyn StateStore>,
    failed_retention: Duration,
}

impl Sweeper {
    /// `failed_retention` bounds failed records and orphaned start markers
    pub fn new(store: Arc<dyn StateStore>, failed_retention: Duration) -> Self {
        Self {
            store,
            failed_retention,
        }
    }

    /// One full pass over the store
    #[instrument(skip(self), fields(store = %self.store.name()))]
    pub async fn cleanup_expired_operations(&self) -> Result<SweepReport, GuardError> {
        let keys = self.store.list_keys().await?;
        let now = Utc::now();
        let mut report = SweepReport::default();

        for key in keys {
            let Some((space, _)) = KeySpace::classify(&key) else {
                continue;
            };

            let raw = match self.store.get(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%key, error = %e, "Failed to read record, skipping");
                    continue;
                }
            };

            let verdict = self.judge(space, &raw, now);
            if verdict == Verdict::Keep {
                continue;
            }

            match delete_if_unchanged(self.store.as_ref(), &key, &raw).await {
                Ok(true) => {
                    debug!(%key, ?verdict, "Deleted record");
                    report.count(verdict);
                }
                Ok(false) => debug!(%key, "Record changed during sweep, kept"),
                Err(e) => warn!(%key, error = %e, "Failed to delete record, skipping"),
            }
        }

        info!(
            cleaned = report.cleaned,
            completed = report.completed,
            failed = report.failed,
            stale_markers = report.stale_markers,
            leases = report.leases,
            corrupt = report.corrupt,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Sweep every `every` until `shutdown` resolves. The first sweep runs
    /// immediately.
    pub async fn run_periodic<S>(&self, every: Duration, shutdown: S) -> Result<(), GuardError>
    where
        S: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Sweeper stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.cleanup_expired_operations().await {
                        warn!(error = %e, "Sweep failed");
                    }
                }
            }
        }
    }

    fn judge(&self, space: KeySpace, raw: &str, now: DateTime<Utc>) -> Verdict {
        match space {
            KeySpace::Operation | KeySpace::StartMarker => {
                match serde_json::from_str::<OperationRecord>(raw) {
                    Ok(record) => self.judge_operation(&record, now),
                    Err(_) => Verdict::Corrupt,
                }
            }
            KeySpace::Lock => match serde_json::from_str::<LockLease>(raw) {
                Ok(lease) if lease.is_expired(now) => Verdict::ExpiredLease,
                Ok(_) => Verdict::Keep,
                Err(_) => Verdict::Corrupt,
            },
            KeySpace::Circuit => match serde_json::from_str::<CircuitRecord>(raw) {
                Ok(_) => Verdict::Keep,
                Err(_) => Verdict::Corrupt,
            },
        }
    }

    fn judge_operation(&self, record: &OperationRecord, now: DateTime<Utc>) -> Verdict {
        match record.status {
            OperationStatus::Completed if record.is_expired(now) => Verdict::ExpiredCompleted,
            OperationStatus::Completed => Verdict::Keep,
            OperationStatus::Failed => {
                let failed_at = record.failed_at.unwrap_or(record.started_at);
                if now >= after(failed_at, self.failed_retention) {
                    Verdict::ExpiredFailed
                } else {
                    Verdict::Keep
                }
            }
            OperationStatus::InProgress => {
                if now >= after(record.started_at, self.failed_retention) {
                    Verdict::StaleMarker
                } else {
                    Verdict::Keep
                }
            }
        }
    }
}
