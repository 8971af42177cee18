//! Circuit breaker registry.
//!
//! # States
//! - Closed: calls pass through; failures are counted
//! - Open: calls fail fast until `reset_at`
//! - Half-Open: derived once `reset_at` passes; one probe call is admitted
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold
//! Open → Half-Open: now >= reset_at (computed, never persisted)
//! Half-Open → Closed: probe succeeds
//! Half-Open → Open: probe fails (fresh reset_at)
//! ```
//!
//! The probe slot is claimed in the store before the probe runs, with
//! compare-and-swap where available, so concurrent callers in the
//! half-open window cannot all become probes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{after, new_token, sanitize_key, CircuitRecord, CircuitState, KeySpace};
use crate::store::{encode_json, load_json, StateStore};

use super::error::GuardError;

/// Compare-and-swap attempts per bookkeeping update before falling back to
/// a plain write
const MAX_UPDATE_ATTEMPTS: usize = 5;

/// Breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cooldown before a probe is allowed (default: 60s)
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Age after which an unsettled probe claim is abandoned (default: 30s)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    60_000
}
fn default_probe_timeout_ms() -> u64 {
    30_000
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl BreakerSettings {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Point-in-time view of one circuit
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub service_key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub reset_at: Option<DateTime<Utc>>,
    pub probe_in_flight: bool,
}

/// Per-service circuit breakers over the shared store
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    store: Arc<dyn StateStore>,
    settings: BreakerSettings,
}

impl CircuitBreakerRegistry {
    pub fn new(store: Arc<dyn StateStore>, settings: BreakerSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Run `operation` through the breaker for `service_key`.
    ///
    /// Fails fast with [`GuardError::CircuitOpen`] while the circuit is open
    /// (or while another caller holds the half-open probe); `operation` is
    /// not invoked in that case. Every error returned by `operation` counts
    /// as a failure.
    #[instrument(skip_all, fields(service = %service_key))]
    pub async fn call<T, F, Fut>(&self, service_key: &str, operation: F) -> Result<T, GuardError>
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, GuardError>> + Send,
    {
        let name = sanitize_key(service_key);
        let store_key = KeySpace::Circuit.key(&name);
        let now = Utc::now();

        let (record, raw) = match load_json::<CircuitRecord>(self.store.as_ref(), &store_key).await? {
            Some(stored) => (stored.value, Some(stored.raw)),
            None => (CircuitRecord::new(name.clone()), None),
        };

        let is_probe = match record.effective_state(now) {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let retry_at = record.reset_at.unwrap_or(now);
                debug!(%retry_at, "Circuit open, failing fast");
                return Err(GuardError::CircuitOpen {
                    service: name,
                    retry_at,
                });
            }
            CircuitState::HalfOpen => {
                self.claim_probe(&name, &store_key, record, raw, now).await?;
                true
            }
        };

        let result = operation().await;

        // Bookkeeping failures are logged; the operation outcome is returned as-is
        let failure = result.as_ref().err().map(|e| e.to_string());
        let bookkeeping = match failure {
            None => self.record_success(&name, &store_key).await,
            Some(cause) => self.record_failure(&name, &store_key, is_probe, &cause).await,
        };
        if let Err(e) = bookkeeping {
            error!(error = %e, "Failed to update circuit record");
        }

        result
    }

    /// Current state of a circuit (closed if never seen)
    pub async fn status(&self, service_key: &str) -> Result<CircuitStatus, GuardError> {
        let name = sanitize_key(service_key);
        let now = Utc::now();
        let record = load_json::<CircuitRecord>(self.store.as_ref(), &KeySpace::Circuit.key(&name))
            .await?
            .map(|stored| stored.value)
            .unwrap_or_else(|| CircuitRecord::new(name.clone()));

        Ok(CircuitStatus {
            service_key: name,
            state: record.effective_state(now),
            failure_count: record.failure_count,
            last_failure: record.last_failure,
            last_success: record.last_success,
            reset_at: record.reset_at,
            probe_in_flight: record.probe_in_flight(now, self.settings.probe_timeout()),
        })
    }

    /// Force a circuit back to closed
    pub async fn reset(&self, service_key: &str) -> Result<(), GuardError> {
        let name = sanitize_key(service_key);
        let mut record = CircuitRecord::new(name.clone());
        record.record_success(Utc::now());
        self.store
            .set(&KeySpace::Circuit.key(&name), &encode_json(&record)?)
            .await?;
        info!(service = %name, "Circuit manually reset");
        Ok(())
    }

    async fn claim_probe(
        &self,
        name: &str,
        store_key: &str,
        mut record: CircuitRecord,
        raw: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), GuardError> {
        let probe_timeout = self.settings.probe_timeout();
        if let Some(claimed_at) = record.probe_claimed_at.filter(|_| record.probe_in_flight(now, probe_timeout)) {
            debug!("Probe already in flight");
            return Err(GuardError::CircuitOpen {
                service: name.to_string(),
                retry_at: after(claimed_at, probe_timeout),
            });
        }

        let token = new_token();
        record.claim_probe(token.clone(), now);
        let encoded = encode_json(&record)?;

        let won = match self.store.atomic() {
            Some(atomic) => {
                atomic
                    .compare_and_swap(store_key, raw.as_deref(), Some(&encoded))
                    .await?
            }
            None => {
                self.store.set(store_key, &encoded).await?;
                load_json::<CircuitRecord>(self.store.as_ref(), store_key)
                    .await?
                    .map(|stored| stored.value.probe_token.as_deref() == Some(token.as_str()))
                    .unwrap_or(false)
            }
        };

        if won {
            info!("Half-open probe claimed");
            Ok(())
        } else {
            debug!("Lost the race for the probe slot");
            Err(GuardError::CircuitOpen {
                service: name.to_string(),
                retry_at: after(now, probe_timeout),
            })
        }
    }

    async fn record_success(&self, name: &str, store_key: &str) -> Result<(), GuardError> {
        let now = Utc::now();
        let (_, recovered) = self
            .update(name, store_key, |record| {
                let recovered = record.state != CircuitState::Closed;
                record.record_success(now);
                recovered
            })
            .await?;

        if recovered {
            info!("Circuit closed after successful probe");
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        name: &str,
        store_key: &str,
        was_probe: bool,
        cause: &str,
    ) -> Result<(), GuardError> {
        let now = Utc::now();
        let threshold = self.settings.failure_threshold;
        let reset_timeout = self.settings.reset_timeout();
        let (record, tripped) = self
            .update(name, store_key, |record| {
                record.record_failure(now, was_probe, threshold, reset_timeout)
            })
            .await?;

        if tripped {
            warn!(
                failure_count = record.failure_count,
                reset_at = ?record.reset_at,
                error = %cause,
                "Circuit opened"
            );
        } else {
            debug!(failure_count = record.failure_count, error = %cause, "Failure recorded");
        }
        Ok(())
    }

    /// Read-modify-write of the circuit record. Retries on a lost
    /// compare-and-swap so concurrent updates are not overwritten.
    async fn update<R, A>(
        &self,
        name: &str,
        store_key: &str,
        mut apply: A,
    ) -> Result<(CircuitRecord, R), GuardError>
    where
        R: Send,
        A: FnMut(&mut CircuitRecord) -> R + Send,
    {
        if let Some(atomic) = self.store.atomic() {
            for attempt in 1..=MAX_UPDATE_ATTEMPTS {
                let (mut record, raw) =
                    match load_json::<CircuitRecord>(self.store.as_ref(), store_key).await? {
                        Some(stored) => (stored.value, Some(stored.raw)),
                        None => (CircuitRecord::new(name.to_string()), None),
                    };
                let outcome = apply(&mut record);
                let encoded = encode_json(&record)?;
                if atomic
                    .compare_and_swap(store_key, raw.as_deref(), Some(&encoded))
                    .await?
                {
                    return Ok((record, outcome));
                }
                debug!(attempt, "Circuit record changed concurrently, retrying");
            }
            warn!("Circuit record contended, falling back to last-write-wins");
        }

        let mut record = self.current(name, store_key).await?;
        let outcome = apply(&mut record);
        self.store.set(store_key, &encode_json(&record)?).await?;
        Ok((record, outcome))
    }

    async fn current(&self, name: &str, store_key: &str) -> Result<CircuitRecord, GuardError> {
        Ok(load_json::<CircuitRecord>(self.store.as_ref(), store_key)
            .await?
            .map(|stored| stored.value)
            .unwrap_or_else(|| CircuitRecord::new(name.to_string())))
    }
}
