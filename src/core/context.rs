//! Explicit context object.
//!
//! Holds the shared store client and settings, and hands out the
//! components that use them. Nothing here is process-wide, so tests can
//! build as many isolated contexts as they like.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::adapters::webhook::{HttpTransport, ReqwestTransport, WebhookExecutor, WebhookSettings};
use crate::store::StateStore;

use super::breaker::{BreakerSettings, CircuitBreakerRegistry};
use super::error::GuardError;
use super::ledger::{IdempotencyLedger, LedgerSettings};
use super::lock::{LockManager, LockSettings};
use super::safety::UrlPolicy;
use super::sweeper::{Sweeper, SweeperSettings};

/// Settings for every component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardSettings {
    #[serde(default)]
    pub ledger: LedgerSettings,

    #[serde(default)]
    pub lock: LockSettings,

    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub webhook: WebhookSettings,

    #[serde(default)]
    pub safety: UrlPolicy,

    #[serde(default)]
    pub sweeper: SweeperSettings,
}

/// Shared store plus settings, injected into each component
#[derive(Clone)]
pub struct GuardContext {
    store: Arc<dyn StateStore>,
    settings: GuardSettings,
}

impl GuardContext {
    pub fn new(store: Arc<dyn StateStore>, settings: GuardSettings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn settings(&self) -> &GuardSettings {
        &self.settings
    }

    pub fn ledger(&self) -> IdempotencyLedger {
        IdempotencyLedger::new(self.store.clone(), self.settings.ledger.clone())
    }

    /// Lock manager using compare-and-swap when the store has it
    pub fn locks(&self) -> LockManager {
        LockManager::for_store(self.store.clone(), self.settings.lock.clone())
    }

    pub fn breakers(&self) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(self.store.clone(), self.settings.breaker.clone())
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(self.store.clone(), self.settings.ledger.failed_retention())
    }

    /// Webhook executor over the default HTTP client
    pub fn webhooks(&self) -> Result<WebhookExecutor, GuardError> {
        let transport = ReqwestTransport::new(&self.settings.webhook)?;
        Ok(self.webhooks_with_transport(Arc::new(transport)))
    }

    /// Webhook executor over a caller-supplied transport
    pub fn webhooks_with_transport(&self, transport: Arc<dyn HttpTransport>) -> WebhookExecutor {
        WebhookExecutor::new(
            self.ledger(),
            self.breakers(),
            self.settings.safety.clone(),
            self.settings.webhook.clone(),
            transport,
        )
    }
}
