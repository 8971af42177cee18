//! Cooperative distributed locking over the shared store.
//!
//! A lock is a lease record under `lock:<name>`. Acquisition polls with
//! jittered sleeps until the lease is free or the deadline passes. Two
//! strategies implement a single acquisition attempt:
//! - [`LeaseLock`]: write the lease, then re-read to confirm our token
//!   survived (last-write-wins stores; a narrow race remains)
//! - [`CasLock`]: claim the key with compare-and-swap (no race)
//!
//! Locking is advisory: it only works if every writer goes through here.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::domain::{new_token, sanitize_key, KeySpace, LockLease};
use crate::store::{encode_json, load_json, StateStore, StoreError};

use super::error::GuardError;

/// Expired leases reclaimed within one attempt before giving up the attempt
const MAX_RECLAIMS_PER_ATTEMPT: usize = 3;

/// Lock timing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    /// Lease duration (default: 30s)
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    /// Default acquisition timeout (default: 10s)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Lower bound of the poll sleep (default: 100ms)
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    /// Upper bound of the poll sleep (default: 300ms)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_lease_ms() -> u64 {
    30_000
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_min_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    300
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lease_ms: default_lease_ms(),
            timeout_ms: default_timeout_ms(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl LockSettings {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Uniformly jittered poll delay
    pub fn jittered_backoff(&self) -> Duration {
        let (low, high) = if self.min_backoff_ms <= self.max_backoff_ms {
            (self.min_backoff_ms, self.max_backoff_ms)
        } else {
            (self.max_backoff_ms, self.min_backoff_ms)
        };
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }
}

/// One acquisition attempt and a release, against some store.
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Strategy name (for logs)
    fn name(&self) -> &str;

    /// Try once to take the lease for `name`. `None` means a live lease is
    /// held by someone else.
    async fn try_acquire(
        &self,
        name: &str,
        holder_token: &str,
        lease: Duration,
    ) -> Result<Option<LockLease>, GuardError>;

    /// Release the lease if it is still ours. Returns whether it was released.
    async fn release(&self, lease: &LockLease) -> Result<bool, GuardError>;
}

/// Lease-and-verify locking for stores without compare-and-swap
pub struct LeaseLock {
    store: Arc<dyn StateStore>,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LockCoordinator for LeaseLock {
    fn name(&self) -> &str {
        "lease"
    }

    async fn try_acquire(
        &self,
        name: &str,
        holder_token: &str,
        lease: Duration,
    ) -> Result<Option<LockLease>, GuardError> {
        let store_key = KeySpace::Lock.key(name);

        for _ in 0..MAX_RECLAIMS_PER_ATTEMPT {
            let now = Utc::now();
            match load_json::<LockLease>(self.store.as_ref(), &store_key).await? {
                Some(current) if !current.value.is_expired(now) => return Ok(None),
                Some(current) => {
                    debug!(
                        lock = name,
                        previous_holder = %current.value.holder_token,
                        "Reclaiming expired lease"
                    );
                    self.store.delete(&store_key).await?;
                }
                None => {
                    let candidate = LockLease::new(name.to_string(), holder_token.to_string(), now, lease);
                    self.store.set(&store_key, &encode_json(&candidate)?).await?;

                    // Another writer may have overwritten us between the
                    // read and the write; only the surviving token holds it.
                    let confirmed = load_json::<LockLease>(self.store.as_ref(), &store_key)
                        .await?
                        .map(|stored| stored.value.is_held_by(holder_token))
                        .unwrap_or(false);

                    return Ok(confirmed.then_some(candidate));
                }
            }
        }

        Ok(None)
    }

    async fn release(&self, lease: &LockLease) -> Result<bool, GuardError> {
        let store_key = KeySpace::Lock.key(&lease.key);
        match load_json::<LockLease>(self.store.as_ref(), &store_key).await? {
            Some(current) if current.value.is_held_by(&lease.holder_token) => {
                self.store.delete(&store_key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Compare-and-swap locking for stores that support it
pub struct CasLock {
    store: Arc<dyn StateStore>,
}

impl CasLock {
    /// Returns `None` when the store has no compare-and-swap
    pub fn new(store: Arc<dyn StateStore>) -> Option<Self> {
        store.atomic()?;
        Some(Self { store })
    }

    fn unsupported(&self) -> GuardError {
        StoreError::Unsupported {
            store: self.store.name().to_string(),
            capability: "compare-and-swap",
        }
        .into()
    }
}

#[async_trait]
impl LockCoordinator for CasLock {
    fn name(&self) -> &str {
        "cas"
    }

    async fn try_acquire(
        &self,
        name: &str,
        holder_token: &str,
        lease: Duration,
    ) -> Result<Option<LockLease>, GuardError> {
        let Some(atomic) = self.store.atomic() else {
            return Err(self.unsupported());
        };
        let store_key = KeySpace::Lock.key(name);
        let now = Utc::now();

        let expected = match load_json::<LockLease>(self.store.as_ref(), &store_key).await? {
            Some(current) if !current.value.is_expired(now) => return Ok(None),
            Some(current) => {
                debug!(lock = name, "Reclaiming expired lease");
                Some(current.raw)
            }
            None => None,
        };

        let candidate = LockLease::new(name.to_string(), holder_token.to_string(), now, lease);
        let encoded = encode_json(&candidate)?;
        let won = atomic
            .compare_and_swap(&store_key, expected.as_deref(), Some(&encoded))
            .await?;

        Ok(won.then_some(candidate))
    }

    async fn release(&self, lease: &LockLease) -> Result<bool, GuardError> {
        let Some(atomic) = self.store.atomic() else {
            return Err(self.unsupported());
        };
        let store_key = KeySpace::Lock.key(&lease.key);

        match load_json::<LockLease>(self.store.as_ref(), &store_key).await? {
            Some(current) if current.value.is_held_by(&lease.holder_token) => Ok(atomic
                .compare_and_swap(&store_key, Some(&current.raw), None)
                .await?),
            _ => Ok(false),
        }
    }
}

/// A held lock. Release it explicitly; an unreleased lease simply expires.
pub struct LockGuard {
    coordinator: Arc<dyn LockCoordinator>,
    lease: LockLease,
}

impl LockGuard {
    pub fn lease(&self) -> &LockLease {
        &self.lease
    }

    /// Release the lock. Returns `false` if the lease was no longer ours.
    pub async fn release(self) -> Result<bool, GuardError> {
        let released = self.coordinator.release(&self.lease).await?;
        if !released {
            warn!(lock = %self.lease.key, "Lease was lost before release");
        }
        Ok(released)
    }
}

/// Polling lock manager
#[derive(Clone)]
pub struct LockManager {
    coordinator: Arc<dyn LockCoordinator>,
    settings: LockSettings,
}

impl LockManager {
    pub fn new(coordinator: Arc<dyn LockCoordinator>, settings: LockSettings) -> Self {
        Self {
            coordinator,
            settings,
        }
    }

    /// Pick compare-and-swap when the store supports it
    pub fn for_store(store: Arc<dyn StateStore>, settings: LockSettings) -> Self {
        let coordinator: Arc<dyn LockCoordinator> = match CasLock::new(store.clone()) {
            Some(cas) => Arc::new(cas),
            None => Arc::new(LeaseLock::new(store)),
        };
        Self::new(coordinator, settings)
    }

    pub fn strategy(&self) -> &str {
        self.coordinator.name()
    }

    /// Wait for the lock until `timeout` (or the configured default) elapses.
    #[instrument(skip(self), fields(strategy = %self.coordinator.name()))]
    pub async fn acquire(
        &self,
        lock_key: &str,
        timeout: Option<Duration>,
    ) -> Result<LockGuard, GuardError> {
        let name = sanitize_key(lock_key);
        let token = new_token();
        let timeout = timeout.unwrap_or_else(|| self.settings.timeout());
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(lease) = self
                .coordinator
                .try_acquire(&name, &token, self.settings.lease())
                .await?
            {
                debug!(attempts, waited_ms = started.elapsed().as_millis() as u64, "Lock acquired");
                return Ok(LockGuard {
                    coordinator: Arc::clone(&self.coordinator),
                    lease,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = started.elapsed().as_millis() as u64;
                info!(attempts, waited_ms, "Lock not acquired before deadline");
                return Err(GuardError::Concurrency {
                    key: name,
                    waited_ms,
                });
            }

            let delay = self.settings.jittered_backoff().min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    /// Run `operation` while holding the lock, releasing it afterwards
    /// whether the operation succeeded or failed.
    pub async fn with_lock<T, F, Fut>(
        &self,
        lock_key: &str,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T, GuardError>
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, GuardError>> + Send,
    {
        let guard = self.acquire(lock_key, timeout).await?;
        let result = operation().await;

        if let Err(e) = guard.release().await {
            warn!(lock = lock_key, error = %e, "Failed to release lock");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn fast_settings() -> LockSettings {
        LockSettings {
            lease_ms: 30_000,
            timeout_ms: 200,
            min_backoff_ms: 5,
            max_backoff_ms: 10,
        }
    }

    #[test]
    fn test_jitter_within_bounds() {
        let settings = LockSettings::default();
        for _ in 0..100 {
            let delay = settings.jittered_backoff();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_strategy_selection() {
        let cas = LockManager::for_store(Arc::new(MemoryStore::new()), LockSettings::default());
        assert_eq!(cas.strategy(), "cas");

        let lww = LockManager::for_store(
            Arc::new(MemoryStore::last_write_wins()),
            LockSettings::default(),
        );
        assert_eq!(lww.strategy(), "lease");
    }

    #[tokio::test]
    async fn test_lease_lock_release_requires_token() {
        let store = Arc::new(MemoryStore::last_write_wins());
        let lock = LeaseLock::new(store.clone());

        let lease = lock
            .try_acquire("x", "token-a", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(lock
            .try_acquire("x", "token-b", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        let mut forged = lease.clone();
        forged.holder_token = "token-b".to_string();
        assert!(!lock.release(&forged).await.unwrap());
        assert!(lock.release(&lease).await.unwrap());
        assert_eq!(store.get("lock:x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cas_lock_reclaims_expired_lease() {
        let store = Arc::new(MemoryStore::new());
        let stale = LockLease {
            key: "x".to_string(),
            holder_token: "gone".to_string(),
            acquired_at: Utc::now() - chrono::Duration::seconds(60),
            expires_at: Utc::now() - chrono::Duration::seconds(30),
        };
        store
            .set("lock:x", &serde_json::to_string(&stale).unwrap())
            .await
            .unwrap();

        let lock = CasLock::new(store.clone()).unwrap();
        let lease = lock
            .try_acquire("x", "fresh", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(lease.is_held_by("fresh"));
    }

    #[tokio::test]
    async fn test_acquire_times_out_with_concurrency_error() {
        let manager = LockManager::for_store(Arc::new(MemoryStore::new()), fast_settings());

        let _held = manager.acquire("busy", None).await.unwrap();
        let result = manager.acquire("busy", None).await;

        match result {
            Err(GuardError::Concurrency { key, waited_ms }) => {
                assert_eq!(key, "busy");
                assert!(waited_ms >= 200);
            }
            _ => panic!("Expected Concurrency error"),
        }
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let store = Arc::new(MemoryStore::new());
        let manager = LockManager::for_store(store.clone(), fast_settings());

        let result: Result<(), _> = manager
            .with_lock("job", None, || async {
                Err(GuardError::Transport("boom".to_string()))
            })
            .await;

        assert!(matches!(result, Err(GuardError::Transport(_))));
        assert_eq!(store.get("lock:job").await.unwrap(), None);
    }
}
