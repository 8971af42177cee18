//! Locking Integration Tests
//!
//! Mutual exclusion and lease reclaim for both lock strategies.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use hookguard::core::{GuardContext, GuardSettings, LockManager, LockSettings};
use hookguard::domain::LockLease;
use hookguard::store::{MemoryStore, StateStore};

fn settings() -> LockSettings {
    LockSettings {
        lease_ms: 30_000,
        timeout_ms: 2_000,
        min_backoff_ms: 5,
        max_backoff_ms: 15,
    }
}

fn manager(store: Arc<dyn StateStore>) -> LockManager {
    LockManager::for_store(store, settings())
}

/// Two workers enter the same critical section; record overlap and order.
async fn contend(manager: &LockManager) -> (usize, Vec<&'static str>) {
    let active = AtomicUsize::new(0);
    let max_active = AtomicUsize::new(0);
    let order = Mutex::new(Vec::new());

    let worker = |name: &'static str| {
        let active = &active;
        let max_active = &max_active;
        let order = &order;
        async move {
            manager
                .with_lock("x", None, || async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    order.lock().unwrap().push(name);
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        }
    };

    let (a, b) = tokio::join!(worker("a"), worker("b"));
    a.unwrap();
    b.unwrap();

    let order = order.into_inner().unwrap();
    (max_active.load(Ordering::SeqCst), order)
}

#[tokio::test]
async fn test_mutual_exclusion_with_cas() {
    let manager = manager(Arc::new(MemoryStore::new()));
    assert_eq!(manager.strategy(), "cas");

    let (max_active, order) = contend(&manager).await;
    assert_eq!(max_active, 1);
    assert_eq!(order.len(), 2);
    assert_ne!(order[0], order[1]);
}

#[tokio::test]
async fn test_mutual_exclusion_with_lease_polling() {
    let manager = manager(Arc::new(MemoryStore::last_write_wins()));
    assert_eq!(manager.strategy(), "lease");

    let (max_active, order) = contend(&manager).await;
    assert_eq!(max_active, 1);
    assert_eq!(order.len(), 2);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    for store in [
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStore::last_write_wins()),
    ] {
        let abandoned = LockLease {
            key: "nightly".to_string(),
            holder_token: "crashed-worker".to_string(),
            acquired_at: Utc::now() - chrono::Duration::seconds(90),
            expires_at: Utc::now() - chrono::Duration::seconds(60),
        };
        store
            .set("lock:nightly", &serde_json::to_string(&abandoned).unwrap())
            .await
            .unwrap();

        let manager = manager(store.clone());
        let guard = manager
            .acquire("nightly", Some(Duration::from_millis(100)))
            .await
            .unwrap();

        assert!(!guard.lease().is_held_by("crashed-worker"));
        assert!(guard.release().await.unwrap());
        assert_eq!(store.get("lock:nightly").await.unwrap(), None);
    }
}

#[tokio::test]
async fn test_live_lease_blocks_until_timeout() {
    let context = GuardContext::new(
        Arc::new(MemoryStore::new()),
        GuardSettings {
            lock: settings(),
            ..Default::default()
        },
    );
    let locks = context.locks();

    let held = locks.acquire("report", None).await.unwrap();
    let calls = AtomicUsize::new(0);

    let err = locks
        .with_lock("report", Some(Duration::from_millis(80)), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(err.is_concurrency());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    held.release().await.unwrap();
    locks
        .with_lock("report", Some(Duration::from_millis(80)), || async { Ok(()) })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_release_after_lease_lost_is_harmless() {
    let store = Arc::new(MemoryStore::new());
    let short = LockManager::for_store(
        store.clone(),
        LockSettings {
            lease_ms: 20,
            ..settings()
        },
    );

    let stale_guard = short.acquire("job", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    let new_holder = manager(store.clone()).acquire("job", None).await.unwrap();

    // The old holder must not remove the new holder's lease
    assert!(!stale_guard.release().await.unwrap());
    assert!(store.get("lock:job").await.unwrap().is_some());
    assert!(new_holder.release().await.unwrap());
}
