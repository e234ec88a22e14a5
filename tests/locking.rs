mod common;

use std::time::Duration;

use common::quick_locks;
use common::refs;
use common::Fixture;
use wt_cache::lock::Acquisition;
use wt_cache::prelude::*;
use wt_cache::record;

#[tokio::test]
async fn foreign_lock_aborts_write_through() {
    let mut fx = Fixture::new();
    fx.repo.declare_index(["author_id"], IndexOptions::default()).unwrap();

    let intruder = DistributedLock::new(fx.backend.clone(), quick_locks());
    let guard = intruder.lock("Story/id/1").await.unwrap();

    let story = fx.table.insert(record! { "id" => 1, "author_id" => 7 });
    let err = fx.repo.on_create(&fx.session, &story).await.unwrap_err();
    assert!(err.is_lock_unavailable(), "{err:?}");
    assert_eq!(fx.cached("id/1").await, None);
    assert_eq!(fx.cached("author_id/7").await, None);
    // The lock taken before the contended one was released.
    assert_eq!(fx.backend.inner().get("lock/Story/author_id/7").await.unwrap(), None);

    guard.release().await.unwrap();
    fx.repo.on_create(&fx.session, &story).await.unwrap();
    assert_eq!(fx.cached("author_id/7").await, Some(refs(&[1])));
}

#[tokio::test]
async fn held_lock_is_reentrant_for_its_owner() {
    let fx = Fixture::new();
    let guard = fx.session.lock().lock("a").await.unwrap();
    assert_eq!(guard.acquisition(), Acquisition::Acquired);

    fx.session
        .transaction(async { fx.session.set("a", CacheValue::Integer(1), None).await })
        .await
        .unwrap();

    // Committing didn't release the lock held outside of it.
    assert!(fx.session.lock().holds("a"));
    assert!(fx.backend.inner().get("lock/a").await.unwrap().is_some());
    guard.release().await.unwrap();
    assert_eq!(fx.backend.inner().get("lock/a").await.unwrap(), None);
}

#[tokio::test]
async fn abandoned_lock_expires() {
    let fx = Fixture::new();
    let short = LockOptions {
        expiry: Duration::from_millis(30),
        ..quick_locks()
    };
    let crashed = DistributedLock::new(fx.backend.clone(), short);
    assert_eq!(crashed.acquire("a").await.unwrap(), Acquisition::Acquired);

    let other = fx.session();
    let impatient = LockOptions {
        retries: 1,
        ..quick_locks()
    };
    assert!(other.lock().acquire_with("a", impatient).await.unwrap_err().is_lock_unavailable());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(other.lock().acquire_with("a", impatient).await.unwrap(), Acquisition::Acquired);
}

#[tokio::test]
async fn synchronize_serializes_owners() {
    let fx = Fixture::new();
    let first = fx.session();
    let second = fx.session();

    let value = first
        .lock()
        .synchronize("counter", || async {
            let blocked = second
                .lock()
                .acquire_with(
                    "counter",
                    LockOptions {
                        retries: 2,
                        ..quick_locks()
                    },
                )
                .await;
            assert!(blocked.unwrap_err().is_lock_unavailable());
            Ok(42)
        })
        .await
        .unwrap();
    assert_eq!(value, 42);

    let guard = second.lock().lock("counter").await.unwrap();
    assert_eq!(guard.acquisition(), Acquisition::Acquired);
    guard.release().await.unwrap();
}
