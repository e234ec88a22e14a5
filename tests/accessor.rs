mod common;

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::Fixture;
use wt_cache::prelude::*;

#[tokio::test]
async fn version_bump_invalidates() {
    let fx = Fixture::new();
    let v1 = Accessor::with_namespace("Story", 1);
    let v2 = Accessor::with_namespace("Story", 2);

    v1.set(&fx.session, "id/1", CacheValue::Integer(1), None).await.unwrap();
    assert_eq!(
        fx.backend.inner().get("Story:1/id/1").await.unwrap(),
        Some(CacheValue::Integer(1))
    );
    assert_eq!(v2.get(&fx.session, "id/1").await.unwrap(), None);
}

#[tokio::test]
async fn read_through_never_overwrites() {
    let fx = Fixture::new();
    let accessor = fx.repo.accessor().clone();
    let other = fx.session();

    let value = accessor
        .get_or_insert_with(&fx.session, "answer", None, || async {
            accessor.set(&other, "answer", CacheValue::Integer(2), None).await?;
            Ok(CacheValue::Integer(1))
        })
        .await
        .unwrap();

    assert_eq!(value, CacheValue::Integer(1));
    assert_eq!(fx.cached("answer").await, Some(CacheValue::Integer(2)));
}

#[tokio::test]
async fn entries_expire() {
    let fx = Fixture::new();
    let accessor = fx.repo.accessor().clone();
    let loads = AtomicUsize::new(0);
    let load = || async {
        loads.fetch_add(1, Ordering::Relaxed);
        Ok(CacheValue::Integer(1))
    };

    let ttl = Some(Duration::from_millis(30));
    accessor.get_or_insert_with(&fx.session, "k", ttl, load).await.unwrap();
    accessor.get_or_insert_with(&fx.session, "k", ttl, load).await.unwrap();
    assert_eq!(loads.load(Ordering::Relaxed), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    accessor.get_or_insert_with(&fx.session, "k", ttl, load).await.unwrap();
    assert_eq!(loads.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn counter_seed_race_applies_delta_on_top() {
    let fx = Fixture::new();
    let accessor = fx.repo.accessor().clone();
    let other = fx.session();

    let value = accessor
        .incr(&fx.session, "hits", 1, None, || async {
            accessor.set(&other, "hits", CacheValue::Integer(10), None).await?;
            Ok(5)
        })
        .await
        .unwrap();

    assert_eq!(value, 11);
    assert_eq!(fx.cached("hits").await, Some(CacheValue::Integer(11)));
}

#[tokio::test]
async fn expire_deletes() {
    let fx = Fixture::new();
    let accessor = fx.repo.accessor().clone();
    assert!(accessor.add(&fx.session, "k", CacheValue::Integer(1), None).await.unwrap());
    assert!(!accessor.add(&fx.session, "k", CacheValue::Integer(2), None).await.unwrap());

    accessor.expire(&fx.session, "k").await.unwrap();
    assert_eq!(accessor.get(&fx.session, "k").await.unwrap(), None);
}
