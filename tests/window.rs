mod common;

use common::ids;
use common::refs;
use common::Fixture;
use wt_cache::prelude::*;
use wt_cache::query::UncacheableReason;
use wt_cache::record;
use wt_cache::test::TableCall;

fn windowed() -> Fixture {
    let mut fx = Fixture::new();
    fx.repo
        .declare_index(
            ["author_id"],
            IndexOptions {
                order: Order::Descending,
                limit: Some(5),
                buffer: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
    fx
}

#[tokio::test]
async fn list_never_exceeds_window() {
    let fx = windowed();
    for id in 1..=9i64 {
        fx.create(record! { "id" => id, "author_id" => 1 }).await;
        match fx.cached("author_id/1").await {
            Some(CacheValue::References(list)) => assert!(list.len() <= 7, "{} references after {id}", list.len()),
            other => panic!("unexpected list {other:?}"),
        }
    }

    assert_eq!(fx.cached("author_id/1").await, Some(refs(&[9, 8, 7, 6, 5, 4, 3])));
    assert_eq!(fx.cached("author_id/1/count").await, Some(CacheValue::Integer(9)));
}

#[tokio::test]
async fn deletions_below_limit_refill_the_list() {
    let fx = windowed();
    for id in 1..=10i64 {
        fx.create(record! { "id" => id, "author_id" => 1 }).await;
    }
    assert_eq!(fx.cached("author_id/1").await, Some(refs(&[10, 9, 8, 7, 6, 5, 4])));

    fx.destroy(10).await;
    fx.destroy(9).await;
    // Still at the limit, the buffer absorbed both deletions.
    assert_eq!(fx.cached("author_id/1").await, Some(refs(&[8, 7, 6, 5, 4])));

    fx.table.clear_calls();
    fx.destroy(8).await;
    assert_eq!(
        fx.table.count_calls(|c| matches!(c, TableCall::FindReferences { limit: Some(7), .. })),
        1
    );
    assert_eq!(fx.cached("author_id/1").await, Some(refs(&[7, 6, 5, 4, 3, 2, 1])));
    assert_eq!(fx.cached("author_id/1/count").await, Some(CacheValue::Integer(7)));
}

#[tokio::test]
async fn no_refill_when_nothing_is_left_out() {
    let fx = windowed();
    for id in 1..=6i64 {
        fx.create(record! { "id" => id, "author_id" => 1 }).await;
    }
    fx.table.clear_calls();
    for id in [6, 5] {
        fx.destroy(id).await;
    }
    assert_eq!(fx.cached("author_id/1").await, Some(refs(&[4, 3, 2, 1])));
    assert_eq!(fx.cached("author_id/1/count").await, Some(CacheValue::Integer(4)));
    assert_eq!(fx.table.count_calls(|c| matches!(c, TableCall::FindReferences { .. })), 0);
}

#[tokio::test]
async fn finder_pages_within_the_window() {
    let fx = windowed();
    for id in 1..=9i64 {
        fx.create(record! { "id" => id, "author_id" => 1, "title" => format!("story {id}") })
            .await;
    }
    fx.table.clear_calls();

    let query = QueryOptions::filter([("author_id", 1)])
        .with_order("id DESC")
        .with_limit(3)
        .with_offset(2);
    let found = fx.repo.find(&fx.session, &[&query]).await.unwrap().cached().unwrap();
    assert_eq!(ids(&found), vec![7, 6, 5]);
    assert!(fx.table.calls().is_empty());

    let beyond = QueryOptions::filter([("author_id", 1)]).with_order("id DESC").with_limit(6);
    assert_eq!(
        fx.repo.find(&fx.session, &[&beyond]).await.unwrap(),
        Lookup::Uncacheable(UncacheableReason::IncompatibleIndex)
    );

    let ascending = QueryOptions::filter([("author_id", 1)]).with_limit(3);
    assert_eq!(
        fx.repo.find(&fx.session, &[&ascending]).await.unwrap(),
        Lookup::Uncacheable(UncacheableReason::IncompatibleIndex)
    );
}
