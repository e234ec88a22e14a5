use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::Result;
use crate::types::AttrValue;
use crate::types::CacheValue;
use crate::types::Order;
use crate::types::Record;

/// The remote key-value store: a memcached-like service.
///
/// A `ttl` of `None` means the entry never expires. Implementations report transport failures as
/// [`CacheError::BackendUnavailable`](crate::error::CacheError::BackendUnavailable); the engine never retries them.
#[async_trait]
pub trait KeyValueBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>>;

    /// Keys that are not cached are simply absent from the returned map.
    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, CacheValue>>;

    async fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> Result<()>;

    /// Store only if the key is not present. This is the sole primitive the locks are built upon.
    async fn add(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// `None` if the key is missing.
    async fn incr(&self, key: &str, delta: u64) -> Result<Option<i64>>;

    /// `None` if the key is missing. The result never goes below zero.
    async fn decr(&self, key: &str, delta: u64) -> Result<Option<i64>>;

    async fn flush_all(&self) -> Result<()>;
}

/// Host-side access to the backing store, used to seed cache entries on a miss.
///
/// `conditions` are sorted `(attribute, value)` equality pairs.
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Primary keys of the matching rows, sorted by primary key in the given order and cut at `limit`.
    async fn find_references(
        &self,
        conditions: &[(String, AttrValue)],
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<AttrValue>, Self::Error>;

    /// Number of rows matching the conditions.
    async fn count(&self, conditions: &[(String, AttrValue)]) -> Result<u64, Self::Error>;

    /// Resolve primary keys into full records. Unknown references are omitted.
    async fn find_by_references(&self, references: &[AttrValue]) -> Result<Vec<Record>, Self::Error>;
}

impl Debug for dyn KeyValueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyValueBackend")
    }
}
