//! In-process backend over [moka](https://crates.io/crates/moka).
//!
//! Useful for tests and single-process deployments. Values are kept encoded, so every read hands out a fresh copy just
//! like a networked store would.

use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::CompResult;
use moka::ops::compute::Op;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;
use tracing::trace;

use crate::error::CacheError;
use crate::error::Result;
use crate::traits::KeyValueBackend;
use crate::types::CacheValue;

#[derive(Clone, Debug)]
struct Stored {
    bytes:       Vec<u8>,
    ttl:         Option<Duration>,
    // Counter updates must not extend the entry's lifetime.
    keep_expiry: bool,
}

impl Stored {
    fn new(value: &CacheValue, ttl: Option<Duration>) -> Result<Self> {
        Ok(Self {
            bytes: value.encode()?,
            ttl,
            keep_expiry: false,
        })
    }

    fn value(&self) -> Result<CacheValue> {
        CacheValue::decode(&self.bytes)
    }
}

struct EntryTtl;

impl Expiry<String, Stored> for EntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Stored, _created_at: Instant) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Stored,
        _updated_at: Instant,
        duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        if value.keep_expiry {
            duration_until_expiry
        }
        else {
            value.ttl
        }
    }
}

pub struct MemoryBackend {
    cache: Cache<String, Stored>,
}

impl MemoryBackend {
    pub const DEFAULT_CAPACITY: u64 = 100_000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .name("wt-cache memory backend")
                .max_capacity(max_capacity)
                .eviction_policy(EvictionPolicy::lru())
                .expire_after(EntryTtl)
                .build(),
        }
    }

    async fn adjust(&self, key: &str, delta: i64) -> Result<Option<i64>> {
        let outcome = self
            .cache
            .entry(key.to_string())
            .and_try_compute_with(|entry| async move {
                let Some(entry) = entry
                else {
                    return Ok(Op::Nop);
                };
                let stored = entry.into_value();
                let current = stored.value()?.expect_integer(key)?;
                let next = current.saturating_add(delta).max(0);
                Result::<Op<Stored>, CacheError>::Ok(Op::Put(Stored {
                    bytes:       CacheValue::Integer(next).encode()?,
                    ttl:         stored.ttl,
                    keep_expiry: true,
                }))
            })
            .await?;

        Ok(match outcome {
            CompResult::ReplacedWith(entry) | CompResult::Inserted(entry) | CompResult::Unchanged(entry) => {
                Some(entry.into_value().value()?.expect_integer(key)?)
            }
            CompResult::StillNone(_) | CompResult::Removed(_) => None,
        })
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        self.cache.get(key).await.map(|stored| stored.value()).transpose()
    }

    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, CacheValue>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(stored) = self.cache.get(key.as_str()).await {
                found.insert(key.clone(), stored.value()?);
            }
        }
        Ok(found)
    }

    async fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> Result<()> {
        trace!("SET {key}");
        self.cache.insert(key.to_string(), Stored::new(&value, ttl)?).await;
        Ok(())
    }

    async fn add(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> Result<bool> {
        let stored = Stored::new(&value, ttl)?;
        let entry = self.cache.entry(key.to_string()).or_insert_with(async move { stored }).await;
        trace!("ADD {key}: {}", if entry.is_fresh() { "stored" } else { "exists" });
        Ok(entry.is_fresh())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        trace!("DELETE {key}");
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn incr(&self, key: &str, delta: u64) -> Result<Option<i64>> {
        self.adjust(key, i64::try_from(delta).unwrap_or(i64::MAX)).await
    }

    async fn decr(&self, key: &str, delta: u64) -> Result<Option<i64>> {
        self.adjust(key, i64::try_from(delta).map_or(i64::MIN, |d| -d)).await
    }

    async fn flush_all(&self) -> Result<()> {
        self.cache.invalidate_all();
        Ok(())
    }
}
