//! Namespaced view of a [`CacheSession`] with read-through helpers.
//!
//! Keys passed to an [`Accessor`] are logical; every backend key is `<namespace>[:<version>]/<key>`. Fallbacks are
//! host closures computing the authoritative value on a miss; whatever they return is stored with `add`, so a value
//! written concurrently by someone else is never overwritten by a read.

use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use fieldx::fxstruct;
use tracing::trace;
use tracing::warn;

use crate::config::CacheConfig;
use crate::error::Result;
use crate::key;
use crate::session::CacheSession;
use crate::types::CacheValue;

#[derive(Clone, Debug, PartialEq, Eq)]
#[fxstruct(no_new, default(off))]
pub struct Accessor {
    #[fieldx(get)]
    namespace: String,

    #[fieldx(get(copy))]
    version: u32,
}

impl Accessor {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_namespace(config.namespace(), config.version())
    }

    pub fn with_namespace(namespace: impl Into<String>, version: u32) -> Self {
        Self {
            namespace: namespace.into(),
            version,
        }
    }

    pub fn cache_key(&self, key: &str) -> String {
        key::namespaced(&self.namespace, self.version, key)
    }

    pub async fn get(&self, session: &CacheSession, key: &str) -> Result<Option<CacheValue>> {
        session.get(&self.cache_key(key)).await
    }

    /// Read `key`, computing and storing it with `fallback` on a miss.
    pub async fn get_or_insert_with<F, Fut>(
        &self,
        session: &CacheSession,
        key: &str,
        ttl: Option<Duration>,
        fallback: F,
    ) -> Result<CacheValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheValue>>,
    {
        let cache_key = self.cache_key(key);
        if let Some(value) = session.get(&cache_key).await? {
            return Ok(value);
        }
        let value = fallback().await?;
        if !session.add(&cache_key, value.clone(), ttl).await? {
            trace!("'{cache_key}' was populated concurrently");
        }
        Ok(value)
    }

    /// Multi-get without a fallback. Misses are reported as `None`, one entry per requested key.
    pub async fn get_multi(&self, session: &CacheSession, keys: &[String]) -> Result<Vec<(String, Option<CacheValue>)>> {
        self.get_multi_with(session, keys, None, |_| async { Ok(HashMap::new()) })
            .await
    }

    /// Multi-get with backfill. `fallback` is called at most once, with the distinct logical keys that missed, in
    /// request order; it returns whatever of them it can resolve. The result has one entry per requested key, in
    /// request order, duplicates included.
    pub async fn get_multi_with<F, Fut>(
        &self,
        session: &CacheSession,
        keys: &[String],
        ttl: Option<Duration>,
        fallback: F,
    ) -> Result<Vec<(String, Option<CacheValue>)>>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<HashMap<String, CacheValue>>>,
    {
        let cache_keys = keys.iter().map(|k| self.cache_key(k)).collect::<Vec<_>>();
        let mut found = session.get_multi(&cache_keys).await?;

        let mut seen = HashSet::new();
        let missing = keys
            .iter()
            .zip(&cache_keys)
            .filter(|(_, cache_key)| !found.contains_key(*cache_key))
            .filter(|(key, _)| seen.insert(key.as_str()))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        if !missing.is_empty() {
            trace!("multi-get missed {} of {} key(s)", missing.len(), keys.len());
            for (key, value) in fallback(missing).await? {
                let cache_key = self.cache_key(&key);
                session.add(&cache_key, value.clone(), ttl).await?;
                found.insert(cache_key, value);
            }
        }

        Ok(keys
            .iter()
            .zip(&cache_keys)
            .map(|(key, cache_key)| (key.clone(), found.get(cache_key).cloned()))
            .collect())
    }

    pub async fn set(&self, session: &CacheSession, key: &str, value: CacheValue, ttl: Option<Duration>) -> Result<()> {
        session.set(&self.cache_key(key), value, ttl).await
    }

    pub async fn add(&self, session: &CacheSession, key: &str, value: CacheValue, ttl: Option<Duration>) -> Result<bool> {
        session.add(&self.cache_key(key), value, ttl).await
    }

    pub async fn expire(&self, session: &CacheSession, key: &str) -> Result<()> {
        session.delete(&self.cache_key(key)).await
    }

    /// Increment the counter at `key`. A missing counter is seeded with the result of `init`, which must already
    /// account for this increment.
    pub async fn incr<F, Fut>(
        &self,
        session: &CacheSession,
        key: &str,
        delta: u64,
        ttl: Option<Duration>,
        init: F,
    ) -> Result<i64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<i64>>,
    {
        self.adjust(session, key, delta, true, ttl, init).await
    }

    /// Decrement the counter at `key`, never below zero. A missing counter is seeded with the result of `init`, which
    /// must already account for this decrement.
    pub async fn decr<F, Fut>(
        &self,
        session: &CacheSession,
        key: &str,
        delta: u64,
        ttl: Option<Duration>,
        init: F,
    ) -> Result<i64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<i64>>,
    {
        self.adjust(session, key, delta, false, ttl, init).await
    }

    async fn adjust<F, Fut>(
        &self,
        session: &CacheSession,
        key: &str,
        delta: u64,
        up: bool,
        ttl: Option<Duration>,
        init: F,
    ) -> Result<i64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<i64>>,
    {
        let cache_key = self.cache_key(key);
        if let Some(value) = step(session, &cache_key, delta, up).await? {
            return Ok(value);
        }

        let seed = init().await?.max(0);
        if session.add(&cache_key, CacheValue::Integer(seed), ttl).await? {
            return Ok(seed);
        }

        // Someone seeded the counter in the meantime; apply the delta on top of theirs.
        match step(session, &cache_key, delta, up).await? {
            Some(value) => Ok(value),
            None => {
                warn!("counter '{cache_key}' vanished while being seeded");
                Ok(seed)
            }
        }
    }
}

async fn step(session: &CacheSession, cache_key: &str, delta: u64, up: bool) -> Result<Option<i64>> {
    if up {
        session.incr(cache_key, delta).await
    }
    else {
        session.decr(cache_key, delta).await
    }
}
