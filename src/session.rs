//! One logical unit of work against the cache.
//!
//! A [`CacheSession`] owns the backend handle, the lock owner identity and the stack of transaction scopes. Outside of
//! a transaction every call goes straight to the backend. Inside one, writes are shadowed locally and logged; only the
//! outermost commit replays them, under locks taken in sorted key order.
//!
//! [`CacheSession::cache_locally`] additionally memoizes backend reads for the duration of a unit of work, keeping the
//! memo in sync with the session's own writes.
//!
//! ```ignore
//! session
//!     .transaction(async {
//!         session.set("a", CacheValue::Integer(1), None).await?;
//!         session.transaction(async { session.incr("n", 1).await }).await?;
//!         Ok(())
//!     })
//!     .await?;
//! ```

use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fieldx::fxstruct;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use crate::buffered::BufferLayer;
use crate::buffered::Command;
use crate::config::LockOptions;
use crate::error::Result;
use crate::lock::DistributedLock;
use crate::traits::KeyValueBackend;
use crate::types::CacheValue;

#[fxstruct(sync, no_new, default(off))]
pub struct CacheSession {
    #[fieldx(get)]
    backend: Arc<dyn KeyValueBackend>,

    #[fieldx(get)]
    lock: DistributedLock,

    #[fieldx(lock, private, reader, writer)]
    scopes: Vec<BufferLayer>,

    // Backend values seen or written by the current `cache_locally` unit. `None` entries are known misses.
    #[fieldx(lock, optional, private, reader, writer, clearer, predicate)]
    local: HashMap<String, Option<CacheValue>>,
}

impl CacheSession {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self::with_lock_options(backend, LockOptions::default())
    }

    pub fn with_lock_options(backend: Arc<dyn KeyValueBackend>, options: LockOptions) -> Self {
        let lock = DistributedLock::new(Arc::clone(&backend), options);
        Self::with_lock(backend, lock)
    }

    /// Use an explicit lock owner. Sessions sharing a token are reentrant to each other's locks.
    pub fn with_lock(backend: Arc<dyn KeyValueBackend>, lock: DistributedLock) -> Self {
        Self {
            backend,
            lock,
            scopes: Default::default(),
            local: Default::default(),
        }
    }

    /// Number of open transaction scopes.
    pub fn depth(&self) -> usize {
        self.read_scopes().len()
    }

    #[inline]
    pub fn in_transaction(&self) -> bool {
        self.depth() > 0
    }

    pub fn begin_transaction(&self) {
        let mut scopes = self.write_scopes();
        scopes.push(BufferLayer::default());
        trace!("transaction scope {} opened", scopes.len());
    }

    /// Close the innermost scope. A nested scope hands its writes to the parent; the outermost one flushes them to the
    /// backend. Committing with no open scope does nothing.
    #[instrument(level = "trace", skip(self))]
    pub async fn commit(&self) -> Result<()> {
        let outermost = {
            let mut scopes = self.write_scopes();
            let Some(layer) = scopes.pop()
            else {
                return Ok(());
            };
            match scopes.last_mut() {
                Some(parent) => {
                    layer.merge_into(parent);
                    None
                }
                None => Some(layer),
            }
        };

        match outermost {
            Some(layer) => {
                let written = layer.written_keys();
                let outcome = layer.flush(self.backend.as_ref(), &self.lock).await;
                // Whatever the outcome, the backend state of replayed keys is no longer known.
                self.forget(&written);
                outcome
            }
            None => Ok(()),
        }
    }

    /// Discard the innermost scope. Enclosing scopes are not affected.
    pub fn rollback(&self) {
        if self.write_scopes().pop().is_some() {
            debug!("transaction scope rolled back");
        }
    }

    /// Run `unit` inside a new scope: commit when it returns `Ok`, roll back when it returns an error. A future dropped
    /// before completion discards its scope as well.
    ///
    /// `unit` is not polled until the scope is open, so it may freely borrow the session.
    pub async fn transaction<T, Fut>(&self, unit: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.begin_transaction();
        let mut scope = ScopeGuard {
            session: self,
            depth:   self.depth(),
            armed:   true,
        };

        let outcome = unit.await;
        scope.armed = false;

        match outcome {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    /// Run `unit` with backend reads memoized: a key is fetched at most once, and the session's own writes update the
    /// memo instead of invalidating it. The memo is discarded when `unit` completes or is dropped. Nested calls share
    /// the outermost memo.
    pub async fn cache_locally<T, Fut>(&self, unit: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        if self.has_local() {
            return unit.await;
        }
        *self.write_local() = Some(HashMap::new());
        let _local = LocalGuard { session: self };
        unit.await
    }

    #[inline]
    pub fn is_caching_locally(&self) -> bool {
        self.has_local()
    }

    fn remember(&self, key: &str, value: Option<CacheValue>) {
        if let Some(local) = self.write_local().as_mut() {
            local.insert(key.to_string(), value);
        }
    }

    fn forget<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if let Some(local) = self.write_local().as_mut() {
            for key in keys {
                local.remove(key.as_ref());
            }
        }
    }

    async fn fetch(&self, key: &str) -> Result<Option<CacheValue>> {
        let known = self.read_local().as_ref().and_then(|local| local.get(key).cloned());
        if let Some(value) = known {
            return Ok(value);
        }
        let value = self.backend.get(key).await?;
        self.remember(key, value.clone());
        Ok(value)
    }

    async fn fetch_multi(&self, keys: &[String]) -> Result<HashMap<String, CacheValue>> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut remote = Vec::new();
        {
            let local = self.read_local();
            for key in keys {
                match local.as_ref().and_then(|local| local.get(key)) {
                    Some(Some(value)) => {
                        found.insert(key.clone(), value.clone());
                    }
                    Some(None) => (),
                    None => remote.push(key.clone()),
                }
            }
        }

        if !remote.is_empty() {
            let fetched = self.backend.get_multi(&remote).await?;
            for key in &remote {
                self.remember(key, fetched.get(key).cloned());
            }
            found.extend(fetched);
        }
        Ok(found)
    }

    fn shadowed(&self, key: &str) -> Option<Option<CacheValue>> {
        self.read_scopes()
            .iter()
            .rev()
            .find_map(|layer| layer.lookup(key).cloned())
    }

    // Backend reads are remembered by the outermost scope so that every nested scope sees them.
    fn memoize(&self, key: &str, value: Option<CacheValue>) {
        let mut scopes = self.write_scopes();
        if scopes.iter().any(|layer| layer.lookup(key).is_some()) {
            return;
        }
        if let Some(outermost) = scopes.first_mut() {
            outermost.memoize(key, value);
        }
    }

    fn record(&self, key: &str, shadow: Option<CacheValue>, command: Command) {
        if let Some(top) = self.write_scopes().last_mut() {
            top.record(key, shadow, command);
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        if let Some(value) = self.shadowed(key) {
            return Ok(value);
        }
        let value = self.fetch(key).await?;
        self.memoize(key, value.clone());
        Ok(value)
    }

    /// Shadowed keys are answered locally; only the rest is requested from the backend, each distinct key once.
    pub async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, CacheValue>> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut remote = Vec::new();
        {
            let scopes = self.read_scopes();
            let mut seen = HashSet::new();
            for key in keys {
                if !seen.insert(key.as_str()) {
                    continue;
                }
                match scopes.iter().rev().find_map(|layer| layer.lookup(key)) {
                    Some(Some(value)) => {
                        found.insert(key.clone(), value.clone());
                    }
                    Some(None) => (),
                    None => remote.push(key.clone()),
                }
            }
        }

        if !remote.is_empty() {
            let fetched = self.fetch_multi(&remote).await?;
            for key in &remote {
                self.memoize(key, fetched.get(key).cloned());
            }
            found.extend(fetched);
        }
        Ok(found)
    }

    pub async fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> Result<()> {
        if !self.in_transaction() {
            self.backend.set(key, value.clone(), ttl).await?;
            self.remember(key, Some(value));
            return Ok(());
        }
        self.record(
            key,
            Some(value.clone()),
            Command::Set {
                key: key.to_string(),
                value,
                ttl,
            },
        );
        Ok(())
    }

    /// Store only if no value is visible for `key`. Inside a transaction the check runs against the shadowed view.
    pub async fn add(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> Result<bool> {
        if !self.in_transaction() {
            let added = self.backend.add(key, value.clone(), ttl).await?;
            if added {
                self.remember(key, Some(value));
            }
            else {
                self.forget([key]);
            }
            return Ok(added);
        }
        if self.get(key).await?.is_some() {
            return Ok(false);
        }
        self.record(
            key,
            Some(value.clone()),
            Command::Add {
                key: key.to_string(),
                value,
                ttl,
            },
        );
        Ok(true)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        if !self.in_transaction() {
            self.backend.delete(key).await?;
            self.remember(key, None);
            return Ok(());
        }
        self.record(key, None, Command::Delete { key: key.to_string() });
        Ok(())
    }

    pub async fn incr(&self, key: &str, delta: u64) -> Result<Option<i64>> {
        if !self.in_transaction() {
            let next = self.backend.incr(key, delta).await?;
            self.remember(key, next.map(CacheValue::Integer));
            return Ok(next);
        }
        self.adjust(key, i64::try_from(delta).unwrap_or(i64::MAX), Command::Incr {
            key: key.to_string(),
            delta,
        })
        .await
    }

    pub async fn decr(&self, key: &str, delta: u64) -> Result<Option<i64>> {
        if !self.in_transaction() {
            let next = self.backend.decr(key, delta).await?;
            self.remember(key, next.map(CacheValue::Integer));
            return Ok(next);
        }
        self.adjust(key, i64::try_from(delta).map_or(i64::MIN, |d| -d), Command::Decr {
            key: key.to_string(),
            delta,
        })
        .await
    }

    // The shadow holds the value the counter will have once the log is replayed over what the backend had.
    async fn adjust(&self, key: &str, delta: i64, command: Command) -> Result<Option<i64>> {
        let Some(current) = self.get(key).await?
        else {
            return Ok(None);
        };
        let next = current.expect_integer(key)?.saturating_add(delta).max(0);
        self.record(key, Some(CacheValue::Integer(next)), command);
        Ok(Some(next))
    }
}

impl std::fmt::Debug for CacheSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSession")
            .field("lock", &self.lock)
            .field("depth", &self.depth())
            .field("caching_locally", &self.has_local())
            .finish()
    }
}

struct ScopeGuard<'a> {
    session: &'a CacheSession,
    depth:   usize,
    armed:   bool,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("transaction future dropped, discarding scope {}", self.depth);
            self.session.write_scopes().truncate(self.depth.saturating_sub(1));
        }
    }
}

struct LocalGuard<'a> {
    session: &'a CacheSession,
}

impl Drop for LocalGuard<'_> {
    fn drop(&mut self) {
        if let Some(local) = self.session.clear_local() {
            trace!("local cache dropped with {} key(s)", local.len());
        }
    }
}
