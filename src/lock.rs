//! Mutual exclusion over a [`KeyValueBackend`] using `add` as the lock primitive.
//!
//! The lock entry for `key` lives under `lock/<key>` and holds the owner's token. Each [`DistributedLock`] is one
//! owner; sharing an instance between concurrent units of work makes them reentrant to each other.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use fieldx::fxstruct;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::config::LockOptions;
use crate::error::CacheError;
use crate::error::Result;
use crate::traits::KeyValueBackend;
use crate::types::CacheValue;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquisition {
    /// The lock entry was created by this call.
    Acquired,
    /// The owner already held the lock; nothing was written and nothing must be released.
    Reentrant,
}

#[fxstruct(sync, no_new, default(off))]
pub struct DistributedLock {
    backend: Arc<dyn KeyValueBackend>,

    #[fieldx(get)]
    token: String,

    #[fieldx(get(copy))]
    options: LockOptions,

    // Keys acquired by this owner and not yet released.
    #[fieldx(lock, private, reader, writer)]
    held: HashSet<String>,
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn KeyValueBackend>, options: LockOptions) -> Self {
        let token = format!("{}:{}", std::process::id(), NEXT_OWNER.fetch_add(1, Ordering::Relaxed));
        Self::with_token(backend, options, token)
    }

    pub fn with_token(backend: Arc<dyn KeyValueBackend>, options: LockOptions, token: impl Into<String>) -> Self {
        Self {
            backend,
            token: token.into(),
            options,
            held: HashSet::new().into(),
        }
    }

    #[inline]
    pub fn lock_key(key: &str) -> String {
        format!("lock/{key}")
    }

    /// Whether this owner acquired `key` and hasn't released it yet.
    pub fn holds(&self, key: &str) -> bool {
        self.read_held().contains(key)
    }

    pub async fn acquire(&self, key: &str) -> Result<Acquisition> {
        self.acquire_with(key, self.options).await
    }

    /// Try `add(lock/<key>, token, expiry)` up to `options.retries` times, sleeping `backoff * 2^attempt` between
    /// attempts. A lock already held by this owner is reported as [`Acquisition::Reentrant`] without a network round
    /// trip.
    #[instrument(level = "trace", skip(self, options), fields(owner = %self.token))]
    pub async fn acquire_with(&self, key: &str, options: LockOptions) -> Result<Acquisition> {
        if self.holds(key) {
            return Ok(Acquisition::Reentrant);
        }

        let lock_key = Self::lock_key(key);
        let token = CacheValue::Text(self.token.clone());
        let attempts = options.retries.max(1);

        for attempt in 0..attempts {
            if self.backend.add(&lock_key, token.clone(), Some(options.expiry)).await? {
                self.write_held().insert(key.to_string());
                return Ok(Acquisition::Acquired);
            }

            // Taken by our own token through some other path, e.g. a previous session with the same identity.
            if self.backend.get(&lock_key).await?.as_ref() == Some(&token) {
                return Ok(Acquisition::Reentrant);
            }

            if attempt + 1 < attempts {
                let pause = options.backoff_for(attempt);
                debug!("lock '{key}' is busy, retrying in {pause:?}");
                tokio::time::sleep(pause).await;
            }
        }

        warn!("giving up on lock '{key}' after {attempts} attempt(s)");
        Err(CacheError::LockUnavailable {
            key: key.to_string(),
            attempts,
        })
    }

    /// Delete the lock entry. Ownership is not verified.
    pub async fn release(&self, key: &str) -> Result<()> {
        self.write_held().remove(key);
        self.backend.delete(&Self::lock_key(key)).await
    }

    pub async fn lock(&self, key: &str) -> Result<LockGuard<'_>> {
        self.lock_with(key, self.options).await
    }

    pub async fn lock_with(&self, key: &str, options: LockOptions) -> Result<LockGuard<'_>> {
        let acquisition = self.acquire_with(key, options).await?;
        Ok(LockGuard {
            lock: self,
            key: key.to_string(),
            acquisition,
            released: false,
        })
    }

    /// Run `f` while holding the lock on `key`. The lock is released whatever `f` returns; the error of `f` takes
    /// precedence over a release failure.
    pub async fn synchronize<F, Fut, T>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.lock(key).await?;
        let outcome = f().await;
        let released = guard.release().await;
        let value = outcome?;
        released?;
        Ok(value)
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("token", &self.token)
            .field("options", &self.options)
            .field("held", &*self.read_held())
            .finish()
    }
}

/// A held lock. Prefer [`LockGuard::release`]; a guard dropped without it (e.g. a cancelled future) schedules the
/// release on the current tokio runtime, or leaves the entry to expire when there is none.
#[must_use = "dropping the guard releases the lock in the background"]
pub struct LockGuard<'a> {
    lock:        &'a DistributedLock,
    key:         String,
    acquisition: Acquisition,
    released:    bool,
}

impl LockGuard<'_> {
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn acquisition(&self) -> Acquisition {
        self.acquisition
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match self.acquisition {
            Acquisition::Acquired => self.lock.release(&self.key).await,
            Acquisition::Reentrant => Ok(()),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released || self.acquisition == Acquisition::Reentrant {
            return;
        }

        self.lock.write_held().remove(&self.key);
        let backend = Arc::clone(&self.lock.backend);
        let lock_key = DistributedLock::lock_key(&self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = backend.delete(&lock_key).await {
                        warn!("background release of '{lock_key}' failed: {err}");
                    }
                });
            }
            Err(_) => warn!("no runtime to release '{lock_key}', leaving it to expire"),
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::test::Call;
    use crate::test::RecordingBackend;

    fn quick() -> LockOptions {
        LockOptions {
            expiry:  Duration::from_secs(5),
            retries: 3,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn synchronize_releases_after_block() {
        let backend: Arc<dyn KeyValueBackend> = Arc::new(MemoryBackend::new());
        let lock = DistributedLock::new(Arc::clone(&backend), quick());

        let seen = lock
            .synchronize("lock_key", || async { backend.get("lock/lock_key").await })
            .await
            .unwrap();
        assert_eq!(seen, Some(CacheValue::Text(lock.token().to_string())));
        assert_eq!(backend.get("lock/lock_key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn synchronize_releases_on_error() {
        let backend: Arc<dyn KeyValueBackend> = Arc::new(MemoryBackend::new());
        let lock = DistributedLock::new(Arc::clone(&backend), quick());

        let outcome: Result<()> = lock
            .synchronize("lock_key", || async { Err(CacheError::BackendUnavailable("boom".into())) })
            .await;
        assert!(matches!(outcome, Err(CacheError::BackendUnavailable(_))));
        assert_eq!(backend.get("lock/lock_key").await.unwrap(), None);
        assert!(!lock.holds("lock_key"));
    }

    #[tokio::test]
    async fn reentrant_acquisition_skips_network() {
        let backend = Arc::new(RecordingBackend::new(MemoryBackend::new()));
        let lock = DistributedLock::new(backend.clone(), quick());

        assert_eq!(lock.acquire("k").await.unwrap(), Acquisition::Acquired);
        assert_eq!(lock.acquire("k").await.unwrap(), Acquisition::Reentrant);
        assert_eq!(backend.count(|c| matches!(c, Call::Add(_))), 1);

        let nested = lock
            .synchronize("k", || async { lock.synchronize("k", || async { Ok(42) }).await })
            .await
            .unwrap();
        assert_eq!(nested, 42);
        assert_eq!(backend.count(|c| matches!(c, Call::Add(_))), 1);
    }

    #[tokio::test]
    async fn shared_token_is_reentrant() {
        let backend: Arc<dyn KeyValueBackend> = Arc::new(MemoryBackend::new());
        let first = DistributedLock::with_token(Arc::clone(&backend), quick(), "worker-1");
        let second = DistributedLock::with_token(Arc::clone(&backend), quick(), "worker-1");

        assert_eq!(first.acquire("k").await.unwrap(), Acquisition::Acquired);
        assert_eq!(second.acquire("k").await.unwrap(), Acquisition::Reentrant);
        // The second instance doesn't own the entry it didn't create.
        assert!(!second.holds("k"));
        assert_eq!(
            backend.get("lock/k").await.unwrap(),
            Some(CacheValue::Text("worker-1".to_string()))
        );

        let stranger = DistributedLock::with_token(Arc::clone(&backend), quick(), "worker-2");
        assert!(stranger.acquire("k").await.unwrap_err().is_lock_unavailable());
    }

    #[tokio::test]
    async fn contention_between_owners() {
        let backend: Arc<dyn KeyValueBackend> = Arc::new(MemoryBackend::new());
        let first = DistributedLock::new(Arc::clone(&backend), quick());
        let second = DistributedLock::new(Arc::clone(&backend), quick());

        let (a, b) = tokio::join!(first.acquire("k"), second.acquire("k"));
        let winners = [&a, &b].iter().filter(|r| matches!(r, Ok(Acquisition::Acquired))).count();
        assert_eq!(winners, 1);

        let (winner, loser) = if a.is_ok() { (&first, &second) } else { (&second, &first) };
        let err = loser.acquire("k").await.unwrap_err();
        assert!(err.is_lock_unavailable());

        winner.release("k").await.unwrap();
        assert_eq!(loser.acquire("k").await.unwrap(), Acquisition::Acquired);
    }

    #[tokio::test]
    async fn waits_for_release() {
        let backend: Arc<dyn KeyValueBackend> = Arc::new(MemoryBackend::new());
        let holder = Arc::new(DistributedLock::new(Arc::clone(&backend), quick()));
        let waiter = DistributedLock::new(
            Arc::clone(&backend),
            LockOptions {
                retries: 10,
                backoff: Duration::from_millis(2),
                ..quick()
            },
        );

        holder.acquire("k").await.unwrap();
        let releaser = {
            let holder = Arc::clone(&holder);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                holder.release("k").await
            })
        };

        assert_eq!(waiter.acquire("k").await.unwrap(), Acquisition::Acquired);
        releaser.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropped_guard_releases_in_background() {
        let backend: Arc<dyn KeyValueBackend> = Arc::new(MemoryBackend::new());
        let lock = DistributedLock::new(Arc::clone(&backend), quick());

        drop(lock.lock("k").await.unwrap());
        assert!(!lock.holds("k"));
        for _ in 0..50 {
            if backend.get("lock/k").await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("lock entry was not released");
    }
}
