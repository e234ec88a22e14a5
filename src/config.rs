use std::time::Duration;

use fieldx::fxstruct;

/// Parameters of [`DistributedLock`](crate::lock::DistributedLock) acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockOptions {
    /// How long the backend keeps a lock entry before it expires on its own.
    pub expiry:  Duration,
    /// Number of `add` attempts before giving up.
    pub retries: u32,
    /// Sleep after the first failed attempt; doubled after every subsequent one.
    pub backoff: Duration,
}

impl LockOptions {
    pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);
    pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(30);
    pub const DEFAULT_RETRIES: u32 = 5;

    /// Sleep duration following the failed attempt number `attempt` (zero-based).
    #[inline]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            expiry:  Self::DEFAULT_EXPIRY,
            retries: Self::DEFAULT_RETRIES,
            backoff: Self::DEFAULT_BACKOFF,
        }
    }
}

/// Per-entity-type cache configuration.
///
/// ```ignore
/// let config = CacheConfig::builder()
///     .namespace("Story")
///     .version(2)
///     .ttl(Duration::from_secs(3600))
///     .build()?;
/// ```
#[derive(Clone, Debug)]
#[fxstruct(sync, no_new, builder, get(copy))]
pub struct CacheConfig {
    /// Host entity type name, the first segment of every cache key.
    #[fieldx(get(copy(off)), builder(into))]
    namespace: String,

    /// Bumping the version invalidates everything cached under the previous one. `0` omits the version segment.
    #[fieldx(default(0))]
    version: u32,

    /// Name of the primary-key attribute.
    #[fieldx(get(copy(off)), builder(into), default("id".to_string()))]
    primary_key: String,

    /// Default time-to-live of index entries.
    #[fieldx(default(Duration::from_secs(24 * 60 * 60)))]
    ttl: Duration,

    #[fieldx(default(LockOptions::default()))]
    lock: LockOptions,
}
