use thiserror::Error;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Errors surfaced by the cache engine.
///
/// An uncacheable query is not an error; see [`Plan`](crate::query::Plan). Index keys containing a null value are
/// skipped silently and never produce an error either.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Retries were exhausted while contending for a key's lock.
    #[error("couldn't acquire cache lock for '{key}' after {attempts} attempt(s)")]
    LockUnavailable { key: String, attempts: u32 },

    /// Transport-level failure reported by a [`KeyValueBackend`](crate::traits::KeyValueBackend) implementation.
    #[error("cache backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("value stored under '{key}' is not {expected}")]
    UnexpectedValue { key: String, expected: &'static str },

    #[error("invalid index declaration on {attributes:?}: {reason}")]
    InvalidIndex { attributes: Vec<String>, reason: String },

    #[error("record has no value for primary key attribute '{0}'")]
    MissingPrimaryKey(String),

    /// The host's fallback query failed.
    #[error("fallback query failed: {0}")]
    Fallback(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("cache value codec error: {0}")]
    Codec(#[from] postcard::Error),
}

impl CacheError {
    pub fn fallback<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Fallback(Box::new(err))
    }

    pub(crate) fn invalid_index<S: ToString>(attributes: &[String], reason: S) -> Self {
        Self::InvalidIndex {
            attributes: attributes.to_vec(),
            reason:     reason.to_string(),
        }
    }

    #[inline]
    pub fn is_lock_unavailable(&self) -> bool {
        matches!(self, Self::LockUnavailable { .. })
    }
}
