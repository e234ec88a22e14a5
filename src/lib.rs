//! # wt-cache
//!
//! Write-through, read-through secondary index cache over a memcached-like key-value store.
//!
//! Think of it as a layer between the data-access code and the database that answers equality lookups from cached
//! lists of record references, keeping them in sync with every create, update and delete.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - Record-based storage with a primary key; e.g., database tables.
//! - Lookups by equality on a few attribute combinations dominate the read load.
//! - A shared cache service that only offers `get`, `set`, `add`, `delete`, `incr`/`decr` and multi-get; no
//!   transactions.
//!
//! The cache operates on the following principles:
//!
//! - It is backend-agnostic: the store is anything implementing [`KeyValueBackend`]. An in-process implementation over
//!   [moka](https://crates.io/crates/moka) is included.
//! - The host declares which attribute sets are indexed. For every value combination of such a set the cache keeps an
//!   ordered list of primary keys, optionally bounded to a window.
//! - The primary-key index keeps full records.
//! - Multi-key updates are atomic from the point of view of other cache users: they are buffered locally and replayed
//!   under distributed locks taken in a global order.
//! - Fully async.
//!
//! # Data Source
//!
//! The cache never talks to the database itself. On a miss it asks the host through the [`DataSource`] trait: which
//! primary keys match a set of conditions, how many rows do, and what are the records behind a list of primary keys.
//!
//! # Sessions and Transactions
//!
//! A [`CacheSession`](session::CacheSession) is created per unit of work. It owns the lock owner identity and a stack
//! of transaction scopes. Inside a transaction every write is shadowed locally, so the unit of work reads its own
//! writes while nobody else sees them. When the outermost scope commits, the keys about to be written are locked in
//! lexicographic order, the buffered commands are replayed in call order, and the locks are released. An error at any
//! depth discards the scope and nothing reaches the backend.
//!
//! # Finders and Write-Through
//!
//! A [`Repository`] per entity type ties the pieces together. Its finders run the query through the
//! [`QueryPlanner`](query::QueryPlanner) and either return cached records or tell the host the query is not cacheable.
//! Its `on_create`, `on_update` and `on_delete` methods are to be called by the host after the durable write went
//! through; each applies the event to every declared index in one transaction.
//!
//! ## Windows
//!
//! An index declared with a `limit` keeps at most `limit + buffer` references. The true number of matching records is
//! tracked in a `<key>/count` shadow counter. When deletions shrink a list below `limit` while the counter says there
//! is more, the list is refetched from the data source.

pub mod accessor;
pub mod backend;
pub(crate) mod buffered;
pub mod config;
pub mod error;
pub mod index;
pub mod key;
pub mod lock;
pub mod query;
pub mod repository;
pub mod session;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use error::CacheError;
#[doc(inline)]
pub use repository::Repository;
#[doc(inline)]
pub use session::CacheSession;
#[doc(inline)]
pub use traits::DataSource;
#[doc(inline)]
pub use traits::KeyValueBackend;

pub mod prelude {
    pub use crate::accessor::Accessor;
    pub use crate::backend::memory::MemoryBackend;
    pub use crate::config::CacheConfig;
    pub use crate::config::LockOptions;
    pub use crate::error::CacheError;
    pub use crate::index::IndexOptions;
    pub use crate::index::IndexSpec;
    pub use crate::key::CacheKey;
    pub use crate::lock::DistributedLock;
    pub use crate::query::Conditions;
    pub use crate::query::Plan;
    pub use crate::query::QueryOptions;
    pub use crate::query::QueryPlanner;
    pub use crate::repository::Repository;
    pub use crate::session::CacheSession;
    pub use crate::traits::DataSource;
    pub use crate::traits::KeyValueBackend;
    pub use crate::types::*;
}
