//! Index declarations and their write-through maintenance.
//!
//! An [`IndexSpec`] names a set of attributes. For every combination of values of those attributes the cache keeps a
//! list under the [`CacheKey`] built from them: full records for the primary-key index, primary-key references sorted
//! by the index order for all the others. A windowed index (one with a `limit`) keeps at most `limit + buffer`
//! references plus a `<key>/count` shadow counter with the true number of matching records.

use std::collections::BTreeSet;
use std::time::Duration;

use fieldx::fxstruct;
use tracing::instrument;
use tracing::trace;

use crate::accessor::Accessor;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::error::Result;
use crate::key::CacheKey;
use crate::query::SortOrder;
use crate::session::CacheSession;
use crate::traits::DataSource;
use crate::types::AttrValue;
use crate::types::CacheValue;
use crate::types::Order;
use crate::types::Record;

/// Options of an index declaration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexOptions {
    pub order:  Order,
    /// Defaults to the [`CacheConfig`] TTL.
    pub ttl:    Option<Duration>,
    /// Max number of references a query may page through.
    pub limit:  Option<usize>,
    /// Slack kept beyond `limit` to absorb deletions without a refetch. Requires `limit`.
    pub buffer: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[fxstruct(no_new, default(off))]
pub struct IndexSpec {
    /// Sorted by name.
    #[fieldx(get)]
    attributes: Vec<String>,

    #[fieldx(get(copy))]
    order: Order,

    #[fieldx(get(copy))]
    ttl: Duration,

    #[fieldx(get(copy))]
    limit: Option<usize>,

    #[fieldx(get(copy))]
    buffer: usize,

    #[fieldx(get(copy))]
    is_primary: bool,
}

impl IndexSpec {
    /// Validate a declaration. The set `[primary_key]` declares the primary-key index itself.
    pub fn declare<I, S>(attributes: I, options: IndexOptions, config: &CacheConfig) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut attributes = attributes.into_iter().map(Into::into).collect::<Vec<String>>();
        attributes.sort();

        if attributes.is_empty() {
            return Err(CacheError::invalid_index(&attributes, "no attributes"));
        }
        if attributes.len() != attributes.iter().collect::<BTreeSet<_>>().len() {
            return Err(CacheError::invalid_index(&attributes, "duplicate attributes"));
        }
        if options.buffer.is_some() && options.limit.is_none() {
            return Err(CacheError::invalid_index(&attributes, "buffer requires a limit"));
        }
        if options.limit == Some(0) {
            return Err(CacheError::invalid_index(&attributes, "limit must be positive"));
        }

        let is_primary = attributes.len() == 1 && attributes[0] == *config.primary_key();
        if is_primary && options.limit.is_some() {
            return Err(CacheError::invalid_index(&attributes, "the primary key index can't be windowed"));
        }

        Ok(Self {
            attributes,
            order: options.order,
            ttl: options.ttl.unwrap_or(config.ttl()),
            limit: options.limit,
            buffer: options.buffer.unwrap_or(0),
            is_primary,
        })
    }

    pub fn primary(config: &CacheConfig) -> Self {
        Self {
            attributes: vec![config.primary_key().clone()],
            order:      Order::Ascending,
            ttl:        config.ttl(),
            limit:      None,
            buffer:     0,
            is_primary: true,
        }
    }

    /// `limit + buffer` for a windowed index, unbounded otherwise.
    #[inline]
    pub fn window(&self) -> Option<usize> {
        self.limit.map(|limit| limit.saturating_add(self.buffer))
    }

    /// Whether the key's attribute set is exactly this index's.
    pub fn covers(&self, key: &CacheKey) -> bool {
        key.attributes().eq(self.attributes.iter().map(String::as_str))
    }

    /// Whether a query with the given order and paging can be answered from this index's list.
    pub fn matches(&self, order: &SortOrder, primary_key: &str, limit: Option<usize>, offset: usize) -> bool {
        if order.column != primary_key || order.direction != self.order {
            return false;
        }
        match self.limit {
            None => true,
            Some(window_limit) => limit
                .and_then(|limit| limit.checked_add(offset))
                .is_some_and(|end| end <= window_limit),
        }
    }

    /// The key of the list `record` belongs to. Absent attributes are null.
    pub fn key_for(&self, record: &Record) -> CacheKey {
        CacheKey::new(
            self.attributes
                .iter()
                .map(|name| (name.as_str(), record.get(name).cloned().unwrap_or_default())),
        )
    }
}

/// Applies lifecycle events of one entity type to one index.
pub struct IndexEngine<'a, DS> {
    spec:        &'a IndexSpec,
    accessor:    &'a Accessor,
    source:      &'a DS,
    primary_key: &'a str,
}

impl<'a, DS> IndexEngine<'a, DS>
where
    DS: DataSource,
{
    pub fn new(spec: &'a IndexSpec, accessor: &'a Accessor, source: &'a DS, primary_key: &'a str) -> Self {
        Self {
            spec,
            accessor,
            source,
            primary_key,
        }
    }

    #[inline]
    pub fn spec(&self) -> &IndexSpec {
        self.spec
    }

    #[inline]
    fn ttl(&self) -> Option<Duration> {
        Some(self.spec.ttl)
    }

    fn reference(&self, record: &Record) -> Result<AttrValue> {
        match record.get(self.primary_key) {
            Some(id) if !id.is_null() => Ok(id.clone()),
            _ => Err(CacheError::MissingPrimaryKey(self.primary_key.to_string())),
        }
    }

    #[instrument(level = "trace", skip_all, fields(index = ?self.spec.attributes))]
    pub async fn on_create(&self, session: &CacheSession, record: &Record) -> Result<()> {
        let key = self.spec.key_for(record);
        if self.spec.is_primary {
            self.store_record(session, &key, record).await
        }
        else {
            self.insert(session, &key, record, true).await
        }
    }

    /// Moves the record between lists when the indexed attributes changed; otherwise refreshes it in place.
    #[instrument(level = "trace", skip_all, fields(index = ?self.spec.attributes))]
    pub async fn on_update(&self, session: &CacheSession, old: &Record, new: &Record) -> Result<()> {
        let old_key = self.spec.key_for(old);
        let new_key = self.spec.key_for(new);

        if old_key != new_key {
            trace!("index is stale: {old_key} -> {new_key}");
            if self.spec.is_primary {
                self.clear_record(session, &old_key).await?;
                self.store_record(session, &new_key, new).await
            }
            else {
                self.remove(session, &old_key, old).await?;
                self.insert(session, &new_key, new, true).await
            }
        }
        else if self.spec.is_primary {
            self.store_record(session, &new_key, new).await
        }
        else {
            self.insert(session, &new_key, new, false).await
        }
    }

    #[instrument(level = "trace", skip_all, fields(index = ?self.spec.attributes))]
    pub async fn on_delete(&self, session: &CacheSession, record: &Record) -> Result<()> {
        let key = self.spec.key_for(record);
        if self.spec.is_primary {
            self.clear_record(session, &key).await
        }
        else {
            self.remove(session, &key, record).await
        }
    }

    /// Drop the list the record belongs to.
    pub async fn expire(&self, session: &CacheSession, record: &Record) -> Result<()> {
        let key = self.spec.key_for(record);
        if key.is_writable() {
            self.accessor.expire(session, &key.to_string()).await?;
        }
        Ok(())
    }

    /// The reference list under `key`, read through from the data source on a miss. The second element tells whether
    /// it was a cache hit.
    pub async fn references(&self, session: &CacheSession, key: &CacheKey) -> Result<(Vec<AttrValue>, bool)> {
        let name = key.to_string();
        if let Some(value) = self.accessor.get(session, &name).await? {
            return Ok((value.into_references(&name)?, true));
        }
        let refs = self.fetch_references(key).await?;
        self.accessor
            .add(session, &name, CacheValue::References(refs.clone()), self.ttl())
            .await?;
        Ok((refs, false))
    }

    async fn fetch_references(&self, key: &CacheKey) -> Result<Vec<AttrValue>> {
        self.source
            .find_references(key.pairs(), self.spec.order, self.spec.window())
            .await
            .map_err(CacheError::fallback)
    }

    async fn count(&self, key: &CacheKey) -> Result<i64> {
        let count = self.source.count(key.pairs()).await.map_err(CacheError::fallback)?;
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn store_record(&self, session: &CacheSession, key: &CacheKey, record: &Record) -> Result<()> {
        self.reference(record)?;
        self.accessor
            .set(
                session,
                &key.to_string(),
                CacheValue::Records(vec![record.clone()]),
                self.ttl(),
            )
            .await
    }

    async fn clear_record(&self, session: &CacheSession, key: &CacheKey) -> Result<()> {
        if !key.is_writable() {
            return Err(CacheError::MissingPrimaryKey(self.primary_key.to_string()));
        }
        self.accessor
            .set(session, &key.to_string(), CacheValue::Records(Vec::new()), self.ttl())
            .await
    }

    async fn insert(&self, session: &CacheSession, key: &CacheKey, record: &Record, overwrite: bool) -> Result<()> {
        if !key.is_writable() {
            trace!("not maintaining '{key}': null value");
            return Ok(());
        }
        let reference = self.reference(record)?;
        let (mut refs, _) = self.references(session, key).await?;

        // Without overwrite the record is already accounted for: either it's in the list we just read, or it fell out
        // of the window.
        if !overwrite {
            return Ok(());
        }

        refs.push(reference);
        self.spec.order.sort(&mut refs);
        refs.dedup();
        if let Some(window) = self.spec.window() {
            refs.truncate(window);
        }
        self.accessor
            .set(session, &key.to_string(), CacheValue::References(refs), self.ttl())
            .await?;

        self.accessor
            .incr(session, &key.count_key(), 1, self.ttl(), || self.count(key))
            .await?;
        Ok(())
    }

    async fn remove(&self, session: &CacheSession, key: &CacheKey, record: &Record) -> Result<()> {
        if !key.is_writable() {
            trace!("not maintaining '{key}': null value");
            return Ok(());
        }
        let reference = self.reference(record)?;
        let (mut refs, _) = self.references(session, key).await?;
        refs.retain(|r| *r != reference);

        let count = self
            .accessor
            .decr(session, &key.count_key(), 1, self.ttl(), || self.count(key))
            .await?;

        if let Some(limit) = self.spec.limit {
            let len = refs.len();
            if len < limit && i64::try_from(len).unwrap_or(i64::MAX) < count {
                trace!("refilling '{key}': {len} cached of {count}");
                refs = self.fetch_references(key).await?;
            }
        }

        self.accessor
            .set(session, &key.to_string(), CacheValue::References(refs), self.ttl())
            .await
    }
}

impl<DS> std::fmt::Debug for IndexEngine<'_, DS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexEngine")
            .field("spec", self.spec)
            .field("accessor", self.accessor)
            .finish()
    }
}
