//! Per-entity-type entry point: finders answered from the cache and write-through of lifecycle events.
//!
//! ```ignore
//! let mut stories = Repository::new(config, Arc::new(table));
//! stories.declare_index(["author_id"], IndexOptions { limit: Some(20), buffer: Some(5), ..Default::default() })?;
//!
//! let session = CacheSession::new(backend);
//! match stories.find(&session, &[&QueryOptions::filter([("author_id", 7)]).with_limit(20)]).await? {
//!     Lookup::Cached(records) => records,
//!     Lookup::Uncacheable(_) => query_the_database().await?,
//! };
//!
//! // After the database write went through:
//! stories.on_create(&session, &record).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use tracing::instrument;

use crate::accessor::Accessor;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::error::Result;
use crate::index::IndexEngine;
use crate::index::IndexOptions;
use crate::index::IndexSpec;
use crate::key::CacheKey;
use crate::query::Calculation;
use crate::query::CachePlan;
use crate::query::Plan;
use crate::query::QueryOptions;
use crate::query::QueryPlanner;
use crate::session::CacheSession;
use crate::traits::DataSource;
use crate::types::AttrValue;
use crate::types::CacheValue;
use crate::types::LifecycleEvent;
use crate::types::Lookup;
use crate::types::Record;

pub struct Repository<DS>
where
    DS: DataSource,
{
    config:   CacheConfig,
    accessor: Accessor,
    // The primary-key index always comes first.
    indices:  Vec<IndexSpec>,
    source:   Arc<DS>,
}

impl<DS> Repository<DS>
where
    DS: DataSource,
{
    pub fn new(config: CacheConfig, source: Arc<DS>) -> Self {
        Self {
            accessor: Accessor::new(&config),
            indices: vec![IndexSpec::primary(&config)],
            config,
            source,
        }
    }

    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[inline]
    pub fn accessor(&self) -> &Accessor {
        &self.accessor
    }

    #[inline]
    pub fn source(&self) -> &Arc<DS> {
        &self.source
    }

    #[inline]
    pub fn indices(&self) -> &[IndexSpec] {
        &self.indices
    }

    /// Declare an index. A declaration over an already indexed attribute set replaces the previous one.
    pub fn declare_index<I, S>(&mut self, attributes: I, options: IndexOptions) -> Result<&IndexSpec>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = IndexSpec::declare(attributes, options, &self.config)?;
        let pos = match self.indices.iter().position(|i| i.attributes() == spec.attributes()) {
            Some(pos) => {
                self.indices[pos] = spec;
                pos
            }
            None => {
                self.indices.push(spec);
                self.indices.len() - 1
            }
        };
        debug!("declared index {:?}", self.indices[pos].attributes());
        Ok(&self.indices[pos])
    }

    pub fn planner(&self) -> QueryPlanner<'_> {
        QueryPlanner::new(&self.indices, self.config.primary_key())
    }

    fn engine<'a>(&'a self, spec: &'a IndexSpec) -> IndexEngine<'a, DS> {
        IndexEngine::new(spec, &self.accessor, self.source.as_ref(), self.config.primary_key())
    }

    fn primary_index(&self) -> &IndexSpec {
        &self.indices[0]
    }

    fn primary_key_for(&self, id: &AttrValue) -> String {
        CacheKey::new([(self.config.primary_key().as_str(), id.clone())]).to_string()
    }

    /// Answer a finder from the cache, reading through on a miss.
    #[instrument(level = "trace", skip_all, fields(namespace = %self.config.namespace()))]
    pub async fn find(&self, session: &CacheSession, options: &[&QueryOptions]) -> Result<Lookup<Vec<Record>>> {
        let plan = match self.planner().plan(options) {
            Plan::Cacheable(plan) => plan,
            Plan::Uncacheable(reason) => {
                debug!("not cached: {reason}");
                return Ok(Lookup::Uncacheable(reason));
            }
        };

        let refs = if plan.index().is_primary() {
            plan.key().pairs().iter().map(|(_, id)| id.clone()).collect()
        }
        else {
            let (refs, _) = self.engine(plan.index()).references(session, plan.key()).await?;
            page(refs, &plan)
        };

        let records = self.find_by_ids(session, &refs).await?;
        Ok(Lookup::Cached(if plan.index().is_primary() {
            page(records, &plan)
        }
        else {
            records
        }))
    }

    /// Records by primary key, in the order of `ids`. Misses are loaded from the data source and cached; ids the data
    /// source doesn't know are skipped.
    pub async fn find_by_ids(&self, session: &CacheSession, ids: &[AttrValue]) -> Result<Vec<Record>> {
        let by_key = ids
            .iter()
            .map(|id| (self.primary_key_for(id), id.clone()))
            .collect::<HashMap<_, _>>();
        let keys = ids.iter().map(|id| self.primary_key_for(id)).collect::<Vec<_>>();
        let ttl = Some(self.primary_index().ttl());

        let entries = self
            .accessor
            .get_multi_with(session, &keys, ttl, |missing| {
                let by_key = &by_key;
                async move {
                    let wanted = missing.iter().filter_map(|k| by_key.get(k).cloned()).collect::<Vec<_>>();
                    let found = self
                        .source
                        .find_by_references(&wanted)
                        .await
                        .map_err(CacheError::fallback)?;
                    Ok(found
                        .into_iter()
                        .filter_map(|record| {
                            let id = record.get(self.config.primary_key())?;
                            Some((self.primary_key_for(id), CacheValue::Records(vec![record])))
                        })
                        .collect())
                }
            })
            .await?;

        let mut records = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if let Some(value) = value {
                records.extend(value.into_records(&key)?);
            }
        }
        Ok(records)
    }

    /// Count of all rows matching the conditions, kept in the index's count shadow.
    #[instrument(level = "trace", skip_all, fields(namespace = %self.config.namespace()))]
    pub async fn count(&self, session: &CacheSession, options: &[&QueryOptions]) -> Result<Lookup<u64>> {
        let plan = match self.planner().plan_calculation(&Calculation::Count(None), options) {
            Plan::Cacheable(plan) => plan,
            Plan::Uncacheable(reason) => {
                debug!("count not cached: {reason}");
                return Ok(Lookup::Uncacheable(reason));
            }
        };

        let key = plan.cache_key();
        let value = self
            .accessor
            .get_or_insert_with(session, &key, Some(plan.index().ttl()), || async {
                let count = self
                    .source
                    .count(plan.key().pairs())
                    .await
                    .map_err(CacheError::fallback)?;
                Ok(CacheValue::Integer(i64::try_from(count).unwrap_or(i64::MAX)))
            })
            .await?;
        Ok(Lookup::Cached(value.expect_integer(&key)?.max(0) as u64))
    }

    #[instrument(level = "trace", skip_all, fields(namespace = %self.config.namespace()))]
    pub async fn on_create(&self, session: &CacheSession, record: &Record) -> Result<()> {
        session
            .transaction(async {
                for spec in &self.indices {
                    self.engine(spec).on_create(session, record).await?;
                }
                Ok(())
            })
            .await
    }

    #[instrument(level = "trace", skip_all, fields(namespace = %self.config.namespace()))]
    pub async fn on_update(&self, session: &CacheSession, old: &Record, new: &Record) -> Result<()> {
        session
            .transaction(async {
                for spec in &self.indices {
                    self.engine(spec).on_update(session, old, new).await?;
                }
                Ok(())
            })
            .await
    }

    #[instrument(level = "trace", skip_all, fields(namespace = %self.config.namespace()))]
    pub async fn on_delete(&self, session: &CacheSession, record: &Record) -> Result<()> {
        session
            .transaction(async {
                for spec in &self.indices {
                    self.engine(spec).on_delete(session, record).await?;
                }
                Ok(())
            })
            .await
    }

    pub async fn on_lifecycle_event(&self, session: &CacheSession, event: &LifecycleEvent) -> Result<()> {
        match event {
            LifecycleEvent::Create(record) => self.on_create(session, record).await,
            LifecycleEvent::Update { old, new } => self.on_update(session, old, new).await,
            LifecycleEvent::Delete(record) => self.on_delete(session, record).await,
        }
    }

    /// Drop every cached list the record belongs to.
    pub async fn expire(&self, session: &CacheSession, record: &Record) -> Result<()> {
        session
            .transaction(async {
                for spec in &self.indices {
                    self.engine(spec).expire(session, record).await?;
                }
                Ok(())
            })
            .await
    }
}

impl<DS> std::fmt::Debug for Repository<DS>
where
    DS: DataSource,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("config", &self.config)
            .field("indices", &self.indices)
            .finish()
    }
}

fn page<T>(items: Vec<T>, plan: &CachePlan) -> Vec<T> {
    items
        .into_iter()
        .skip(plan.offset())
        .take(plan.limit().unwrap_or(usize::MAX))
        .collect()
}
