use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::traits::DataSource;
use crate::types::AttrValue;
use crate::types::Order;
use crate::types::Record;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("table is offline")]
    Offline,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableCall {
    FindReferences {
        conditions: Vec<(String, AttrValue)>,
        order:      Order,
        limit:      Option<usize>,
    },
    Count(Vec<(String, AttrValue)>),
    FindByReferences(Vec<AttrValue>),
}

/// A table of records keyed by primary key, answering the host queries the cache falls back to.
#[derive(Debug)]
pub struct MemoryTable {
    primary_key: String,
    rows:        Mutex<BTreeMap<AttrValue, Record>>,
    calls:       Mutex<Vec<TableCall>>,
    offline:     AtomicBool,
}

impl MemoryTable {
    pub fn new(primary_key: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
            rows:        Mutex::new(BTreeMap::new()),
            calls:       Mutex::new(Vec::new()),
            offline:     AtomicBool::new(false),
        }
    }

    fn pk_of(&self, record: &Record) -> AttrValue {
        record.get(&self.primary_key).cloned().unwrap_or_default()
    }

    /// Store the record, replacing any row with the same primary key. Returns what was stored.
    pub fn insert(&self, record: Record) -> Record {
        self.rows.lock().insert(self.pk_of(&record), record.clone());
        record
    }

    /// Apply `changes` over the row with primary key `id` and return the `(old, new)` snapshots.
    pub fn update(&self, id: impl Into<AttrValue>, changes: Record) -> Option<(Record, Record)> {
        let mut rows = self.rows.lock();
        let row = rows.get_mut(&id.into())?;
        let old = row.clone();
        row.extend(changes);
        Some((old, row.clone()))
    }

    pub fn remove(&self, id: impl Into<AttrValue>) -> Option<Record> {
        self.rows.lock().remove(&id.into())
    }

    pub fn get(&self, id: impl Into<AttrValue>) -> Option<Record> {
        self.rows.lock().get(&id.into()).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    pub fn calls(&self) -> Vec<TableCall> {
        self.calls.lock().clone()
    }

    pub fn count_calls<F>(&self, pred: F) -> usize
    where
        F: Fn(&TableCall) -> bool,
    {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// While offline every query fails with [`TableError::Offline`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    fn check_online(&self) -> Result<(), TableError> {
        if self.offline.load(Ordering::Relaxed) {
            Err(TableError::Offline)
        }
        else {
            Ok(())
        }
    }

    fn matching(&self, conditions: &[(String, AttrValue)]) -> Vec<Record> {
        self.rows
            .lock()
            .values()
            .filter(|row| {
                conditions
                    .iter()
                    .all(|(name, value)| row.get(name).unwrap_or(&AttrValue::Null) == value)
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DataSource for MemoryTable {
    type Error = TableError;

    async fn find_references(
        &self,
        conditions: &[(String, AttrValue)],
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<AttrValue>, Self::Error> {
        self.calls.lock().push(TableCall::FindReferences {
            conditions: conditions.to_vec(),
            order,
            limit,
        });
        self.check_online()?;

        let mut refs = self
            .matching(conditions)
            .iter()
            .map(|row| self.pk_of(row))
            .collect::<Vec<_>>();
        order.sort(&mut refs);
        if let Some(limit) = limit {
            refs.truncate(limit);
        }
        Ok(refs)
    }

    async fn count(&self, conditions: &[(String, AttrValue)]) -> Result<u64, Self::Error> {
        self.calls.lock().push(TableCall::Count(conditions.to_vec()));
        self.check_online()?;
        Ok(self.matching(conditions).len() as u64)
    }

    async fn find_by_references(&self, references: &[AttrValue]) -> Result<Vec<Record>, Self::Error> {
        self.calls.lock().push(TableCall::FindByReferences(references.to_vec()));
        self.check_online()?;
        let rows = self.rows.lock();
        Ok(references.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }
}
