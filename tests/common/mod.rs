#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use wt_cache::prelude::*;
use wt_cache::test::MemoryTable;
use wt_cache::test::RecordingBackend;

pub const NAMESPACE: &str = "Story";

pub fn quick_locks() -> LockOptions {
    LockOptions {
        expiry:  Duration::from_secs(5),
        retries: 10,
        backoff: Duration::from_millis(1),
    }
}

/// A `stories` table with its repository and a session over a recording in-memory backend.
pub struct Fixture {
    pub backend: Arc<RecordingBackend>,
    pub table:   Arc<MemoryTable>,
    pub repo:    Repository<MemoryTable>,
    pub session: CacheSession,
}

impl Fixture {
    pub fn new() -> Self {
        #[cfg(feature = "tracing")]
        wt_cache::test::init_tracing();

        let backend = Arc::new(RecordingBackend::new(MemoryBackend::new()));
        let table = Arc::new(MemoryTable::new("id"));
        let config = CacheConfig::builder()
            .namespace(NAMESPACE)
            .lock(quick_locks())
            .build()
            .unwrap();
        let repo = Repository::new(config, Arc::clone(&table));
        let session = CacheSession::with_lock_options(backend.clone(), quick_locks());
        Self {
            backend,
            table,
            repo,
            session,
        }
    }

    /// Another unit of work over the same backend.
    pub fn session(&self) -> CacheSession {
        CacheSession::with_lock_options(self.backend.clone(), quick_locks())
    }

    pub async fn create(&self, record: Record) -> Record {
        let record = self.table.insert(record);
        self.repo.on_create(&self.session, &record).await.unwrap();
        record
    }

    pub async fn update(&self, id: i64, changes: Record) -> Record {
        let (old, new) = self.table.update(id, changes).unwrap();
        self.repo.on_update(&self.session, &old, &new).await.unwrap();
        new
    }

    pub async fn destroy(&self, id: i64) -> Record {
        let record = self.table.remove(id).unwrap();
        self.repo.on_delete(&self.session, &record).await.unwrap();
        record
    }

    /// What the backend holds under a logical key.
    pub async fn cached(&self, key: &str) -> Option<CacheValue> {
        self.backend
            .inner()
            .get(&format!("{NAMESPACE}/{key}"))
            .await
            .unwrap()
    }
}

pub fn refs(ids: &[i64]) -> CacheValue {
    CacheValue::References(ids.iter().map(|id| AttrValue::from(*id)).collect())
}

pub fn ids(records: &[Record]) -> Vec<i64> {
    records
        .iter()
        .filter_map(|r| match r.get("id") {
            Some(AttrValue::Int(id)) => Some(*id),
            _ => None,
        })
        .collect()
}
