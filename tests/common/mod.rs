//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use activity_journal::core::{EntityType, Frn, PipelineError, Result, Usn, VolumeId};
use activity_journal::journal::reason::{
    CLOSE, DATA_EXTEND, FILE_CREATE, FILE_DELETE, RENAME_NEW_NAME, RENAME_OLD_NAME,
};
use activity_journal::journal::{
    BaselineEntry, BaselineScanner, ChangeEvent, JournalMetadata, ReasonFlags, SpoolJournal,
};
use activity_journal::storage::{Collection, DocumentStore, Filter, InMemoryDocumentStore};
use activity_journal::worker::{EntityMetadata, MetadataFetcher};
use activity_journal::{Pipeline, PipelineConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const ROOT: u64 = 5;

pub fn volume() -> VolumeId {
    VolumeId::new("C:")
}

/// Settings that let a whole run finish quickly in a test.
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::new().volumes(["C:"]);
    config.resolution.initial_backoff_ms = 1;
    config.resolution.max_backoff_ms = 4;
    config.resolution.defer_delay_ms = 1;
    config.resolution.idle_poll_ms = 20;
    config.transition.settle_delay_secs = 60;
    config
}

pub struct Change {
    event: ChangeEvent,
}

/// Builder for a journal record on volume `C:`.
pub fn change(frn: u64, parent: u64, usn: i64, name: &str) -> Change {
    Change {
        event: ChangeEvent {
            volume_id: volume(),
            frn: Frn::from(frn),
            parent_frn: Frn::from(parent),
            usn: Usn(usn),
            timestamp: Utc::now(),
            reason: ReasonFlags(CLOSE),
            file_name: name.to_string(),
            is_directory: false,
        },
    }
}

impl Change {
    pub fn reason(mut self, flags: u32) -> Self {
        self.event.reason = ReasonFlags(flags);
        self
    }

    pub fn create(self) -> Self {
        self.reason(FILE_CREATE)
    }

    pub fn modify(self) -> Self {
        self.reason(DATA_EXTEND)
    }

    pub fn delete(self) -> Self {
        self.reason(FILE_DELETE | CLOSE)
    }

    pub fn rename_old(self) -> Self {
        self.reason(RENAME_OLD_NAME)
    }

    pub fn rename_new(self) -> Self {
        self.reason(RENAME_NEW_NAME)
    }

    pub fn dir(mut self) -> Self {
        self.event.is_directory = true;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.event.timestamp = timestamp;
        self
    }

    pub fn build(self) -> ChangeEvent {
        self.event
    }
}

pub fn root_entry() -> BaselineEntry {
    BaselineEntry {
        frn: Frn::from(ROOT),
        parent_frn: Frn::from(ROOT),
        name: String::new(),
        is_directory: true,
    }
}

/// A spool with an empty journal for `C:` and a baseline holding the root.
pub async fn spool_at(dir: &Path) -> SpoolJournal {
    let spool = SpoolJournal::new(dir);
    spool.init_volume(&volume(), 1, Usn(0)).await.unwrap();
    spool.write_baseline(&volume(), &[root_entry()]).await.unwrap();
    spool
}

/// Run once so the volume has a cursor; later records are then read.
pub async fn prime(pipeline: &Pipeline) {
    let report = pipeline.run_once().await.unwrap();
    assert_eq!(report.passes.len(), 1);
    assert!(report.passes[0].rescan.is_some());
}

/// Baseline scanner that counts how often it is asked for a full listing.
pub struct CountingScanner {
    inner: SpoolJournal,
    scans: AtomicUsize,
}

impl CountingScanner {
    pub fn new(inner: SpoolJournal) -> Self {
        Self {
            inner,
            scans: AtomicUsize::new(0),
        }
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BaselineScanner for CountingScanner {
    async fn scan(&self, volume: &VolumeId, metadata: &JournalMetadata) -> Result<Vec<BaselineEntry>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.inner.scan(volume, metadata).await
    }
}

/// Metadata lookups answered from a table that tests fill in as they go.
#[derive(Default)]
pub struct ScriptedFetcher {
    known: Mutex<HashMap<u64, EntityMetadata>>,
    calls: Mutex<HashMap<u64, usize>>,
}

impl ScriptedFetcher {
    pub fn learn(&self, frn: u64, parent: u64, name: &str, entity_type: EntityType) {
        let metadata = EntityMetadata {
            volume_id: volume(),
            frn: Frn::from(frn),
            parent_frn: (frn != parent).then(|| Frn::from(parent)),
            name: name.to_string(),
            entity_type,
        };
        self.known.lock().unwrap().insert(frn, metadata);
    }

    pub fn calls(&self, frn: u64) -> usize {
        self.calls.lock().unwrap().get(&frn).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MetadataFetcher for ScriptedFetcher {
    async fn fetch(&self, volume: &VolumeId, frn: Frn) -> Result<EntityMetadata> {
        let short = frn.get() as u64;
        *self.calls.lock().unwrap().entry(short).or_insert(0) += 1;
        self.known
            .lock()
            .unwrap()
            .get(&short)
            .cloned()
            .ok_or_else(|| PipelineError::ResolutionFailure {
                volume: volume.clone(),
                frn,
                reason: "path no longer exists".into(),
            })
    }
}

/// In-memory store whose hot-tier batch deletes fail a set number of times.
pub struct FlakyStore {
    inner: InMemoryDocumentStore,
    failing_hot_deletes: AtomicUsize,
}

impl FlakyStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryDocumentStore::new(),
            failing_hot_deletes: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>> {
        self.inner.get(collection, key).await
    }

    async fn put(&self, collection: Collection, key: &str, document: Value) -> Result<()> {
        self.inner.put(collection, key, document).await
    }

    async fn put_if_absent(&self, collection: Collection, key: &str, document: Value) -> Result<bool> {
        self.inner.put_if_absent(collection, key, document).await
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool> {
        self.inner.delete(collection, key).await
    }

    async fn query(&self, collection: Collection, filter: &Filter) -> Result<Vec<(String, Value)>> {
        self.inner.query(collection, filter).await
    }

    async fn put_batch(&self, collection: Collection, documents: Vec<(String, Value)>) -> Result<()> {
        self.inner.put_batch(collection, documents).await
    }

    async fn delete_batch(&self, collection: Collection, keys: &[String]) -> Result<usize> {
        if collection == Collection::HotTier
            && self
                .failing_hot_deletes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(PipelineError::StorageUnavailable("injected delete failure".into()));
        }
        self.inner.delete_batch(collection, keys).await
    }
}
