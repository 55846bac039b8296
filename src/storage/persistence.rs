//! Write-Ahead Logging (WAL) and snapshot persistence for the document store

use super::engine::{Collection, DocumentStore};
use super::filter::Filter;
use super::memory::{CollectionData, InMemoryDocumentStore};
use crate::core::{PipelineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::warn;

const WAL_FILE: &str = "documents.wal";
const SNAPSHOT_FILE: &str = "documents.snapshot";
const SNAPSHOT_VERSION: u32 = 1;

// ============================================================================
// WAL Entry Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntry {
    Put {
        collection: String,
        key: String,
        document: Value,
    },
    Delete {
        collection: String,
        key: String,
    },
    PutBatch {
        collection: String,
        documents: Vec<(String, Value)>,
    },
    DeleteBatch {
        collection: String,
        keys: Vec<String>,
    },
}

impl WalEntry {
    fn apply(self, data: &mut HashMap<Collection, CollectionData>) {
        match self {
            WalEntry::Put { collection, key, document } => {
                if let Some(c) = Collection::parse(&collection) {
                    data.entry(c).or_default().insert(key, document);
                }
            }
            WalEntry::Delete { collection, key } => {
                if let Some(c) = Collection::parse(&collection) {
                    data.entry(c).or_default().remove(&key);
                }
            }
            WalEntry::PutBatch { collection, documents } => {
                if let Some(c) = Collection::parse(&collection) {
                    data.entry(c).or_default().extend(documents);
                }
            }
            WalEntry::DeleteBatch { collection, keys } => {
                if let Some(c) = Collection::parse(&collection) {
                    let target = data.entry(c).or_default();
                    for key in keys {
                        target.remove(&key);
                    }
                }
            }
        }
    }
}

// ============================================================================
// Store Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub collections: HashMap<String, CollectionData>,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at_ms: i64,
    pub document_count: usize,
}

impl StoreSnapshot {
    pub fn new(data: HashMap<Collection, CollectionData>) -> Self {
        let document_count = data.values().map(|c| c.len()).sum();
        Self {
            version: SNAPSHOT_VERSION,
            collections: data
                .into_iter()
                .map(|(c, docs)| (c.as_str().to_string(), docs))
                .collect(),
            metadata: SnapshotMetadata {
                created_at_ms: Utc::now().timestamp_millis(),
                document_count,
            },
        }
    }

    fn into_collections(self) -> HashMap<Collection, CollectionData> {
        self.collections
            .into_iter()
            .filter_map(|(name, docs)| Collection::parse(&name).map(|c| (c, docs)))
            .collect()
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityMode {
    /// fsync after every WAL append
    #[default]
    Sync,
    /// flushed to the OS, not synced
    Async,
    /// no WAL at all (tests, throwaway runs)
    None,
}

// ============================================================================
// WAL Manager
// ============================================================================

pub struct WalManager {
    wal_path: PathBuf,
    wal_file: Option<BufWriter<File>>,
    durability_mode: DurabilityMode,
    entries_since_checkpoint: usize,
    checkpoint_threshold: usize,
}

impl WalManager {
    pub fn new<P: AsRef<Path>>(wal_path: P, durability_mode: DurabilityMode) -> Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();
        if let Some(parent) = wal_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PipelineError::storage(format!("create WAL directory: {e}")))?;
        }

        let wal_file = if durability_mode != DurabilityMode::None {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&wal_path)
                .map_err(|e| PipelineError::storage(format!("open WAL file: {e}")))?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self {
            wal_path,
            wal_file,
            durability_mode,
            entries_since_checkpoint: 0,
            checkpoint_threshold: 1000,
        })
    }

    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let file = self
            .wal_file
            .as_mut()
            .ok_or_else(|| PipelineError::storage("WAL file not initialized"))?;
        let serialized = rmp_serde::to_vec(entry)
            .map_err(|e| PipelineError::Serialization(format!("WAL entry: {e}")))?;
        let len = serialized.len() as u32;
        file.write_all(&len.to_le_bytes())
            .map_err(|e| PipelineError::storage(format!("write WAL: {e}")))?;
        file.write_all(&serialized)
            .map_err(|e| PipelineError::storage(format!("write WAL: {e}")))?;
        file.flush()
            .map_err(|e| PipelineError::storage(format!("flush WAL: {e}")))?;
        if self.durability_mode == DurabilityMode::Sync {
            file.get_mut()
                .sync_all()
                .map_err(|e| PipelineError::storage(format!("sync WAL: {e}")))?;
        }
        self.entries_since_checkpoint += 1;
        Ok(())
    }

    /// Read every complete entry. A torn final entry (crash mid-append) is
    /// dropped with a warning; anything else unreadable is an error.
    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        if !self.wal_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.wal_path)
            .map_err(|e| PipelineError::storage(format!("open WAL for reading: {e}")))?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(PipelineError::storage(format!("read WAL entry length: {e}"))),
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut data = vec![0u8; len];
            match reader.read_exact(&mut data) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!(path = %self.wal_path.display(), "dropping torn WAL tail");
                    break;
                }
                Err(e) => return Err(PipelineError::storage(format!("read WAL entry: {e}"))),
            }
            let entry: WalEntry = rmp_serde::from_slice(&data)
                .map_err(|e| PipelineError::Serialization(format!("WAL entry: {e}")))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.wal_file = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.wal_path)
            .map_err(|e| PipelineError::storage(format!("truncate WAL: {e}")))?;
        // reopen in append mode so later writes land at the end
        drop(file);
        let file = OpenOptions::new()
            .append(true)
            .open(&self.wal_path)
            .map_err(|e| PipelineError::storage(format!("reopen WAL: {e}")))?;
        self.wal_file = Some(BufWriter::new(file));
        self.entries_since_checkpoint = 0;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.entries_since_checkpoint >= self.checkpoint_threshold
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }

    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.checkpoint_threshold = threshold.max(1);
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Temp file + fsync + rename, so a crash leaves either snapshot intact.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let dir = match self.snapshot_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .map_err(|e| PipelineError::storage(format!("create snapshot directory: {e}")))?;
        let serialized = rmp_serde::to_vec(snapshot)
            .map_err(|e| PipelineError::Serialization(format!("snapshot: {e}")))?;

        let mut temp = NamedTempFile::new_in(&dir)
            .map_err(|e| PipelineError::storage(format!("create temp snapshot: {e}")))?;
        temp.write_all(&serialized)
            .map_err(|e| PipelineError::storage(format!("write snapshot: {e}")))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| PipelineError::storage(format!("sync snapshot: {e}")))?;
        temp.persist(&self.snapshot_path)
            .map_err(|e| PipelineError::storage(format!("rename snapshot: {}", e.error)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)
            .map_err(|e| PipelineError::storage(format!("open snapshot: {e}")))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| PipelineError::storage(format!("read snapshot: {e}")))?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data)
            .map_err(|e| PipelineError::Serialization(format!("snapshot: {e}")))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PipelineError::Serialization(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }
}

// ============================================================================
// Durable Document Store
// ============================================================================

struct PersistenceManager {
    wal: WalManager,
    snapshot: SnapshotManager,
    durability_mode: DurabilityMode,
}

/// In-memory collections made durable by a WAL plus periodic snapshots.
///
/// Every mutation is logged before it is applied, under one lock, so the
/// log order is the apply order.
pub struct DurableDocumentStore {
    memory: InMemoryDocumentStore,
    persistence: Mutex<PersistenceManager>,
}

impl DurableDocumentStore {
    /// Open (or create) a store under `data_dir`, recovering snapshot + WAL.
    pub async fn open<P: AsRef<Path>>(
        data_dir: P,
        durability_mode: DurabilityMode,
        checkpoint_threshold: usize,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let snapshot = SnapshotManager::new(data_dir.join(SNAPSHOT_FILE));
        let mut wal = WalManager::new(data_dir.join(WAL_FILE), durability_mode)?;
        wal.set_checkpoint_threshold(checkpoint_threshold);

        let mut data = match snapshot.load()? {
            Some(snapshot) => snapshot.into_collections(),
            None => HashMap::new(),
        };
        let entries = wal.read_all()?;
        let replayed = entries.len();
        for entry in entries {
            entry.apply(&mut data);
        }

        let memory = InMemoryDocumentStore::new();
        memory.restore_all(data).await;
        tracing::debug!(path = %data_dir.display(), replayed, "document store recovered");

        Ok(Self {
            memory,
            persistence: Mutex::new(PersistenceManager {
                wal,
                snapshot,
                durability_mode,
            }),
        })
    }

    /// Write a snapshot and truncate the WAL.
    pub async fn checkpoint(&self) -> Result<()> {
        let mut persistence = self.persistence.lock().await;
        self.checkpoint_locked(&mut persistence).await
    }

    async fn checkpoint_locked(&self, persistence: &mut PersistenceManager) -> Result<()> {
        if persistence.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let snapshot = StoreSnapshot::new(self.memory.export_all().await);
        persistence.snapshot.save(&snapshot)?;
        persistence.wal.clear()?;
        Ok(())
    }

    fn log(&self, persistence: &mut PersistenceManager, entry: &WalEntry) -> Result<()> {
        persistence.wal.append(entry)
    }

    async fn after_write(&self, persistence: &mut PersistenceManager) -> Result<()> {
        if persistence.wal.needs_checkpoint() {
            self.checkpoint_locked(persistence).await?;
        }
        Ok(())
    }

    pub fn has_snapshot(&self) -> bool {
        self.persistence
            .try_lock()
            .map(|p| p.snapshot.exists())
            .unwrap_or(false)
    }
}

#[async_trait]
impl DocumentStore for DurableDocumentStore {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>> {
        self.memory.get(collection, key).await
    }

    async fn put(&self, collection: Collection, key: &str, document: Value) -> Result<()> {
        let mut persistence = self.persistence.lock().await;
        let entry = WalEntry::Put {
            collection: collection.as_str().to_string(),
            key: key.to_string(),
            document: document.clone(),
        };
        self.log(&mut persistence, &entry)?;
        self.memory.put(collection, key, document).await?;
        self.after_write(&mut persistence).await
    }

    async fn put_if_absent(
        &self,
        collection: Collection,
        key: &str,
        document: Value,
    ) -> Result<bool> {
        let mut persistence = self.persistence.lock().await;
        if self.memory.get(collection, key).await?.is_some() {
            return Ok(false);
        }
        let entry = WalEntry::Put {
            collection: collection.as_str().to_string(),
            key: key.to_string(),
            document: document.clone(),
        };
        self.log(&mut persistence, &entry)?;
        self.memory.put(collection, key, document).await?;
        self.after_write(&mut persistence).await?;
        Ok(true)
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool> {
        let mut persistence = self.persistence.lock().await;
        if self.memory.get(collection, key).await?.is_none() {
            return Ok(false);
        }
        let entry = WalEntry::Delete {
            collection: collection.as_str().to_string(),
            key: key.to_string(),
        };
        self.log(&mut persistence, &entry)?;
        let removed = self.memory.delete(collection, key).await?;
        self.after_write(&mut persistence).await?;
        Ok(removed)
    }

    async fn query(&self, collection: Collection, filter: &Filter) -> Result<Vec<(String, Value)>> {
        self.memory.query(collection, filter).await
    }

    async fn put_batch(&self, collection: Collection, documents: Vec<(String, Value)>) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let mut persistence = self.persistence.lock().await;
        let entry = WalEntry::PutBatch {
            collection: collection.as_str().to_string(),
            documents: documents.clone(),
        };
        self.log(&mut persistence, &entry)?;
        self.memory.put_batch(collection, documents).await?;
        self.after_write(&mut persistence).await
    }

    async fn delete_batch(&self, collection: Collection, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut persistence = self.persistence.lock().await;
        let entry = WalEntry::DeleteBatch {
            collection: collection.as_str().to_string(),
            keys: keys.to_vec(),
        };
        self.log(&mut persistence, &entry)?;
        let removed = self.memory.delete_batch(collection, keys).await?;
        self.after_write(&mut persistence).await?;
        Ok(removed)
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<usize> {
        self.memory.count(collection, filter).await
    }
}
