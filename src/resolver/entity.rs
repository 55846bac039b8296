use crate::core::{EntityId, EntityKey, EntityType, Frn, PipelineError, Result, VolumeId};
use crate::storage::{Collection, DocumentStore, Filter, TypedCollection};
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

pub const PATH_SEPARATOR: char = '\\';

/// Stable identity of a filesystem object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: EntityId,
    pub volume_id: VolumeId,
    pub frn: Frn,
    /// Best known path, relative to the volume root.
    pub path_hint: String,
    pub entity_type: EntityType,
    pub parent_entity_id: Option<EntityId>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn new(
        key: &EntityKey,
        path_hint: String,
        entity_type: EntityType,
        parent_entity_id: Option<EntityId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id: EntityId::generate(),
            volume_id: key.volume.clone(),
            frn: key.frn,
            path_hint,
            entity_type,
            parent_entity_id,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.volume_id.clone(), self.frn)
    }

    pub fn depth(&self) -> u32 {
        path_depth(&self.path_hint)
    }
}

/// Number of separators in a path hint.
pub fn path_depth(path: &str) -> u32 {
    path.chars().filter(|c| *c == PATH_SEPARATOR || *c == '/').count() as u32
}

/// Path of `name` inside `parent`. A root parent has an empty path.
pub fn child_path(parent: Option<&EntityRecord>, name: &str) -> String {
    match parent {
        Some(parent) if !parent.path_hint.is_empty() => {
            format!("{}{PATH_SEPARATOR}{name}", parent.path_hint)
        }
        _ => name.to_string(),
    }
}

/// Entity records with an LRU cache in front of the store.
pub struct EntityIndex {
    records: TypedCollection<EntityRecord>,
    cache: Mutex<LruCache<EntityKey, EntityRecord>>,
}

impl EntityIndex {
    pub fn new(store: Arc<dyn DocumentStore>, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: TypedCollection::new(store, Collection::Entities),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn get(&self, key: &EntityKey) -> Result<Option<EntityRecord>> {
        if let Some(record) = self.cache.lock()?.get(key) {
            return Ok(Some(record.clone()));
        }
        let record = self.records.get(&key.storage_key()).await?;
        if let Some(record) = &record {
            self.remember(record)?;
        }
        Ok(record)
    }

    /// Write (or overwrite) a record.
    pub async fn put(&self, record: &EntityRecord) -> Result<()> {
        self.records.put(&record.key().storage_key(), record).await?;
        self.remember(record)
    }

    /// Insert unless an identity already exists; the stored record wins so
    /// an entity id is never replaced.
    pub async fn create_if_absent(&self, record: EntityRecord) -> Result<EntityRecord> {
        let key = record.key();
        if self.records.put_if_absent(&key.storage_key(), &record).await? {
            self.remember(&record)?;
            return Ok(record);
        }
        self.get(&key).await?.ok_or_else(|| {
            PipelineError::storage(format!("entity {key} vanished during create"))
        })
    }

    pub fn remember(&self, record: &EntityRecord) -> Result<()> {
        self.cache.lock()?.put(record.key(), record.clone());
        Ok(())
    }

    pub async fn count(&self) -> Result<usize> {
        self.records.count(&Filter::all()).await
    }

    pub async fn list_volume(&self, volume: &VolumeId) -> Result<Vec<EntityRecord>> {
        let rows = self
            .records
            .query(&Filter::all().eq("volume_id", volume.as_str()))
            .await?;
        Ok(rows.into_iter().map(|(_, record)| record).collect())
    }
}
