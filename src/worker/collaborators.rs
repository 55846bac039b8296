use crate::core::{EntityKey, EntityType, Frn, PipelineError, Result, VolumeId};
use crate::journal::{BaselineEntry, ChangeEvent, RenameHalf};
use crate::resolver::entity::{EntityIndex, EntityRecord, child_path};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// What the storage layer reports about one `(volume, frn)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMetadata {
    pub volume_id: VolumeId,
    pub frn: Frn,
    /// `None` for the volume root.
    pub parent_frn: Option<Frn>,
    pub name: String,
    pub entity_type: EntityType,
}

impl EntityMetadata {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.volume_id.clone(), self.frn)
    }

    pub fn parent_key(&self) -> Option<EntityKey> {
        self.parent_frn
            .filter(|parent| *parent != self.frn)
            .map(|parent| EntityKey::new(self.volume_id.clone(), parent))
    }
}

/// Looks up metadata for a file reference.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    async fn fetch(&self, volume: &VolumeId, frn: Frn) -> Result<EntityMetadata>;
}

/// Creates or refreshes the entity record for fetched metadata.
#[async_trait]
pub trait EntityPersister: Send + Sync {
    async fn persist(
        &self,
        metadata: &EntityMetadata,
        parent: Option<&EntityRecord>,
    ) -> Result<EntityRecord>;
}

/// Sees every decoded event and baseline entry.
pub trait MetadataObserver: Send + Sync {
    fn observe_event(&self, event: &ChangeEvent);
    fn observe_baseline(&self, volume: &VolumeId, entry: &BaselineEntry);
}

/// Metadata learned from the journal itself.
///
/// Every record names its parent, its file name and whether it is a
/// directory, which is all resolution needs.
#[derive(Default)]
pub struct ObservedMetadataFetcher {
    known: RwLock<HashMap<EntityKey, EntityMetadata>>,
}

impl ObservedMetadataFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn learn(&self, metadata: EntityMetadata) {
        if let Ok(mut known) = self.known.write() {
            known.insert(metadata.key(), metadata);
        }
    }

    pub fn len(&self) -> usize {
        self.known.read().map(|known| known.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetadataObserver for ObservedMetadataFetcher {
    fn observe_event(&self, event: &ChangeEvent) {
        // the old-name half carries the name being left behind
        if event.rename() == Some(RenameHalf::Old) {
            if let Ok(known) = self.known.read() {
                if known.contains_key(&event.key()) {
                    return;
                }
            }
        }
        self.learn(EntityMetadata {
            volume_id: event.volume_id.clone(),
            frn: event.frn,
            parent_frn: (!event.is_root()).then_some(event.parent_frn),
            name: event.file_name.clone(),
            entity_type: EntityType::from_is_directory(event.is_directory),
        });
    }

    fn observe_baseline(&self, volume: &VolumeId, entry: &BaselineEntry) {
        self.learn(EntityMetadata {
            volume_id: volume.clone(),
            frn: entry.frn,
            parent_frn: (entry.parent_frn != entry.frn).then_some(entry.parent_frn),
            name: entry.name.clone(),
            entity_type: EntityType::from_is_directory(entry.is_directory),
        });
    }
}

#[async_trait]
impl MetadataFetcher for ObservedMetadataFetcher {
    async fn fetch(&self, volume: &VolumeId, frn: Frn) -> Result<EntityMetadata> {
        let key = EntityKey::new(volume.clone(), frn);
        self.known.read()?.get(&key).cloned().ok_or_else(|| PipelineError::ResolutionFailure {
            volume: volume.clone(),
            frn,
            reason: "no metadata observed for this reference".to_string(),
        })
    }
}

/// Writes entity records to the entity collection.
pub struct StoreEntityPersister {
    entities: Arc<EntityIndex>,
}

impl StoreEntityPersister {
    pub fn new(entities: Arc<EntityIndex>) -> Self {
        Self { entities }
    }
}

#[async_trait]
impl EntityPersister for StoreEntityPersister {
    async fn persist(
        &self,
        metadata: &EntityMetadata,
        parent: Option<&EntityRecord>,
    ) -> Result<EntityRecord> {
        let key = metadata.key();
        let path_hint = if metadata.parent_key().is_none() {
            String::new()
        } else {
            child_path(parent, &metadata.name)
        };
        let parent_entity_id = parent.map(|p| p.entity_id.clone());

        match self.entities.get(&key).await? {
            Some(mut existing) => {
                existing.path_hint = path_hint;
                existing.entity_type = metadata.entity_type;
                if parent_entity_id.is_some() {
                    existing.parent_entity_id = parent_entity_id;
                }
                existing.updated_at = Utc::now();
                self.entities.put(&existing).await?;
                Ok(existing)
            }
            None => {
                let record = EntityRecord::new(&key, path_hint, metadata.entity_type, parent_entity_id);
                self.entities.create_if_absent(record).await
            }
        }
    }
}
