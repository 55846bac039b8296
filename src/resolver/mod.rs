//! Entity identity resolution.
//!
//! Maps `(volume, frn)` to a stable entity id. Events for references with no
//! entity record are held per key and queued for out-of-band resolution;
//! when the resolution completes they are flushed to the hot tier in usn
//! order, and when it is abandoned they are written under a placeholder id.

pub mod entity;
pub mod pending;
pub mod queue;

use crate::core::{EntityId, EntityKey, EntityType, EventKind, Frn, Result, Usn, VolumeId};
use crate::journal::{BaselineEntry, ChangeEvent, RenameHalf};
use crate::tier::HotTierWriter;
use crate::worker::MetadataObserver;
use chrono::Utc;
use entity::{PATH_SEPARATOR, child_path, path_depth};
use pending::{PendingBuffers, PushOutcome, SlotHandle};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{Level, event};

pub use entity::{EntityIndex, EntityRecord};
pub use queue::{
    EnqueueOutcome, EntryStatus, FailureOutcome, QueueCounts, ResolutionQueue, ResolutionQueueEntry,
    ResolutionRequest,
};

/// Queue priority of the entity an event refers to. Lower is more urgent.
pub fn priority_for(event: &ChangeEvent) -> u8 {
    match event.kind() {
        EventKind::Create if event.is_directory => 0,
        EventKind::Create => 1,
        EventKind::Rename => 2,
        EventKind::Modify => 3,
        EventKind::Metadata | EventKind::Close => 4,
        EventKind::Delete => 6,
    }
}

/// What one `ingest` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestTally {
    pub written: usize,
    pub duplicates: usize,
    pub buffered: usize,
    pub unresolved: usize,
    pub stashed: usize,
}

impl IngestTally {
    pub fn merge(&mut self, other: IngestTally) {
        self.written += other.written;
        self.duplicates += other.duplicates;
        self.buffered += other.buffered;
        self.unresolved += other.unresolved;
        self.stashed += other.stashed;
    }
}

pub struct EntityResolver {
    entities: Arc<EntityIndex>,
    queue: Arc<ResolutionQueue>,
    hot: Arc<HotTierWriter>,
    pending: PendingBuffers,
    // old-name halves waiting for their new-name partner
    renames: Mutex<HashMap<EntityKey, ChangeEvent>>,
    observer: Option<Arc<dyn MetadataObserver>>,
}

impl EntityResolver {
    pub fn new(
        entities: Arc<EntityIndex>,
        queue: Arc<ResolutionQueue>,
        hot: Arc<HotTierWriter>,
        pending_capacity: usize,
    ) -> Self {
        Self {
            entities,
            queue,
            hot,
            pending: PendingBuffers::new(pending_capacity),
            renames: Mutex::new(HashMap::new()),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn MetadataObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn entities(&self) -> &Arc<EntityIndex> {
        &self.entities
    }

    pub fn queue(&self) -> &Arc<ResolutionQueue> {
        &self.queue
    }

    /// Route one decoded event. Events of one volume must arrive in usn order.
    pub async fn ingest(&self, event: ChangeEvent) -> Result<IngestTally> {
        if let Some(observer) = &self.observer {
            observer.observe_event(&event);
        }
        let mut tally = IngestTally::default();
        let key = event.key();
        let (stashed, replayed) = {
            let mut renames = self.renames.lock()?;
            // a re-read from a cursor pinned below the stashed half
            match renames.get(&key) {
                Some(held) if held.usn >= event.usn => (None, Some(held.usn)),
                _ => (renames.remove(&key), None),
            }
        };
        if let Some(held_usn) = replayed {
            if held_usn > event.usn {
                self.route(event, &mut tally).await?;
            }
            return Ok(tally);
        }

        match event.rename() {
            Some(RenameHalf::Old) => {
                if let Some(unpaired) = stashed {
                    self.route(unpaired, &mut tally).await?;
                }
                self.renames.lock()?.insert(key, event);
                tally.stashed += 1;
                return Ok(tally);
            }
            Some(RenameHalf::New) => {
                if let Some(old) = stashed {
                    event!(
                        Level::DEBUG,
                        volume_id = %event.volume_id,
                        frn = %event.frn,
                        usn = event.usn.0,
                        from = %old.file_name,
                        to = %event.file_name,
                        "rename paired"
                    );
                }
            }
            None => {
                if let Some(unpaired) = stashed {
                    self.route(unpaired, &mut tally).await?;
                }
            }
        }

        self.route(event, &mut tally).await?;
        Ok(tally)
    }

    async fn route(&self, event: ChangeEvent, tally: &mut IngestTally) -> Result<()> {
        let key = event.key();
        if !self.pending.contains(&key)? {
            if let Some(record) = self.entities.get(&key).await? {
                let record = self.apply_to_record(record, &event).await?;
                return self.write(&event, &record.entity_id, false, tally).await;
            }
            if let Some(record) = self.create_on_sight(&event).await? {
                return self.write(&event, &record.entity_id, false, tally).await;
            }
        }
        self.hold(event, tally).await
    }

    /// A create whose parent is already known needs no lookup.
    async fn create_on_sight(&self, event: &ChangeEvent) -> Result<Option<EntityRecord>> {
        if event.kind() != EventKind::Create {
            return Ok(None);
        }
        let key = event.key();
        if self.queue.get(&key).await?.is_some() {
            return Ok(None);
        }
        let parent = if event.is_root() {
            None
        } else {
            match self.entities.get(&event.parent_key()).await? {
                Some(parent) => Some(parent),
                None => return Ok(None),
            }
        };
        let path = if event.is_root() {
            String::new()
        } else {
            child_path(parent.as_ref(), &event.file_name)
        };
        let record = EntityRecord::new(
            &key,
            path,
            EntityType::from_is_directory(event.is_directory),
            parent.map(|p| p.entity_id),
        );
        let record = self.entities.create_if_absent(record).await?;
        event!(
            Level::DEBUG,
            volume_id = %key.volume,
            frn = %key.frn,
            entity_id = %record.entity_id,
            "entity created on first sighting"
        );
        Ok(Some(record))
    }

    async fn hold(&self, event: ChangeEvent, tally: &mut IngestTally) -> Result<()> {
        let key = event.key();
        loop {
            let handle = self.pending.slot(&key)?;
            let mut slot = handle.lock().await;
            if slot.is_closed() {
                continue;
            }

            if slot.is_empty() {
                // resolved while we were waiting for the slot
                if let Some(record) = self.entities.get(&key).await? {
                    slot.close();
                    self.pending.retire(&key, &handle)?;
                    drop(slot);
                    let record = self.apply_to_record(record, &event).await?;
                    return self.write(&event, &record.entity_id, false, tally).await;
                }
            }

            let (request, parent_known) = self.request_for(&event).await?;
            let priority = request.priority;
            let status = self.queue.enqueue(request).await?;
            if status == EnqueueOutcome::Existing(EntryStatus::Failed) {
                // dead-lettered: nothing will drain this slot
                if slot.is_empty() {
                    slot.close();
                    self.pending.retire(&key, &handle)?;
                }
                drop(slot);
                return self.write_unresolved(&event, tally).await;
            }
            if !parent_known && !event.is_root() {
                self.queue
                    .enqueue(ResolutionRequest {
                        key: event.parent_key(),
                        entity_type_hint: EntityType::Directory,
                        path_depth: 0,
                        priority: priority.saturating_sub(1),
                    })
                    .await?;
            }

            let usn = event.usn;
            match self.pending.push(&key, &mut slot, event)? {
                PushOutcome::Buffered => {
                    tally.buffered += 1;
                    event!(
                        Level::DEBUG,
                        volume_id = %key.volume,
                        frn = %key.frn,
                        usn = usn.0,
                        held = slot.len(),
                        "event held for resolution"
                    );
                }
                PushOutcome::AlreadyHeld => {
                    tally.duplicates += 1;
                }
                PushOutcome::Overflow(event) => {
                    drop(slot);
                    event!(
                        Level::WARN,
                        volume_id = %key.volume,
                        frn = %key.frn,
                        usn = usn.0,
                        "pending buffer full; writing event unresolved"
                    );
                    self.write_unresolved(&event, tally).await?;
                }
            }
            return Ok(());
        }
    }

    async fn request_for(&self, event: &ChangeEvent) -> Result<(ResolutionRequest, bool)> {
        let parent = if event.is_root() {
            None
        } else {
            self.entities.get(&event.parent_key()).await?
        };
        let path_depth = match &parent {
            Some(parent) => path_depth(&child_path(Some(parent), &event.file_name)),
            None => 0,
        };
        let request = ResolutionRequest {
            key: event.key(),
            entity_type_hint: EntityType::from_is_directory(event.is_directory),
            path_depth,
            priority: priority_for(event),
        };
        Ok((request, parent.is_some()))
    }

    /// Fold what an event says about an entity into its record.
    async fn apply_to_record(&self, mut record: EntityRecord, event: &ChangeEvent) -> Result<EntityRecord> {
        let mut changed = false;
        if event.rename() == Some(RenameHalf::New) {
            let parent = if event.is_root() {
                None
            } else {
                self.entities.get(&event.parent_key()).await?
            };
            let path = match &parent {
                Some(parent) => child_path(Some(parent), &event.file_name),
                None if event.is_root() => String::new(),
                None => replace_last_component(&record.path_hint, &event.file_name),
            };
            if record.path_hint != path {
                record.path_hint = path;
                changed = true;
            }
            if let Some(parent) = parent {
                if record.parent_entity_id.as_ref() != Some(&parent.entity_id) {
                    record.parent_entity_id = Some(parent.entity_id);
                    changed = true;
                }
            }
        }
        if event.kind() == EventKind::Delete && !record.deleted {
            record.deleted = true;
            changed = true;
        }
        if changed {
            record.updated_at = Utc::now();
            self.entities.put(&record).await?;
        }
        Ok(record)
    }

    async fn write(
        &self,
        event: &ChangeEvent,
        entity_id: &EntityId,
        unresolved: bool,
        tally: &mut IngestTally,
    ) -> Result<()> {
        let record = self.hot.activity_for(event, entity_id, unresolved);
        if self.hot.append(&record).await? {
            if unresolved {
                tally.unresolved += 1;
            } else {
                tally.written += 1;
            }
        } else {
            tally.duplicates += 1;
        }
        Ok(())
    }

    async fn write_unresolved(&self, event: &ChangeEvent, tally: &mut IngestTally) -> Result<()> {
        let placeholder = EntityId::placeholder(&event.volume_id, event.frn);
        self.write(event, &placeholder, true, tally).await
    }

    /// An entity record now exists: flush its held events and reclaim any
    /// activity written under its placeholder. Returns events flushed.
    pub async fn on_resolved(&self, record: &EntityRecord) -> Result<usize> {
        self.entities.remember(record)?;
        let key = record.key();
        let flushed = match self.pending.existing(&key)? {
            Some(handle) => self.flush(&key, &handle, Some(record)).await?,
            None => 0,
        };
        let placeholder = EntityId::placeholder(&key.volume, key.frn);
        self.hot.reassign(&placeholder, &record.entity_id).await?;
        if flushed > 0 {
            event!(
                Level::DEBUG,
                volume_id = %key.volume,
                frn = %key.frn,
                entity_id = %record.entity_id,
                flushed,
                "held events flushed"
            );
        }
        Ok(flushed)
    }

    /// Resolution was abandoned: write held events under the placeholder id.
    pub async fn on_failed(&self, key: &EntityKey) -> Result<usize> {
        let flushed = match self.pending.existing(key)? {
            Some(handle) => self.flush(key, &handle, None).await?,
            None => 0,
        };
        if flushed > 0 {
            event!(
                Level::WARN,
                volume_id = %key.volume,
                frn = %key.frn,
                flushed,
                error_kind = "resolution_failure",
                "held events written unresolved"
            );
        }
        Ok(flushed)
    }

    async fn flush(&self, key: &EntityKey, handle: &SlotHandle, resolved: Option<&EntityRecord>) -> Result<usize> {
        let mut slot = handle.lock().await;
        if slot.is_closed() {
            return Ok(0);
        }
        // held in arrival order, which is usn order
        let events = slot.events().to_vec();
        let mut tally = IngestTally::default();
        let mut record = resolved.cloned();
        for (done, event) in events.iter().enumerate() {
            let result = match record.take() {
                Some(current) => match self.apply_to_record(current, event).await {
                    Ok(updated) => {
                        let outcome = self.write(event, &updated.entity_id, false, &mut tally).await;
                        record = Some(updated);
                        outcome
                    }
                    Err(err) => Err(err),
                },
                None => self.write_unresolved(event, &mut tally).await,
            };
            if let Err(err) = result {
                slot.consume(done);
                self.pending.refresh_oldest(key, &slot)?;
                return Err(err);
            }
        }
        slot.consume(events.len());
        slot.close();
        self.pending.retire(key, handle)?;
        Ok(events.len())
    }

    /// Last usn the cursor may be committed to for `volume`: everything after
    /// it is still held in memory. `None` when nothing is held.
    pub fn low_watermark(&self, volume: &VolumeId) -> Result<Option<Usn>> {
        let held = self.pending.oldest_usn(volume)?;
        let stashed = self
            .renames
            .lock()?
            .values()
            .filter(|e| &e.volume_id == volume)
            .map(|e| e.usn)
            .min();
        let oldest = match (held, stashed) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Ok(oldest.map(Usn::prev))
    }

    /// Write out everything held for `volume` under placeholder ids.
    ///
    /// Used after a rescan: events from before the discontinuity must not pin
    /// the new cursor. Their queue entries stay, so a later resolution still
    /// reconciles the placeholders.
    pub async fn release_volume(&self, volume: &VolumeId) -> Result<usize> {
        let stashed: Vec<ChangeEvent> = {
            let mut renames = self.renames.lock()?;
            let keys: Vec<EntityKey> = renames.keys().filter(|k| &k.volume == volume).cloned().collect();
            keys.iter().filter_map(|k| renames.remove(k)).collect()
        };
        let mut tally = IngestTally::default();
        for event in stashed {
            self.route(event, &mut tally).await?;
        }
        let mut released = 0;
        for key in self.pending.keys_for(volume)? {
            released += self.on_failed(&key).await?;
        }
        Ok(released)
    }

    pub fn held_keys(&self) -> Result<usize> {
        self.pending.held_keys()
    }

    /// Seed entity records from a full-tree listing, parents first.
    pub async fn apply_baseline(&self, volume: &VolumeId, entries: &[BaselineEntry]) -> Result<usize> {
        if let Some(observer) = &self.observer {
            for entry in entries {
                observer.observe_baseline(volume, entry);
            }
        }

        let by_frn: HashMap<Frn, &BaselineEntry> = entries.iter().map(|e| (e.frn, e)).collect();
        let mut ordered: Vec<(usize, &BaselineEntry)> = entries
            .iter()
            .map(|entry| (ancestor_count(entry, &by_frn), entry))
            .collect();
        ordered.sort_by_key(|(depth, _)| *depth);

        let now = Utc::now();
        for (_, entry) in &ordered {
            let key = EntityKey::new(volume.clone(), entry.frn);
            let is_root = entry.parent_frn == entry.frn;
            let parent = if is_root {
                None
            } else {
                self.entities
                    .get(&EntityKey::new(volume.clone(), entry.parent_frn))
                    .await?
            };
            let path = if is_root {
                String::new()
            } else {
                child_path(parent.as_ref(), &entry.name)
            };
            let entity_type = EntityType::from_is_directory(entry.is_directory);
            let parent_id = parent.map(|p| p.entity_id);

            let record = match self.entities.get(&key).await? {
                Some(mut existing) => {
                    existing.path_hint = path;
                    existing.entity_type = entity_type;
                    if parent_id.is_some() {
                        existing.parent_entity_id = parent_id;
                    }
                    existing.deleted = false;
                    existing.updated_at = now;
                    self.entities.put(&existing).await?;
                    existing
                }
                None => {
                    self.entities
                        .create_if_absent(EntityRecord::new(&key, path, entity_type, parent_id))
                        .await?
                }
            };
            if self.pending.contains(&key)? {
                self.on_resolved(&record).await?;
            }
        }
        event!(Level::INFO, volume_id = %volume, entities = ordered.len(), "baseline applied");
        Ok(ordered.len())
    }
}

fn ancestor_count(entry: &BaselineEntry, by_frn: &HashMap<Frn, &BaselineEntry>) -> usize {
    let mut seen = HashSet::new();
    let mut current = entry;
    let mut depth = 0;
    while current.parent_frn != current.frn && seen.insert(current.frn) {
        match by_frn.get(&current.parent_frn) {
            Some(parent) => {
                depth += 1;
                current = parent;
            }
            None => break,
        }
    }
    depth
}

fn replace_last_component(path: &str, name: &str) -> String {
    match path.rfind([PATH_SEPARATOR, '/']) {
        Some(at) => format!("{}{name}", &path[..=at]),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::ReasonFlags;
    use crate::journal::reason::{DATA_EXTEND, FILE_CREATE, FILE_DELETE, RENAME_NEW_NAME, RENAME_OLD_NAME};
    use crate::storage::{DocumentStore, InMemoryDocumentStore};

    struct Fixture {
        resolver: EntityResolver,
        hot: Arc<HotTierWriter>,
        queue: Arc<ResolutionQueue>,
        entities: Arc<EntityIndex>,
    }

    fn fixture(capacity: usize) -> Fixture {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let entities = Arc::new(EntityIndex::new(Arc::clone(&store), 64));
        let queue = Arc::new(ResolutionQueue::new(Arc::clone(&store)));
        let hot = Arc::new(HotTierWriter::new(Arc::clone(&store), 86_400_000));
        let resolver = EntityResolver::new(
            Arc::clone(&entities),
            Arc::clone(&queue),
            Arc::clone(&hot),
            capacity,
        );
        Fixture {
            resolver,
            hot,
            queue,
            entities,
        }
    }

    fn event(frn: u64, parent: u64, usn: i64, reason: u32, name: &str, dir: bool) -> ChangeEvent {
        ChangeEvent {
            volume_id: VolumeId::new("C:"),
            frn: Frn::from(frn),
            parent_frn: Frn::from(parent),
            usn: Usn(usn),
            timestamp: Utc::now(),
            reason: ReasonFlags(reason),
            file_name: name.into(),
            is_directory: dir,
        }
    }

    fn key(frn: u64) -> EntityKey {
        EntityKey::new(VolumeId::new("C:"), Frn::from(frn))
    }

    #[tokio::test]
    async fn creates_under_known_parents_resolve_immediately() {
        let f = fixture(8);
        let tally = f.resolver.ingest(event(5, 5, 1, FILE_CREATE, ".", true)).await.unwrap();
        assert_eq!(tally.written, 1);
        f.resolver.ingest(event(7, 5, 2, FILE_CREATE, "docs", true)).await.unwrap();
        f.resolver.ingest(event(9, 7, 3, FILE_CREATE, "a.txt", false)).await.unwrap();

        let file = f.entities.get(&key(9)).await.unwrap().unwrap();
        assert_eq!(file.path_hint, "docs\\a.txt");
        let docs = f.entities.get(&key(7)).await.unwrap().unwrap();
        assert_eq!(file.parent_entity_id, Some(docs.entity_id));
        assert_eq!(f.queue.counts().await.unwrap(), QueueCounts::default());
        assert_eq!(f.hot.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn unknown_references_are_held_and_queued_with_their_parent() {
        let f = fixture(8);
        let tally = f
            .resolver
            .ingest(event(42, 7, 10, DATA_EXTEND, "a.txt", false))
            .await
            .unwrap();
        assert_eq!(tally.buffered, 1);
        assert_eq!(f.hot.count().await.unwrap(), 0);

        let child = f.queue.get(&key(42)).await.unwrap().unwrap();
        let parent = f.queue.get(&key(7)).await.unwrap().unwrap();
        assert!(parent.priority < child.priority);
        assert_eq!(f.resolver.low_watermark(&VolumeId::new("C:")).unwrap(), Some(Usn(9)));
    }

    #[tokio::test]
    async fn resolution_flushes_in_usn_order() {
        let f = fixture(8);
        for usn in [10, 11, 12] {
            f.resolver
                .ingest(event(42, 7, usn, DATA_EXTEND, "a.txt", false))
                .await
                .unwrap();
        }
        let record = EntityRecord::new(&key(42), "a.txt".into(), EntityType::File, None);
        f.entities.put(&record).await.unwrap();
        assert_eq!(f.resolver.on_resolved(&record).await.unwrap(), 3);

        let written = f.hot.for_entity(&record.entity_id).await.unwrap();
        let seqs: Vec<u64> = written.iter().map(|r| r.sequence_no).collect();
        assert_eq!(seqs, vec![10, 11, 12]);
        assert_eq!(f.resolver.low_watermark(&VolumeId::new("C:")).unwrap(), None);
        assert_eq!(f.resolver.held_keys().unwrap(), 0);

        // later events go straight through
        let tally = f
            .resolver
            .ingest(event(42, 7, 13, DATA_EXTEND, "a.txt", false))
            .await
            .unwrap();
        assert_eq!(tally.written, 1);
    }

    #[tokio::test]
    async fn overflow_is_written_unresolved_not_dropped() {
        let f = fixture(2);
        let mut total = IngestTally::default();
        for usn in 1..=4 {
            total.merge(
                f.resolver
                    .ingest(event(42, 7, usn, DATA_EXTEND, "a.txt", false))
                    .await
                    .unwrap(),
            );
        }
        assert_eq!((total.buffered, total.unresolved), (2, 2));
        let placeholder = EntityId::placeholder(&VolumeId::new("C:"), Frn::from(42u64));
        assert_eq!(f.hot.for_entity(&placeholder).await.unwrap().len(), 2);

        // resolution reclaims the placeholders as well
        let record = EntityRecord::new(&key(42), "a.txt".into(), EntityType::File, None);
        f.entities.put(&record).await.unwrap();
        f.resolver.on_resolved(&record).await.unwrap();
        assert_eq!(f.hot.for_entity(&record.entity_id).await.unwrap().len(), 4);
        assert!(f.hot.for_entity(&placeholder).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_resolution_writes_placeholders() {
        let f = fixture(8);
        f.resolver
            .ingest(event(42, 7, 10, DATA_EXTEND, "a.txt", false))
            .await
            .unwrap();
        assert_eq!(f.resolver.on_failed(&key(42)).await.unwrap(), 1);
        let placeholder = EntityId::placeholder(&VolumeId::new("C:"), Frn::from(42u64));
        let records = f.hot.for_entity(&placeholder).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].unresolved);
    }

    #[tokio::test]
    async fn rename_pairs_into_one_activity() {
        let f = fixture(8);
        f.resolver.ingest(event(5, 5, 1, FILE_CREATE, ".", true)).await.unwrap();
        f.resolver.ingest(event(7, 5, 2, FILE_CREATE, "draft.txt", false)).await.unwrap();

        let old = f
            .resolver
            .ingest(event(7, 5, 3, RENAME_OLD_NAME, "draft.txt", false))
            .await
            .unwrap();
        assert_eq!(old.stashed, 1);
        assert_eq!(f.resolver.low_watermark(&VolumeId::new("C:")).unwrap(), Some(Usn(2)));

        f.resolver
            .ingest(event(7, 5, 4, RENAME_NEW_NAME, "final.txt", false))
            .await
            .unwrap();
        let record = f.entities.get(&key(7)).await.unwrap().unwrap();
        assert_eq!(record.path_hint, "final.txt");
        let kinds: Vec<EventKind> = f
            .hot
            .for_entity(&record.entity_id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.event_kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::Create, EventKind::Rename]);
    }

    #[tokio::test]
    async fn reread_old_name_stays_stashed() {
        let f = fixture(8);
        f.resolver.ingest(event(5, 5, 1, FILE_CREATE, ".", true)).await.unwrap();
        f.resolver.ingest(event(7, 5, 2, FILE_CREATE, "draft.txt", false)).await.unwrap();
        f.resolver
            .ingest(event(7, 5, 3, RENAME_OLD_NAME, "draft.txt", false))
            .await
            .unwrap();

        // the cursor was pinned below the stashed half, so it is read again
        let again = f
            .resolver
            .ingest(event(7, 5, 3, RENAME_OLD_NAME, "draft.txt", false))
            .await
            .unwrap();
        assert_eq!(again, IngestTally::default());
        assert_eq!(f.resolver.low_watermark(&VolumeId::new("C:")).unwrap(), Some(Usn(2)));

        f.resolver
            .ingest(event(7, 5, 4, RENAME_NEW_NAME, "final.txt", false))
            .await
            .unwrap();
        let record = f.entities.get(&key(7)).await.unwrap().unwrap();
        let mut records = f.hot.for_entity(&record.entity_id).await.unwrap();
        records.sort_by_key(|r| r.sequence_no);
        assert_eq!(
            records.iter().map(|r| (r.sequence_no, r.event_kind)).collect::<Vec<_>>(),
            vec![(2, EventKind::Create), (4, EventKind::Rename)]
        );
    }

    #[tokio::test]
    async fn unpaired_old_name_is_emitted_on_its_own() {
        let f = fixture(8);
        f.resolver.ingest(event(5, 5, 1, FILE_CREATE, ".", true)).await.unwrap();
        f.resolver.ingest(event(7, 5, 2, FILE_CREATE, "x", false)).await.unwrap();
        f.resolver.ingest(event(7, 5, 3, RENAME_OLD_NAME, "x", false)).await.unwrap();
        let tally = f
            .resolver
            .ingest(event(7, 5, 4, FILE_DELETE, "x", false))
            .await
            .unwrap();
        assert_eq!(tally.written, 2);
        let record = f.entities.get(&key(7)).await.unwrap().unwrap();
        assert!(record.deleted);
    }

    #[tokio::test]
    async fn baseline_seeds_parents_first() {
        let f = fixture(8);
        let volume = VolumeId::new("C:");
        let entries = vec![
            BaselineEntry {
                frn: Frn::from(9u64),
                parent_frn: Frn::from(7u64),
                name: "a.txt".into(),
                is_directory: false,
            },
            BaselineEntry {
                frn: Frn::from(7u64),
                parent_frn: Frn::from(5u64),
                name: "docs".into(),
                is_directory: true,
            },
            BaselineEntry {
                frn: Frn::from(5u64),
                parent_frn: Frn::from(5u64),
                name: ".".into(),
                is_directory: true,
            },
        ];
        assert_eq!(f.resolver.apply_baseline(&volume, &entries).await.unwrap(), 3);
        let file = f.entities.get(&key(9)).await.unwrap().unwrap();
        let docs = f.entities.get(&key(7)).await.unwrap().unwrap();
        assert_eq!(file.path_hint, "docs\\a.txt");
        assert_eq!(file.parent_entity_id, Some(docs.entity_id));
    }

    #[test]
    fn last_component_replacement() {
        assert_eq!(replace_last_component("docs\\a.txt", "b.txt"), "docs\\b.txt");
        assert_eq!(replace_last_component("a.txt", "b.txt"), "b.txt");
    }
}
