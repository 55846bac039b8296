use crate::core::{EntityId, EventKind, Frn, PipelineError, Result, Usn, VolumeId};
use crate::journal::ChangeEvent;
use crate::storage::{Collection, DocumentStore, Filter, TypedCollection};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{Level, event};

/// One raw activity event in the hot tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub entity_id: EntityId,
    pub event_kind: EventKind,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// The journal usn of the event.
    pub sequence_no: u64,
    pub volume_id: VolumeId,
    pub frn: Frn,
    /// Written under a placeholder id because the entity could not be resolved.
    #[serde(default)]
    pub unresolved: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn storage_key(&self) -> String {
        record_key(&self.entity_id, self.sequence_no)
    }
}

pub fn record_key(entity_id: &EntityId, sequence_no: u64) -> String {
    format!("{entity_id}:{sequence_no:020}")
}

pub fn sequence_of(usn: Usn) -> u64 {
    u64::try_from(usn.0).unwrap_or(0)
}

/// Append-only writer for the hot tier.
pub struct HotTierWriter {
    records: TypedCollection<ActivityRecord>,
    ttl: Duration,
}

impl HotTierWriter {
    pub fn new(store: Arc<dyn DocumentStore>, ttl_ms: i64) -> Self {
        Self {
            records: TypedCollection::new(store, Collection::HotTier),
            ttl: Duration::milliseconds(ttl_ms),
        }
    }

    pub fn records(&self) -> &TypedCollection<ActivityRecord> {
        &self.records
    }

    /// Build the record for `event`, attaching the configured TTL.
    pub fn activity_for(&self, event: &ChangeEvent, entity_id: &EntityId, unresolved: bool) -> ActivityRecord {
        ActivityRecord {
            entity_id: entity_id.clone(),
            event_kind: event.kind(),
            timestamp: event.timestamp,
            sequence_no: sequence_of(event.usn),
            volume_id: event.volume_id.clone(),
            frn: event.frn,
            unresolved,
            expires_at: event.timestamp + self.ttl,
        }
    }

    /// Insert a record; fails with `DuplicateSequence` if its key exists.
    pub async fn write(&self, record: &ActivityRecord) -> Result<()> {
        if self.records.put_if_absent(&record.storage_key(), record).await? {
            Ok(())
        } else {
            Err(PipelineError::DuplicateSequence {
                entity_id: record.entity_id.clone(),
                sequence_no: record.sequence_no,
            })
        }
    }

    /// `write` with duplicates treated as already done. Returns whether a
    /// new record was stored.
    pub async fn append(&self, record: &ActivityRecord) -> Result<bool> {
        match self.write(record).await {
            Ok(()) => Ok(true),
            Err(PipelineError::DuplicateSequence { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Move every record filed under `from` to `to`, clearing the
    /// unresolved flag. Returns how many records moved.
    pub async fn reassign(&self, from: &EntityId, to: &EntityId) -> Result<usize> {
        let rows = self
            .records
            .query(&Filter::all().eq("entity_id", from.as_str()))
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let mut old_keys = Vec::with_capacity(rows.len());
        for (key, mut record) in rows {
            record.entity_id = to.clone();
            record.unresolved = false;
            self.append(&record).await?;
            old_keys.push(key);
        }
        let moved = self.records.delete_batch(&old_keys).await?;
        event!(
            Level::INFO,
            entity_id = %to,
            placeholder = %from,
            moved,
            "unresolved activity reconciled"
        );
        Ok(moved)
    }

    /// Delete expired records, but only those the transition engine has
    /// already passed (`timestamp < watermark`).
    pub async fn sweep(
        &self,
        now: DateTime<Utc>,
        watermark: Option<DateTime<Utc>>,
        volume: Option<&VolumeId>,
    ) -> Result<usize> {
        let Some(watermark) = watermark else {
            return Ok(0);
        };
        let mut filter = Filter::all()
            .lte("expires_at", now.timestamp_millis())
            .lt("timestamp", watermark.timestamp_millis());
        if let Some(volume) = volume {
            filter = filter.eq("volume_id", volume.as_str());
        }
        let keys: Vec<String> = self
            .records
            .query(&filter)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let removed = self.records.delete_batch(&keys).await?;
        if removed > 0 {
            event!(Level::INFO, removed, "expired hot-tier records swept");
        }
        Ok(removed)
    }

    pub async fn count(&self) -> Result<usize> {
        self.records.count(&Filter::all()).await
    }

    pub async fn for_entity(&self, entity_id: &EntityId) -> Result<Vec<ActivityRecord>> {
        let rows = self
            .records
            .query(&Filter::all().eq("entity_id", entity_id.as_str()))
            .await?;
        Ok(rows.into_iter().map(|(_, record)| record).collect())
    }
}
