//! Durable resolution queue.
//!
//! One entry per unresolved `(volume, frn)`. Entries are drained in
//! `(path_depth, priority, enqueued_at)` order, so shallow paths and
//! directories resolve before the files under them. A successful resolution
//! deletes the entry; exhausting the retry budget parks it as `failed`
//! (dead-letter) where it stays until an operator requeues it.

use crate::config::ResolutionPolicy;
use crate::core::{EntityKey, EntityType, Frn, Result, VolumeId};
use crate::storage::{Collection, DocumentStore, Filter, SortOrder, TypedCollection};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, event};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Processing,
    Failed,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionQueueEntry {
    pub entry_id: String,
    pub volume_id: VolumeId,
    pub frn: Frn,
    pub entity_type_hint: EntityType,
    pub path_depth: u32,
    /// Lower drains first.
    pub priority: u8,
    pub status: EntryStatus,
    pub attempts: u32,
    /// Unix millis.
    pub enqueued_at: i64,
    pub next_attempt_at: i64,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    /// Times the entry waited for its parent.
    #[serde(default)]
    pub deferrals: u32,
}

impl ResolutionQueueEntry {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.volume_id.clone(), self.frn)
    }
}

/// What the resolver knows when it asks for a resolution.
#[derive(Debug, Clone)]
pub struct ResolutionRequest {
    pub key: EntityKey,
    pub entity_type_hint: EntityType,
    pub path_depth: u32,
    pub priority: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created,
    /// Already queued; carries the status the entry is in.
    Existing(EntryStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry { attempts: u32, next_attempt_at: i64 },
    DeadLettered { attempts: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
}

pub struct ResolutionQueue {
    entries: TypedCollection<ResolutionQueueEntry>,
    // serializes read-modify-write cycles on entries
    write_lock: Mutex<()>,
}

impl ResolutionQueue {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            entries: TypedCollection::new(store, Collection::ResolutionQueue),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn get(&self, key: &EntityKey) -> Result<Option<ResolutionQueueEntry>> {
        self.entries.get(&key.storage_key()).await
    }

    /// Queue a key once. Re-enqueueing a pending entry can only make it more
    /// urgent; processing and failed entries are left alone.
    pub async fn enqueue(&self, request: ResolutionRequest) -> Result<EnqueueOutcome> {
        let _guard = self.write_lock.lock().await;
        let storage_key = request.key.storage_key();
        if let Some(mut existing) = self.entries.get(&storage_key).await? {
            if existing.status == EntryStatus::Pending && request.priority < existing.priority {
                existing.priority = request.priority;
                self.entries.put(&storage_key, &existing).await?;
            }
            return Ok(EnqueueOutcome::Existing(existing.status));
        }

        let now = Utc::now().timestamp_millis();
        let entry = ResolutionQueueEntry {
            entry_id: Uuid::new_v4().to_string(),
            volume_id: request.key.volume.clone(),
            frn: request.key.frn,
            entity_type_hint: request.entity_type_hint,
            path_depth: request.path_depth,
            priority: request.priority,
            status: EntryStatus::Pending,
            attempts: 0,
            enqueued_at: now,
            next_attempt_at: now,
            last_attempt_at: None,
            last_error: None,
            deferrals: 0,
        };
        self.entries.put(&storage_key, &entry).await?;
        event!(
            Level::DEBUG,
            volume_id = %request.key.volume,
            frn = %request.key.frn,
            priority = request.priority,
            path_depth = request.path_depth,
            "resolution queued"
        );
        Ok(EnqueueOutcome::Created)
    }

    /// Take the most urgent due entry and mark it `processing`.
    pub async fn claim_next(&self, now_ms: i64) -> Result<Option<ResolutionQueueEntry>> {
        let _guard = self.write_lock.lock().await;
        let filter = Filter::all()
            .eq("status", EntryStatus::Pending.as_str())
            .lte("next_attempt_at", now_ms)
            .order_by("path_depth", SortOrder::Asc)
            .order_by("priority", SortOrder::Asc)
            .order_by("enqueued_at", SortOrder::Asc)
            .limit(1);
        let Some((storage_key, mut entry)) = self.entries.query(&filter).await?.into_iter().next()
        else {
            return Ok(None);
        };
        entry.status = EntryStatus::Processing;
        entry.last_attempt_at = Some(now_ms);
        self.entries.put(&storage_key, &entry).await?;
        Ok(Some(entry))
    }

    /// Return `processing` entries older than `timeout_ms` to `pending`.
    /// Covers a worker that died mid-entry.
    pub async fn reclaim_stale(&self, now_ms: i64, timeout_ms: u64) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let cutoff = now_ms.saturating_sub(i64::try_from(timeout_ms).unwrap_or(i64::MAX));
        let stale = self
            .entries
            .query(
                &Filter::all()
                    .eq("status", EntryStatus::Processing.as_str())
                    .lt("last_attempt_at", cutoff),
            )
            .await?;
        let reclaimed = stale.len();
        for (storage_key, mut entry) in stale {
            entry.status = EntryStatus::Pending;
            entry.next_attempt_at = now_ms;
            event!(
                Level::WARN,
                volume_id = %entry.volume_id,
                frn = %entry.frn,
                "reclaiming stale resolution entry"
            );
            self.entries.put(&storage_key, &entry).await?;
        }
        Ok(reclaimed)
    }

    /// Park an entry until its parent has had a chance to resolve. Not an attempt.
    pub async fn defer(
        &self,
        mut entry: ResolutionQueueEntry,
        min_depth: u32,
        next_attempt_at: i64,
    ) -> Result<ResolutionQueueEntry> {
        let _guard = self.write_lock.lock().await;
        entry.status = EntryStatus::Pending;
        entry.path_depth = entry.path_depth.max(min_depth);
        entry.next_attempt_at = next_attempt_at;
        entry.deferrals += 1;
        self.entries.put(&entry.key().storage_key(), &entry).await?;
        Ok(entry)
    }

    /// Count a failed attempt; dead-letter once the budget is spent.
    pub async fn record_failure(
        &self,
        mut entry: ResolutionQueueEntry,
        error: &str,
        policy: &ResolutionPolicy,
        now_ms: i64,
    ) -> Result<FailureOutcome> {
        let _guard = self.write_lock.lock().await;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.last_attempt_at = Some(now_ms);
        let outcome = if entry.attempts >= policy.max_attempts {
            entry.status = EntryStatus::Failed;
            FailureOutcome::DeadLettered {
                attempts: entry.attempts,
            }
        } else {
            let delay = i64::try_from(policy.backoff_ms(entry.attempts)).unwrap_or(i64::MAX);
            entry.status = EntryStatus::Pending;
            entry.next_attempt_at = now_ms.saturating_add(delay);
            FailureOutcome::Retry {
                attempts: entry.attempts,
                next_attempt_at: entry.next_attempt_at,
            }
        };
        self.entries.put(&entry.key().storage_key(), &entry).await?;
        Ok(outcome)
    }

    /// Drop the entry of a resolved key.
    pub async fn complete(&self, key: &EntityKey) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.entries.delete(&key.storage_key()).await
    }

    /// Earliest `next_attempt_at` among pending entries.
    pub async fn next_due_at(&self) -> Result<Option<i64>> {
        let filter = Filter::all()
            .eq("status", EntryStatus::Pending.as_str())
            .order_by("next_attempt_at", SortOrder::Asc)
            .limit(1);
        let next = self.entries.query(&filter).await?.into_iter().next();
        Ok(next.map(|(_, entry)| entry.next_attempt_at))
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<ResolutionQueueEntry>> {
        let filter = Filter::all()
            .eq("status", EntryStatus::Failed.as_str())
            .order_by("enqueued_at", SortOrder::Asc);
        let rows = self.entries.query(&filter).await?;
        Ok(rows.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Give every dead-lettered entry a fresh retry budget.
    pub async fn requeue_dead_letters(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().timestamp_millis();
        let failed = self
            .entries
            .query(&Filter::all().eq("status", EntryStatus::Failed.as_str()))
            .await?;
        let requeued = failed.len();
        for (storage_key, mut entry) in failed {
            entry.status = EntryStatus::Pending;
            entry.attempts = 0;
            entry.next_attempt_at = now;
            self.entries.put(&storage_key, &entry).await?;
        }
        if requeued > 0 {
            event!(Level::INFO, requeued, "dead-lettered resolutions requeued");
        }
        Ok(requeued)
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for (_, entry) in self.entries.query(&Filter::all()).await? {
            match entry.status {
                EntryStatus::Pending => counts.pending += 1,
                EntryStatus::Processing => counts.processing += 1,
                EntryStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
