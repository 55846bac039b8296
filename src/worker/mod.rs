//! Out-of-band resolution of queued file references.
//!
//! The worker claims the most urgent due entry (shallowest path first),
//! asks the metadata collaborator about it, persists the entity record and
//! tells the resolver to flush what it was holding. Failures back off
//! exponentially and dead-letter after `max_attempts`; waiting on an
//! unresolved parent is a deferral and costs no attempt.

pub mod collaborators;

use crate::config::ResolutionPolicy;
use crate::core::{EntityKey, EntityType, PipelineError, Result};
use crate::resolver::{
    EntityIndex, EntityRecord, EntityResolver, EntryStatus, FailureOutcome, ResolutionQueue, ResolutionQueueEntry,
    ResolutionRequest,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{Level, event};

pub use collaborators::{
    EntityMetadata, EntityPersister, MetadataFetcher, MetadataObserver, ObservedMetadataFetcher,
    StoreEntityPersister,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing was due.
    Idle,
    Resolved,
    /// The entity record appeared while the entry waited.
    AlreadyResolved,
    /// Parked behind its parent.
    Deferred,
    Retry,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub reclaimed: usize,
    pub resolved: usize,
    pub deferred: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Resolved | StepOutcome::AlreadyResolved => self.resolved += 1,
            StepOutcome::Deferred => self.deferred += 1,
            StepOutcome::Retry => self.retried += 1,
            StepOutcome::DeadLettered => self.dead_lettered += 1,
            StepOutcome::Idle => {}
        }
    }
}

enum Resolution {
    Resolved(EntityRecord),
    WaitForParent { parent_depth: u32, parent_due: i64 },
}

pub struct ResolutionWorker {
    queue: Arc<ResolutionQueue>,
    entities: Arc<EntityIndex>,
    resolver: Arc<EntityResolver>,
    fetcher: Arc<dyn MetadataFetcher>,
    persister: Arc<dyn EntityPersister>,
    policy: ResolutionPolicy,
}

impl ResolutionWorker {
    pub fn new(
        resolver: Arc<EntityResolver>,
        fetcher: Arc<dyn MetadataFetcher>,
        persister: Arc<dyn EntityPersister>,
        policy: ResolutionPolicy,
    ) -> Self {
        Self {
            queue: Arc::clone(resolver.queue()),
            entities: Arc::clone(resolver.entities()),
            resolver,
            fetcher,
            persister,
            policy,
        }
    }

    pub fn policy(&self) -> &ResolutionPolicy {
        &self.policy
    }

    /// Return entries stuck in `processing` to the queue.
    pub async fn reclaim_stale(&self) -> Result<usize> {
        self.queue
            .reclaim_stale(Utc::now().timestamp_millis(), self.policy.entry_timeout_ms)
            .await
    }

    /// Process at most one due entry.
    pub async fn run_once(&self, now_ms: i64) -> Result<StepOutcome> {
        let Some(entry) = self.queue.claim_next(now_ms).await? else {
            return Ok(StepOutcome::Idle);
        };
        let key = entry.key();

        if let Some(record) = self.entities.get(&key).await? {
            self.resolver.on_resolved(&record).await?;
            self.queue.complete(&key).await?;
            return Ok(StepOutcome::AlreadyResolved);
        }

        let attempt = timeout(self.policy.entry_timeout(), self.resolve(&entry)).await;
        let result = match attempt {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(format!(
                "resolving {key} took longer than {}ms",
                self.policy.entry_timeout_ms
            ))),
        };

        match result {
            Ok(Resolution::Resolved(record)) => {
                let flushed = self.resolver.on_resolved(&record).await?;
                self.queue.complete(&key).await?;
                event!(
                    Level::DEBUG,
                    volume_id = %key.volume,
                    frn = %key.frn,
                    entity_id = %record.entity_id,
                    attempts = entry.attempts + 1,
                    flushed,
                    "reference resolved"
                );
                Ok(StepOutcome::Resolved)
            }
            Ok(Resolution::WaitForParent {
                parent_depth,
                parent_due,
            }) => {
                let next = parent_due.max(now_ms).saturating_add(self.policy.defer_delay_ms as i64);
                self.queue
                    .defer(entry, parent_depth.saturating_add(1), next)
                    .await?;
                Ok(StepOutcome::Deferred)
            }
            Err(err @ PipelineError::StorageUnavailable(_)) => {
                // left in processing; reclaimed once it goes stale
                Err(err)
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => self.fail(entry, err, now_ms).await,
        }
    }

    async fn resolve(&self, entry: &ResolutionQueueEntry) -> Result<Resolution> {
        let metadata = self.fetcher.fetch(&entry.volume_id, entry.frn).await?;
        let parent = match metadata.parent_key() {
            None => None,
            Some(parent_key) => match self.entities.get(&parent_key).await? {
                Some(parent) => Some(parent),
                None => match self.parent_wait(entry, parent_key).await? {
                    Some(wait) => return Ok(wait),
                    // parent was given up on; resolve without it
                    None => None,
                },
            },
        };
        let record = self.persister.persist(&metadata, parent.as_ref()).await?;
        Ok(Resolution::Resolved(record))
    }

    async fn parent_wait(&self, entry: &ResolutionQueueEntry, parent_key: EntityKey) -> Result<Option<Resolution>> {
        match self.queue.get(&parent_key).await? {
            Some(parent) if parent.status == EntryStatus::Failed => Ok(None),
            Some(parent) => Ok(Some(Resolution::WaitForParent {
                parent_depth: parent.path_depth,
                parent_due: parent.next_attempt_at,
            })),
            None => {
                let parent_depth = entry.path_depth.saturating_sub(1);
                self.queue
                    .enqueue(ResolutionRequest {
                        key: parent_key,
                        entity_type_hint: EntityType::Directory,
                        path_depth: parent_depth,
                        priority: entry.priority.saturating_sub(1),
                    })
                    .await?;
                Ok(Some(Resolution::WaitForParent {
                    parent_depth,
                    parent_due: Utc::now().timestamp_millis(),
                }))
            }
        }
    }

    async fn fail(&self, entry: ResolutionQueueEntry, err: PipelineError, now_ms: i64) -> Result<StepOutcome> {
        let key = entry.key();
        let message = err.to_string();
        match self
            .queue
            .record_failure(entry, &message, &self.policy, now_ms)
            .await?
        {
            FailureOutcome::Retry {
                attempts,
                next_attempt_at,
            } => {
                event!(
                    Level::DEBUG,
                    volume_id = %key.volume,
                    frn = %key.frn,
                    attempts,
                    retry_in_ms = next_attempt_at - now_ms,
                    error = %message,
                    "resolution attempt failed"
                );
                Ok(StepOutcome::Retry)
            }
            FailureOutcome::DeadLettered { attempts } => {
                event!(
                    Level::WARN,
                    volume_id = %key.volume,
                    frn = %key.frn,
                    attempts,
                    error_kind = err.kind(),
                    error = %message,
                    "resolution dead-lettered"
                );
                self.resolver.on_failed(&key).await?;
                Ok(StepOutcome::DeadLettered)
            }
        }
    }

    /// Work the queue until nothing is due within the idle poll interval.
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport {
            reclaimed: self.reclaim_stale().await?,
            ..DrainReport::default()
        };
        let horizon = self.policy.defer_delay_ms.max(self.policy.idle_poll_ms) as i64;
        loop {
            let now = Utc::now().timestamp_millis();
            match self.run_once(now).await? {
                StepOutcome::Idle => match self.queue.next_due_at().await? {
                    Some(due) if due - now <= horizon => {
                        let wait = u64::try_from(due - now).unwrap_or(0);
                        sleep(Duration::from_millis(wait.max(1))).await;
                    }
                    _ => break,
                },
                outcome => report.record(outcome),
            }
        }
        Ok(report)
    }
}
