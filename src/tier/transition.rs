//! Hot to warm tier transition.
//!
//! Each batch selects settled hot-tier records below the current window end,
//! records them as an in-flight claim on the checkpoint, merges them into
//! per-entity window summaries, deletes them from the hot tier and finally
//! advances the watermark. A crash anywhere before the last step leaves the
//! claim in place; the next run resumes exactly that record set, and the
//! batch id stored on each summary keeps the merge from counting twice.

use super::hot::{ActivityRecord, HotTierWriter};
use super::warm::{WarmStore, WarmSummary, summary_key};
use crate::config::{CheckpointScope, ImportanceWeights, TransitionPolicy};
use crate::core::{EntityId, PipelineError, Result};
use crate::storage::{Collection, DocumentStore, Filter, SortOrder, TypedCollection};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Level, event};

/// A batch that has been selected but not yet fully applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InFlightBatch {
    pub batch_id: u64,
    pub record_keys: Vec<String>,
    /// Recency reference for scoring; fixed so a retry scores identically.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub reference_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub window_end: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub max_timestamp: DateTime<Utc>,
    /// Selection hit `max_batch_size`; more records may share the window.
    pub full: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionCheckpoint {
    pub scope: String,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub watermark_timestamp: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_batch_id: u64,
    #[serde(default)]
    pub in_flight: Option<InFlightBatch>,
}

impl TransitionCheckpoint {
    fn new(scope: &CheckpointScope) -> Self {
        Self {
            scope: scope.key(),
            watermark_timestamp: None,
            last_run_at: None,
            next_batch_id: 1,
            in_flight: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub batch_id: u64,
    pub records: usize,
    pub summaries: usize,
    /// Summaries that already held this batch and were left untouched.
    pub skipped: usize,
    pub resumed: bool,
    pub watermark: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Nothing settled to transition.
    Idle,
    /// An empty stretch was skipped.
    Advanced { watermark: DateTime<Utc> },
    Applied(BatchReport),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransitionReport {
    pub batches: usize,
    pub records: usize,
    pub summaries: usize,
}

pub struct TransitionEngine {
    hot: Arc<HotTierWriter>,
    warm: Arc<WarmStore>,
    checkpoints: TypedCollection<TransitionCheckpoint>,
    policy: TransitionPolicy,
    weights: ImportanceWeights,
}

impl TransitionEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        hot: Arc<HotTierWriter>,
        warm: Arc<WarmStore>,
        policy: TransitionPolicy,
        weights: ImportanceWeights,
    ) -> Self {
        Self {
            hot,
            warm,
            checkpoints: TypedCollection::new(store, Collection::Checkpoints),
            policy,
            weights,
        }
    }

    pub fn policy(&self) -> &TransitionPolicy {
        &self.policy
    }

    pub async fn checkpoint(&self) -> Result<TransitionCheckpoint> {
        let key = self.policy.scope.key();
        Ok(self
            .checkpoints
            .get(&key)
            .await?
            .unwrap_or_else(|| TransitionCheckpoint::new(&self.policy.scope)))
    }

    pub async fn watermark(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.checkpoint().await?.watermark_timestamp)
    }

    async fn save(&self, checkpoint: &TransitionCheckpoint) -> Result<()> {
        self.checkpoints.put(&checkpoint.scope, checkpoint).await
    }

    fn scoped(&self, filter: Filter) -> Filter {
        match &self.policy.scope {
            CheckpointScope::Global => filter,
            CheckpointScope::Volume(volume) => filter.eq("volume_id", volume.as_str()),
        }
    }

    fn bucket_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.policy.batch_window_ms().max(1);
        let start = timestamp.timestamp_millis().div_euclid(width) * width;
        DateTime::from_timestamp_millis(start).unwrap_or(timestamp)
    }

    async fn earliest_record(&self) -> Result<Option<DateTime<Utc>>> {
        let filter = self.scoped(Filter::all()).order_by("timestamp", SortOrder::Asc).limit(1);
        let first = self.hot.records().query(&filter).await?.into_iter().next();
        Ok(first.map(|(_, record)| record.timestamp))
    }

    /// Run one batch, resuming an in-flight claim first if there is one.
    pub async fn run_batch(&self, now: DateTime<Utc>) -> Result<BatchOutcome> {
        let mut checkpoint = self.checkpoint().await?;
        if let Some(claim) = checkpoint.in_flight.clone() {
            event!(
                Level::INFO,
                scope = %checkpoint.scope,
                batch_id = claim.batch_id,
                records = claim.record_keys.len(),
                "resuming in-flight transition batch"
            );
            return self.apply(checkpoint, claim, true).await.map(BatchOutcome::Applied);
        }

        // checkpoints keep milliseconds; compare at the precision that is stored
        let now = truncate_millis(now);
        let horizon = now - Duration::milliseconds(self.policy.settle_delay_ms());
        let window_start = match checkpoint.watermark_timestamp {
            Some(watermark) => watermark,
            None => match self.earliest_record().await? {
                Some(first) => self.bucket_start(first),
                None => return Ok(BatchOutcome::Idle),
            },
        };
        if window_start >= horizon {
            return Ok(BatchOutcome::Idle);
        }
        let window_end = (window_start + Duration::milliseconds(self.policy.batch_window_ms())).min(horizon);

        let limit = self.policy.max_batch_size.max(1);
        let filter = self
            .scoped(Filter::all())
            .lt("timestamp", window_end.timestamp_millis())
            .order_by("timestamp", SortOrder::Asc)
            .order_by("sequence_no", SortOrder::Asc)
            .limit(limit);
        let selected = self.hot.records().query(&filter).await?;

        if selected.is_empty() {
            // jump to the next record, or as far as has settled
            let next = match self.earliest_record().await? {
                Some(first) => first.min(horizon),
                None => horizon,
            };
            let watermark = next.max(window_end);
            if checkpoint.watermark_timestamp.is_some_and(|current| watermark <= current) {
                return Ok(BatchOutcome::Idle);
            }
            checkpoint.watermark_timestamp = Some(watermark);
            checkpoint.last_run_at = Some(now);
            self.save(&checkpoint).await?;
            return Ok(BatchOutcome::Advanced { watermark });
        }

        let Some(max_timestamp) = selected.iter().map(|(_, record)| record.timestamp).max() else {
            return Ok(BatchOutcome::Idle);
        };
        let claim = InFlightBatch {
            batch_id: checkpoint.next_batch_id,
            record_keys: selected.iter().map(|(key, _)| key.clone()).collect(),
            reference_time: now,
            window_end,
            max_timestamp,
            full: selected.len() >= limit,
        };
        checkpoint.in_flight = Some(claim.clone());
        self.save(&checkpoint).await?;
        self.apply(checkpoint, claim, false).await.map(BatchOutcome::Applied)
    }

    async fn apply(
        &self,
        mut checkpoint: TransitionCheckpoint,
        claim: InFlightBatch,
        resumed: bool,
    ) -> Result<BatchReport> {
        let mut records: Vec<(String, ActivityRecord)> = Vec::with_capacity(claim.record_keys.len());
        for key in &claim.record_keys {
            // a key may be gone if an earlier attempt got as far as deleting
            if let Some(record) = self.hot.records().get(key).await? {
                records.push((key.clone(), record));
            }
        }

        let mut groups: BTreeMap<(EntityId, i64), Vec<&ActivityRecord>> = BTreeMap::new();
        for (_, record) in &records {
            let start = self.bucket_start(record.timestamp);
            groups
                .entry((record.entity_id.clone(), start.timestamp_millis()))
                .or_default()
                .push(record);
        }

        let now = Utc::now();
        let width = Duration::milliseconds(self.policy.batch_window_ms());
        let mut summaries = Vec::with_capacity(groups.len());
        let mut skipped = 0;
        for ((entity_id, start_ms), group) in groups {
            let window_start = DateTime::from_timestamp_millis(start_ms).unwrap_or(claim.window_end);
            let existing = self.warm.summaries().get(&summary_key(&entity_id, window_start)).await?;
            let mut summary = match existing {
                Some(summary) => {
                    if let Some(newer) = summary.applied_batches.range(claim.batch_id + 1..).next() {
                        let err = PipelineError::CheckpointInconsistency(format!(
                            "summary {} already holds batch {newer} but checkpoint '{}' is applying {}",
                            summary.storage_key(),
                            checkpoint.scope,
                            claim.batch_id
                        ));
                        event!(Level::ERROR, error_kind = err.kind(), error = %err, "transition halted");
                        return Err(err);
                    }
                    if summary.applied_batches.contains(&claim.batch_id) {
                        skipped += 1;
                        continue;
                    }
                    summary
                }
                None => WarmSummary::empty(entity_id, window_start, window_start + width),
            };
            for record in group {
                summary.add(record.event_kind, 1);
            }
            summary.applied_batches.insert(claim.batch_id);
            summary.rescore(&self.weights, claim.reference_time);
            summary.updated_at = now;
            summaries.push(summary);
        }

        self.warm.put_batch(&summaries).await?;
        let keys: Vec<String> = records.into_iter().map(|(key, _)| key).collect();
        let removed = self.hot.records().delete_batch(&keys).await?;

        let reached = if claim.full {
            claim.max_timestamp
        } else {
            claim.window_end
        };
        let watermark = match checkpoint.watermark_timestamp {
            Some(current) => current.max(reached),
            None => reached,
        };
        checkpoint.watermark_timestamp = Some(watermark);
        checkpoint.last_run_at = Some(now);
        checkpoint.in_flight = None;
        checkpoint.next_batch_id = claim.batch_id + 1;
        self.save(&checkpoint).await?;

        event!(
            Level::INFO,
            scope = %checkpoint.scope,
            batch_id = claim.batch_id,
            records = removed,
            summaries = summaries.len(),
            watermark = %watermark,
            "transition batch committed"
        );
        Ok(BatchReport {
            batch_id: claim.batch_id,
            records: removed,
            summaries: summaries.len(),
            skipped,
            resumed,
            watermark,
        })
    }

    /// Run batches until there is nothing settled left or `max_batches` ran.
    pub async fn run_until_idle(&self, now: DateTime<Utc>, max_batches: usize) -> Result<TransitionReport> {
        let mut report = TransitionReport::default();
        for _ in 0..max_batches.max(1) {
            match self.run_batch(now).await? {
                BatchOutcome::Idle => break,
                BatchOutcome::Advanced { .. } => {}
                BatchOutcome::Applied(batch) => {
                    report.batches += 1;
                    report.records += batch.records;
                    report.summaries += batch.summaries;
                }
            }
        }
        Ok(report)
    }

    /// TTL sweep bounded by this engine's watermark.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let watermark = self.watermark().await?;
        let volume = match &self.policy.scope {
            CheckpointScope::Global => None,
            CheckpointScope::Volume(volume) => Some(volume),
        };
        self.hot.sweep(now, watermark, volume).await
    }
}

fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}
