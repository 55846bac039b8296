use crate::config::ImportanceWeights;
use crate::core::{EntityId, EventKind, Result};
use crate::storage::{Collection, DocumentStore, Filter, SortOrder, TypedCollection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Per-entity, per-window aggregate in the warm tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmSummary {
    pub entity_id: EntityId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub window_start: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub window_end: DateTime<Utc>,
    pub event_counts_by_kind: BTreeMap<EventKind, u64>,
    pub importance_score: f64,
    /// Transition batches already merged into this summary.
    #[serde(default)]
    pub applied_batches: BTreeSet<u64>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl WarmSummary {
    pub fn empty(entity_id: EntityId, window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            window_start,
            window_end,
            event_counts_by_kind: BTreeMap::new(),
            importance_score: 0.0,
            applied_batches: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn storage_key(&self) -> String {
        summary_key(&self.entity_id, self.window_start)
    }

    pub fn total_events(&self) -> u64 {
        self.event_counts_by_kind.values().sum()
    }

    pub fn add(&mut self, kind: EventKind, count: u64) {
        *self.event_counts_by_kind.entry(kind).or_insert(0) += count;
    }

    /// `ln(1 + Σ weight·count) · scale · 2^(-age_hours / half_life)`, with age
    /// taken from the window end to `reference`.
    pub fn rescore(&mut self, weights: &ImportanceWeights, reference: DateTime<Utc>) {
        self.importance_score = importance_score(&self.event_counts_by_kind, weights, self.window_end, reference);
    }
}

pub fn summary_key(entity_id: &EntityId, window_start: DateTime<Utc>) -> String {
    format!("{entity_id}@{}", window_start.timestamp_millis())
}

pub fn importance_score(
    counts: &BTreeMap<EventKind, u64>,
    weights: &ImportanceWeights,
    window_end: DateTime<Utc>,
    reference: DateTime<Utc>,
) -> f64 {
    let weighted: f64 = counts
        .iter()
        .map(|(kind, count)| weights.weight(*kind) * *count as f64)
        .sum();
    let age_hours = ((reference - window_end).num_milliseconds().max(0)) as f64 / 3_600_000.0;
    let decay = if weights.recency_half_life_hours > 0.0 {
        (-age_hours / weights.recency_half_life_hours).exp2()
    } else {
        1.0
    };
    weighted.ln_1p() * weights.frequency_scale * decay
}

/// Warm-tier summaries keyed by entity and window start.
pub struct WarmStore {
    summaries: TypedCollection<WarmSummary>,
}

impl WarmStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            summaries: TypedCollection::new(store, Collection::WarmTier),
        }
    }

    pub fn summaries(&self) -> &TypedCollection<WarmSummary> {
        &self.summaries
    }

    pub async fn get(&self, entity_id: &EntityId, window_start: DateTime<Utc>) -> Result<Option<WarmSummary>> {
        self.summaries.get(&summary_key(entity_id, window_start)).await
    }

    pub async fn for_entity(&self, entity_id: &EntityId) -> Result<Vec<WarmSummary>> {
        let rows = self
            .summaries
            .query(
                &Filter::all()
                    .eq("entity_id", entity_id.as_str())
                    .order_by("window_start", SortOrder::Asc),
            )
            .await?;
        Ok(rows.into_iter().map(|(_, summary)| summary).collect())
    }

    pub async fn count(&self) -> Result<usize> {
        self.summaries.count(&Filter::all()).await
    }

    pub async fn put_batch(&self, summaries: &[WarmSummary]) -> Result<()> {
        let rows: Vec<(String, WarmSummary)> = summaries
            .iter()
            .map(|summary| (summary.storage_key(), summary.clone()))
            .collect();
        self.summaries.put_batch(&rows).await
    }
}
