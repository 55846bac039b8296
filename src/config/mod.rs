//! Pipeline configuration.
//!
//! Every knob lives in a policy struct with its own `Default`; a JSON file may
//! set any subset of fields and CLI flags override the result. Durations are
//! plain integers suffixed with their unit.

use crate::core::{EventKind, PipelineError, Result, VolumeId};
use crate::storage::DurabilityMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Journal polling and decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalPolicy {
    /// Delay between incremental reads of one volume.
    pub poll_interval_ms: u64,
    /// Upper bound on bytes requested from the journal per read.
    pub read_chunk_bytes: usize,
    /// Size of the slices handed to the streaming decoder.
    pub decode_chunk_bytes: usize,
}

impl Default for JournalPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            read_chunk_bytes: 64 * 1024,
            decode_chunk_bytes: 4 * 1024,
        }
    }
}

impl JournalPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// In-process resolver state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverPolicy {
    /// Events held per unresolved entity before overflow is written unresolved.
    pub pending_buffer_capacity: usize,
    /// Resolved identities cached in memory.
    pub identity_cache_capacity: usize,
}

impl Default for ResolverPolicy {
    fn default() -> Self {
        Self {
            pending_buffer_capacity: 256,
            identity_cache_capacity: 10_000,
        }
    }
}

/// Resolution queue retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionPolicy {
    /// Attempts before an entry is dead-lettered.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
    /// Bound on one fetch + persist, and age after which `processing` is reclaimed.
    pub entry_timeout_ms: u64,
    /// Delay before a child waiting on its parent is retried.
    pub defer_delay_ms: u64,
    /// Sleep of the background worker when nothing is due.
    pub idle_poll_ms: u64,
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
            entry_timeout_ms: 30_000,
            defer_delay_ms: 250,
            idle_poll_ms: 1_000,
        }
    }
}

impl ResolutionPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }

    pub fn entry_timeout(&self) -> Duration {
        Duration::from_millis(self.entry_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotTierPolicy {
    pub ttl_secs: u64,
    pub sweep_interval_ms: u64,
}

impl Default for HotTierPolicy {
    fn default() -> Self {
        Self {
            ttl_secs: 7 * 24 * 3600,
            sweep_interval_ms: 10 * 60_000,
        }
    }
}

impl HotTierPolicy {
    pub fn ttl_ms(&self) -> i64 {
        i64::try_from(self.ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }
}

/// Which checkpoint a transition run advances.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointScope {
    #[default]
    Global,
    Volume(VolumeId),
}

impl CheckpointScope {
    pub fn key(&self) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::Volume(volume) => format!("volume:{volume}"),
        }
    }
}

/// Hot to warm aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionPolicy {
    /// Width of one aggregation window; also the warm bucket size.
    pub batch_window_secs: u64,
    pub max_batch_size: usize,
    /// Records younger than this are left for ingestion to settle.
    pub settle_delay_secs: u64,
    pub interval_ms: u64,
    /// Batches one periodic tick may run back to back.
    pub max_batches_per_tick: usize,
    pub scope: CheckpointScope,
}

impl Default for TransitionPolicy {
    fn default() -> Self {
        Self {
            batch_window_secs: 3600,
            max_batch_size: 5_000,
            settle_delay_secs: 300,
            interval_ms: 60_000,
            max_batches_per_tick: 16,
            scope: CheckpointScope::Global,
        }
    }
}

impl TransitionPolicy {
    pub fn batch_window_ms(&self) -> i64 {
        i64::try_from(self.batch_window_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    pub fn settle_delay_ms(&self) -> i64 {
        i64::try_from(self.settle_delay_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }
}

/// Inputs of the warm-tier importance score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportanceWeights {
    pub create: f64,
    pub modify: f64,
    pub delete: f64,
    pub rename: f64,
    pub metadata: f64,
    pub close: f64,
    pub frequency_scale: f64,
    pub recency_half_life_hours: f64,
}

impl Default for ImportanceWeights {
    fn default() -> Self {
        Self {
            create: 1.0,
            modify: 1.0,
            delete: 4.0,
            rename: 3.0,
            metadata: 0.5,
            close: 0.25,
            frequency_scale: 1.0,
            recency_half_life_hours: 72.0,
        }
    }
}

impl ImportanceWeights {
    pub fn weight(&self, kind: EventKind) -> f64 {
        match kind {
            EventKind::Create => self.create,
            EventKind::Modify => self.modify,
            EventKind::Delete => self.delete,
            EventKind::Rename => self.rename,
            EventKind::Metadata => self.metadata,
            EventKind::Close => self.close,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoragePolicy {
    /// Directory of the durable store; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub durability: DurabilityMode,
    /// WAL entries between snapshots.
    pub checkpoint_threshold: usize,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            data_dir: None,
            durability: DurabilityMode::Sync,
            checkpoint_threshold: 10_000,
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub volumes: Vec<String>,
    pub journal: JournalPolicy,
    pub resolver: ResolverPolicy,
    pub resolution: ResolutionPolicy,
    pub hot_tier: HotTierPolicy,
    pub transition: TransitionPolicy,
    pub importance: ImportanceWeights,
    pub storage: StoragePolicy,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; absent fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            PipelineError::InvalidConfig(format!("cannot read {}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            PipelineError::InvalidConfig(format!("cannot parse {}: {err}", path.display()))
        })
    }

    /// Set the monitored volumes
    pub fn volumes<I, S>(mut self, volumes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.volumes = volumes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the journal poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.journal.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the hot-tier TTL in days
    pub fn ttl_days(mut self, days: u64) -> Self {
        self.hot_tier.ttl_secs = days.saturating_mul(24 * 3600);
        self
    }

    /// Set the transition window
    pub fn batch_window(mut self, window: Duration) -> Self {
        self.transition.batch_window_secs = window.as_secs();
        self
    }

    /// Set the transition batch size
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.transition.max_batch_size = size;
        self
    }

    /// Set the resolution attempt limit
    pub fn max_resolution_attempts(mut self, attempts: u32) -> Self {
        self.resolution.max_attempts = attempts;
        self
    }

    /// Set the durable store directory
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.data_dir = Some(dir.into());
        self
    }

    pub fn volume_ids(&self) -> Vec<VolumeId> {
        self.volumes.iter().map(|v| VolumeId::new(v.as_str())).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.volumes.iter().any(|v| v.trim().is_empty()) {
            return Err(invalid("volume names must not be empty"));
        }
        let mut seen = std::collections::HashSet::new();
        for volume in &self.volumes {
            if !seen.insert(volume.as_str()) {
                return Err(invalid(format!("volume '{volume}' listed twice")));
            }
        }
        if self.journal.read_chunk_bytes == 0 || self.journal.decode_chunk_bytes == 0 {
            return Err(invalid("journal chunk sizes must be positive"));
        }
        if self.resolver.pending_buffer_capacity == 0 {
            return Err(invalid("resolver.pending_buffer_capacity must be positive"));
        }
        if self.resolver.identity_cache_capacity == 0 {
            return Err(invalid("resolver.identity_cache_capacity must be positive"));
        }
        if self.resolution.max_attempts == 0 {
            return Err(invalid("resolution.max_attempts must be at least 1"));
        }
        if self.resolution.initial_backoff_ms > self.resolution.max_backoff_ms {
            return Err(invalid(
                "resolution.initial_backoff_ms exceeds resolution.max_backoff_ms",
            ));
        }
        if self.resolution.entry_timeout_ms == 0 {
            return Err(invalid("resolution.entry_timeout_ms must be positive"));
        }
        if self.hot_tier.ttl_secs == 0 {
            return Err(invalid("hot_tier.ttl_secs must be positive"));
        }
        if self.transition.batch_window_secs == 0 {
            return Err(invalid("transition.batch_window_secs must be positive"));
        }
        if self.transition.max_batch_size == 0 {
            return Err(invalid("transition.max_batch_size must be positive"));
        }
        if self.transition.max_batches_per_tick == 0 {
            return Err(invalid("transition.max_batches_per_tick must be positive"));
        }
        // records must still be in the hot tier when their window is aggregated
        if self.hot_tier.ttl_secs <= self.transition.settle_delay_secs + self.transition.batch_window_secs {
            return Err(invalid(
                "hot_tier.ttl_secs must exceed transition settle delay plus batch window",
            ));
        }
        let w = &self.importance;
        let weights = [w.create, w.modify, w.delete, w.rename, w.metadata, w.close];
        if weights.iter().any(|x| !x.is_finite() || *x < 0.0) {
            return Err(invalid("importance weights must be finite and non-negative"));
        }
        if !(w.frequency_scale.is_finite() && w.frequency_scale > 0.0) {
            return Err(invalid("importance.frequency_scale must be positive"));
        }
        if !(w.recency_half_life_hours.is_finite() && w.recency_half_life_hours > 0.0) {
            return Err(invalid("importance.recency_half_life_hours must be positive"));
        }
        if self.storage.checkpoint_threshold == 0 {
            return Err(invalid("storage.checkpoint_threshold must be positive"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::InvalidConfig(message.into())
}
