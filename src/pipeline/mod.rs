//! Wiring of the capture and retention components.
//!
//! `Pipeline::run_once` runs every stage once in order, which is what the
//! tests and `run --once` use. `Pipeline::start` runs the same stages as
//! independent background loops.

pub mod handle;
pub mod stats;

use crate::config::PipelineConfig;
use crate::core::{PipelineError, Result, VolumeId};
use crate::journal::{
    BaselineScanner, CursorStore, JournalCursor, JournalSource, PassReport, SpoolJournal, VolumeReader,
};
use crate::resolver::{EntityIndex, EntityResolver, QueueCounts, ResolutionQueue, ResolutionQueueEntry};
use crate::storage::{DocumentStore, DurableDocumentStore, InMemoryDocumentStore};
use crate::tier::{HotTierWriter, TransitionCheckpoint, TransitionEngine, TransitionReport, WarmStore};
use crate::worker::{
    DrainReport, EntityPersister, MetadataFetcher, MetadataObserver, ObservedMetadataFetcher,
    ResolutionWorker, StepOutcome, StoreEntityPersister,
};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, event};

pub use handle::{PipelineHandle, WorkerHandle, spawn_periodic};
pub use stats::{PipelineStats, StatsSnapshot};

/// Steps one background worker tick takes before yielding.
const WORKER_STEPS_PER_TICK: usize = 64;

#[derive(Debug, Clone, Default, Serialize)]
pub struct VolumeFailure {
    pub volume_id: String,
    pub error_kind: String,
    pub error: String,
}

/// Outcome of `Pipeline::run_once`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub passes: Vec<PassReport>,
    pub failures: Vec<VolumeFailure>,
    pub resolution: DrainReport,
    pub transition: TransitionReport,
    pub swept: usize,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Everything `status` prints.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub cursors: Vec<JournalCursor>,
    pub queue: QueueCounts,
    pub dead_letters: Vec<ResolutionQueueEntry>,
    pub checkpoint: TransitionCheckpoint,
    pub entities: usize,
    pub hot_records: usize,
    pub warm_summaries: usize,
    pub held_keys: usize,
    pub stats: StatsSnapshot,
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    store: Option<Arc<dyn DocumentStore>>,
    source: Option<Arc<dyn JournalSource>>,
    scanner: Option<Arc<dyn BaselineScanner>>,
    fetcher: Option<Arc<dyn MetadataFetcher>>,
    persister: Option<Arc<dyn EntityPersister>>,
    observer: Option<Arc<dyn MetadataObserver>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            store: None,
            source: None,
            scanner: None,
            fetcher: None,
            persister: None,
            observer: None,
        }
    }

    /// Use this store instead of the one `storage` describes.
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn journal(mut self, source: Arc<dyn JournalSource>, scanner: Arc<dyn BaselineScanner>) -> Self {
        self.source = Some(source);
        self.scanner = Some(scanner);
        self
    }

    pub fn spool(self, spool: SpoolJournal) -> Self {
        let spool = Arc::new(spool);
        self.journal(Arc::clone(&spool) as Arc<dyn JournalSource>, spool)
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn MetadataFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn persister(mut self, persister: Arc<dyn EntityPersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn MetadataObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub async fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let config = self.config;
        let source = self
            .source
            .ok_or_else(|| PipelineError::InvalidConfig("no journal source configured".into()))?;
        let scanner = self
            .scanner
            .ok_or_else(|| PipelineError::InvalidConfig("no baseline scanner configured".into()))?;

        let (store, durable) = match (self.store, &config.storage.data_dir) {
            (Some(store), _) => (store, None),
            (None, Some(dir)) => {
                let durable = Arc::new(
                    DurableDocumentStore::open(
                        dir,
                        config.storage.durability,
                        config.storage.checkpoint_threshold,
                    )
                    .await?,
                );
                event!(Level::INFO, data_dir = %dir.display(), "durable store opened");
                (Arc::clone(&durable) as Arc<dyn DocumentStore>, Some(durable))
            }
            (None, None) => (
                Arc::new(InMemoryDocumentStore::new()) as Arc<dyn DocumentStore>,
                None,
            ),
        };

        let entities = Arc::new(EntityIndex::new(
            Arc::clone(&store),
            config.resolver.identity_cache_capacity,
        ));
        let queue = Arc::new(ResolutionQueue::new(Arc::clone(&store)));
        let hot = Arc::new(HotTierWriter::new(Arc::clone(&store), config.hot_tier.ttl_ms()));
        let warm = Arc::new(WarmStore::new(Arc::clone(&store)));

        let (fetcher, observer) = match self.fetcher {
            Some(fetcher) => (fetcher, self.observer),
            None => {
                let observed = Arc::new(ObservedMetadataFetcher::new());
                let observer = self
                    .observer
                    .unwrap_or_else(|| Arc::clone(&observed) as Arc<dyn MetadataObserver>);
                (observed as Arc<dyn MetadataFetcher>, Some(observer))
            }
        };
        let persister = self
            .persister
            .unwrap_or_else(|| Arc::new(StoreEntityPersister::new(Arc::clone(&entities))) as Arc<dyn EntityPersister>);

        let mut resolver = EntityResolver::new(
            Arc::clone(&entities),
            Arc::clone(&queue),
            Arc::clone(&hot),
            config.resolver.pending_buffer_capacity,
        );
        if let Some(observer) = observer {
            resolver = resolver.with_observer(observer);
        }
        let resolver = Arc::new(resolver);

        let worker = Arc::new(ResolutionWorker::new(
            Arc::clone(&resolver),
            fetcher,
            persister,
            config.resolution.clone(),
        ));
        let transition = Arc::new(TransitionEngine::new(
            Arc::clone(&store),
            Arc::clone(&hot),
            Arc::clone(&warm),
            config.transition.clone(),
            config.importance.clone(),
        ));
        let cursors = CursorStore::new(Arc::clone(&store));
        let readers = config
            .volume_ids()
            .into_iter()
            .map(|volume| {
                Arc::new(VolumeReader::new(
                    volume,
                    Arc::clone(&source),
                    Arc::clone(&scanner),
                    cursors.clone(),
                    Arc::clone(&resolver),
                    config.journal.clone(),
                ))
            })
            .collect();

        Ok(Pipeline {
            config,
            store,
            durable,
            cursors,
            entities,
            queue,
            resolver,
            worker,
            hot,
            warm,
            transition,
            readers,
            stats: Arc::new(PipelineStats::default()),
        })
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn DocumentStore>,
    durable: Option<Arc<DurableDocumentStore>>,
    cursors: CursorStore,
    entities: Arc<EntityIndex>,
    queue: Arc<ResolutionQueue>,
    resolver: Arc<EntityResolver>,
    worker: Arc<ResolutionWorker>,
    hot: Arc<HotTierWriter>,
    warm: Arc<WarmStore>,
    transition: Arc<TransitionEngine>,
    readers: Vec<Arc<VolumeReader>>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    pub fn entities(&self) -> &Arc<EntityIndex> {
        &self.entities
    }

    pub fn queue(&self) -> &Arc<ResolutionQueue> {
        &self.queue
    }

    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.resolver
    }

    pub fn worker(&self) -> &Arc<ResolutionWorker> {
        &self.worker
    }

    pub fn hot(&self) -> &Arc<HotTierWriter> {
        &self.hot
    }

    pub fn warm(&self) -> &Arc<WarmStore> {
        &self.warm
    }

    pub fn transition(&self) -> &Arc<TransitionEngine> {
        &self.transition
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// One reader pass per volume, concurrently.
    pub async fn read_volumes(&self) -> Result<(Vec<PassReport>, Vec<VolumeFailure>)> {
        let results = join_all(self.readers.iter().map(|reader| reader.pass())).await;
        let mut passes = Vec::new();
        let mut failures = Vec::new();
        for (reader, result) in self.readers.iter().zip(results) {
            match result {
                Ok(report) => {
                    self.stats.on_pass(&report);
                    passes.push(report);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    self.stats.on_error();
                    event!(
                        Level::WARN,
                        volume_id = %reader.volume(),
                        error_kind = err.kind(),
                        error = %err,
                        "volume pass aborted"
                    );
                    failures.push(VolumeFailure {
                        volume_id: reader.volume().to_string(),
                        error_kind: err.kind().to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok((passes, failures))
    }

    /// Every stage once: read, resolve, transition, sweep.
    pub async fn run_once(&self) -> Result<RunReport> {
        let (passes, failures) = self.read_volumes().await?;
        let resolution = self.worker.drain().await?;
        self.stats.on_drain(&resolution);

        let now = Utc::now();
        let transition = self.transition.run_until_idle(now, usize::MAX).await?;
        self.stats.on_transition(&transition);
        let swept = self.transition.sweep_expired(now).await?;
        self.stats.on_sweep(swept);

        Ok(RunReport {
            passes,
            failures,
            resolution,
            transition,
            swept,
        })
    }

    /// Spawn the background loops.
    pub fn start(self: &Arc<Self>) -> PipelineHandle {
        let mut workers = Vec::new();

        let poll = self.config.journal.poll_interval();
        for reader in &self.readers {
            let reader = Arc::clone(reader);
            let stats = Arc::clone(&self.stats);
            let name = format!("reader:{}", reader.volume());
            workers.push(spawn_periodic(name, poll, move || {
                let reader = Arc::clone(&reader);
                let stats = Arc::clone(&stats);
                async move {
                    match reader.pass().await {
                        Ok(report) => {
                            stats.on_pass(&report);
                            Ok(false)
                        }
                        Err(err) => {
                            stats.on_error();
                            Err(err)
                        }
                    }
                }
            }));
        }

        let worker = Arc::clone(&self.worker);
        let stats = Arc::clone(&self.stats);
        let idle = Duration::from_millis(self.config.resolution.idle_poll_ms.max(10));
        workers.push(spawn_periodic("resolution", idle, move || {
            let worker = Arc::clone(&worker);
            let stats = Arc::clone(&stats);
            async move {
                worker.reclaim_stale().await?;
                for _ in 0..WORKER_STEPS_PER_TICK {
                    let outcome = worker.run_once(Utc::now().timestamp_millis()).await?;
                    stats.on_step(outcome);
                    if outcome == StepOutcome::Idle {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }));

        let transition = Arc::clone(&self.transition);
        let stats = Arc::clone(&self.stats);
        let per_tick = self.config.transition.max_batches_per_tick.max(1);
        let interval = Duration::from_millis(self.config.transition.interval_ms.max(10));
        workers.push(spawn_periodic("transition", interval, move || {
            let transition = Arc::clone(&transition);
            let stats = Arc::clone(&stats);
            async move {
                let report = transition.run_until_idle(Utc::now(), per_tick).await?;
                stats.on_transition(&report);
                Ok(report.batches >= per_tick)
            }
        }));

        let transition = Arc::clone(&self.transition);
        let stats = Arc::clone(&self.stats);
        let interval = Duration::from_millis(self.config.hot_tier.sweep_interval_ms.max(10));
        workers.push(spawn_periodic("sweep", interval, move || {
            let transition = Arc::clone(&transition);
            let stats = Arc::clone(&stats);
            async move {
                let removed = transition.sweep_expired(Utc::now()).await?;
                stats.on_sweep(removed);
                Ok(false)
            }
        }));

        event!(
            Level::INFO,
            volumes = self.readers.len(),
            workers = workers.len(),
            "pipeline started"
        );
        PipelineHandle::new(Arc::clone(self), workers)
    }

    /// Snapshot the durable store, if there is one.
    pub async fn checkpoint(&self) -> Result<()> {
        if let Some(durable) = &self.durable {
            durable.checkpoint().await?;
        }
        Ok(())
    }

    pub async fn reset_cursor(&self, volume: &VolumeId) -> Result<bool> {
        self.cursors.reset(volume).await
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<ResolutionQueueEntry>> {
        self.queue.list_dead_letters().await
    }

    pub async fn requeue_dead_letters(&self) -> Result<usize> {
        self.queue.requeue_dead_letters().await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            cursors: self.cursors.list().await?,
            queue: self.queue.counts().await?,
            dead_letters: self.queue.list_dead_letters().await?,
            checkpoint: self.transition.checkpoint().await?,
            entities: self.entities.count().await?,
            hot_records: self.hot.count().await?,
            warm_summaries: self.warm.count().await?,
            held_keys: self.resolver.held_keys()?,
            stats: self.stats.snapshot(),
        })
    }
}
