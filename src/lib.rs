// ============================================================================
// Activity Journal Library
// ============================================================================
//
// Change-journal capture with identity resolution and tiered retention:
//
//   journal  -> decode USN records, track per-volume cursors, read passes
//   resolver -> map (volume, FRN) to stable entity ids, hold unresolved events
//   worker   -> drain the durable resolution queue, parents before children
//   tier     -> hot-tier activity records, warm-tier summaries, transitions
//   pipeline -> wiring, background loops, status
//
// All state lives in a `storage::DocumentStore`; the durable implementation
// is a snapshot plus write-ahead log under one directory.

pub mod config;
pub mod core;
pub mod journal;
pub mod pipeline;
pub mod resolver;
pub mod storage;
pub mod tier;
pub mod worker;

pub use config::PipelineConfig;
pub use core::{EntityId, EntityKey, EventKind, Frn, PipelineError, Result, Usn, VolumeId};
pub use journal::{ChangeEvent, JournalSource, SpoolJournal};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineHandle, RunReport, StatusReport};
pub use storage::{DocumentStore, DurableDocumentStore, InMemoryDocumentStore};
pub use tier::{ActivityRecord, WarmSummary};
