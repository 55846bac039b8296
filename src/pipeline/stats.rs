use crate::journal::PassReport;
use crate::tier::TransitionReport;
use crate::worker::{DrainReport, StepOutcome};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime counters. Not persisted.
#[derive(Debug, Default)]
pub struct PipelineStats {
    passes: AtomicU64,
    events_read: AtomicU64,
    events_written: AtomicU64,
    events_buffered: AtomicU64,
    events_unresolved: AtomicU64,
    duplicates: AtomicU64,
    malformed_records: AtomicU64,
    rescans: AtomicU64,
    resolved: AtomicU64,
    deferred: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    batches: AtomicU64,
    records_transitioned: AtomicU64,
    summaries_written: AtomicU64,
    records_swept: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub passes: u64,
    pub events_read: u64,
    pub events_written: u64,
    pub events_buffered: u64,
    pub events_unresolved: u64,
    pub duplicates: u64,
    pub malformed_records: u64,
    pub rescans: u64,
    pub resolved: u64,
    pub deferred: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub batches: u64,
    pub records_transitioned: u64,
    pub summaries_written: u64,
    pub records_swept: u64,
    pub errors: u64,
}

fn bump(counter: &AtomicU64, by: usize) {
    counter.fetch_add(by as u64, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn on_pass(&self, report: &PassReport) {
        bump(&self.passes, 1);
        bump(&self.events_read, report.events);
        bump(&self.events_written, report.written);
        bump(&self.events_buffered, report.buffered);
        bump(&self.events_unresolved, report.unresolved);
        bump(&self.duplicates, report.duplicates);
        bump(&self.malformed_records, report.malformed);
        if report.rescan.is_some() {
            bump(&self.rescans, 1);
        }
    }

    pub fn on_step(&self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Resolved | StepOutcome::AlreadyResolved => bump(&self.resolved, 1),
            StepOutcome::Deferred => bump(&self.deferred, 1),
            StepOutcome::Retry => bump(&self.retried, 1),
            StepOutcome::DeadLettered => bump(&self.dead_lettered, 1),
            StepOutcome::Idle => {}
        }
    }

    pub fn on_drain(&self, report: &DrainReport) {
        bump(&self.resolved, report.resolved);
        bump(&self.deferred, report.deferred);
        bump(&self.retried, report.retried);
        bump(&self.dead_lettered, report.dead_lettered);
    }

    pub fn on_transition(&self, report: &TransitionReport) {
        bump(&self.batches, report.batches);
        bump(&self.records_transitioned, report.records);
        bump(&self.summaries_written, report.summaries);
    }

    pub fn on_sweep(&self, removed: usize) {
        bump(&self.records_swept, removed);
    }

    pub fn on_error(&self) {
        bump(&self.errors, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            passes: load(&self.passes),
            events_read: load(&self.events_read),
            events_written: load(&self.events_written),
            events_buffered: load(&self.events_buffered),
            events_unresolved: load(&self.events_unresolved),
            duplicates: load(&self.duplicates),
            malformed_records: load(&self.malformed_records),
            rescans: load(&self.rescans),
            resolved: load(&self.resolved),
            deferred: load(&self.deferred),
            retried: load(&self.retried),
            dead_lettered: load(&self.dead_lettered),
            batches: load(&self.batches),
            records_transitioned: load(&self.records_transitioned),
            summaries_written: load(&self.summaries_written),
            records_swept: load(&self.records_swept),
            errors: load(&self.errors),
        }
    }
}
