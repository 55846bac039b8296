//! Retention tiers: raw activity in the hot tier, per-window summaries in
//! the warm tier, and the engine that moves one into the other.

pub mod hot;
pub mod transition;
pub mod warm;

pub use hot::{ActivityRecord, HotTierWriter};
pub use transition::{BatchOutcome, BatchReport, InFlightBatch, TransitionCheckpoint, TransitionEngine, TransitionReport};
pub use warm::{WarmStore, WarmSummary, importance_score};
