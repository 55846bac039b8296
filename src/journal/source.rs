use crate::core::{Frn, Result, Usn, VolumeId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Live journal identity and extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalMetadata {
    pub journal_id: u64,
    /// Oldest usn still present in the journal.
    pub first_usn: Usn,
    /// Usn the next appended record will get.
    pub next_usn: Usn,
}

/// Whole records starting at the requested usn.
#[derive(Debug, Clone)]
pub struct JournalRead {
    pub records: Bytes,
    /// Where the following read should start.
    pub next_usn: Usn,
}

/// OS-level journal access for one or more volumes.
#[async_trait]
pub trait JournalSource: Send + Sync {
    async fn metadata(&self, volume: &VolumeId) -> Result<JournalMetadata>;

    /// Read records with usn >= `start_usn`, at most `max_bytes` unless a
    /// single record is larger. An empty read means the reader is caught up.
    async fn read(&self, volume: &VolumeId, start_usn: Usn, max_bytes: usize) -> Result<JournalRead>;
}

/// One object found by a full directory-tree walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineEntry {
    pub frn: Frn,
    pub parent_frn: Frn,
    pub name: String,
    pub is_directory: bool,
}

/// Full-volume listing used when the journal position cannot be trusted.
#[async_trait]
pub trait BaselineScanner: Send + Sync {
    async fn scan(&self, volume: &VolumeId, metadata: &JournalMetadata) -> Result<Vec<BaselineEntry>>;
}
