use super::source::JournalMetadata;
use crate::core::{PipelineError, Result, Usn, VolumeId};
use crate::storage::{Collection, DocumentStore, Filter, SortOrder, TypedCollection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{Level, event};

/// Last durably processed journal position of one volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalCursor {
    pub volume_id: VolumeId,
    pub journal_id: u64,
    pub last_usn: Usn,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescanReason {
    /// No cursor was ever committed.
    Missing,
    /// The journal was recreated.
    JournalReset { stored: u64, current: u64 },
    /// The stored position is no longer inside the journal.
    UsnGap { last_usn: Usn, first_usn: Usn, next_usn: Usn },
}

impl std::fmt::Display for RescanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "no stored cursor"),
            Self::JournalReset { stored, current } => {
                write!(f, "journal id changed from {stored:#x} to {current:#x}")
            }
            Self::UsnGap {
                last_usn,
                first_usn,
                next_usn,
            } => write!(
                f,
                "stored usn {last_usn} outside journal range [{first_usn}, {next_usn})"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorCheck {
    Resume { from: Usn },
    RescanRequired(RescanReason),
}

impl CursorCheck {
    pub fn discontinuity(&self, volume: &VolumeId) -> Option<PipelineError> {
        match self {
            Self::Resume { .. } | Self::RescanRequired(RescanReason::Missing) => None,
            Self::RescanRequired(reason) => Some(PipelineError::JournalDiscontinuity {
                volume: volume.clone(),
                reason: reason.to_string(),
            }),
        }
    }
}

/// Persisted per-volume journal positions.
#[derive(Clone)]
pub struct CursorStore {
    cursors: TypedCollection<JournalCursor>,
}

impl CursorStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            cursors: TypedCollection::new(store, Collection::Cursors),
        }
    }

    pub async fn load(&self, volume: &VolumeId) -> Result<JournalCursor> {
        self.try_load(volume)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("cursor for volume '{volume}'")))
    }

    pub async fn try_load(&self, volume: &VolumeId) -> Result<Option<JournalCursor>> {
        self.cursors.get(volume.as_str()).await
    }

    /// Compare the stored cursor with the live journal.
    pub async fn check(&self, volume: &VolumeId, metadata: &JournalMetadata) -> Result<CursorCheck> {
        let Some(cursor) = self.try_load(volume).await? else {
            return Ok(CursorCheck::RescanRequired(RescanReason::Missing));
        };
        if cursor.journal_id != metadata.journal_id {
            return Ok(CursorCheck::RescanRequired(RescanReason::JournalReset {
                stored: cursor.journal_id,
                current: metadata.journal_id,
            }));
        }
        let from = cursor.last_usn.next();
        if from < metadata.first_usn || cursor.last_usn >= metadata.next_usn {
            return Ok(CursorCheck::RescanRequired(RescanReason::UsnGap {
                last_usn: cursor.last_usn,
                first_usn: metadata.first_usn,
                next_usn: metadata.next_usn,
            }));
        }
        Ok(CursorCheck::Resume { from })
    }

    /// Record that everything up to and including `usn` is durable downstream.
    ///
    /// Returns whether the cursor moved. Within one journal id the position
    /// never goes backwards; a regression is reported, not applied.
    pub async fn commit(&self, volume: &VolumeId, journal_id: u64, usn: Usn) -> Result<bool> {
        if let Some(current) = self.try_load(volume).await? {
            if current.journal_id == journal_id {
                if usn == current.last_usn {
                    return Ok(false);
                }
                if usn < current.last_usn {
                    let err = PipelineError::CheckpointInconsistency(format!(
                        "cursor for '{volume}' would move back from {} to {usn}",
                        current.last_usn
                    ));
                    event!(
                        Level::ERROR,
                        volume_id = %volume,
                        usn = usn.0,
                        error_kind = err.kind(),
                        "refusing cursor regression"
                    );
                    return Err(err);
                }
            }
        }
        let cursor = JournalCursor {
            volume_id: volume.clone(),
            journal_id,
            last_usn: usn,
            updated_at: Utc::now(),
        };
        self.cursors.put(volume.as_str(), &cursor).await?;
        event!(Level::DEBUG, volume_id = %volume, usn = usn.0, "cursor committed");
        Ok(true)
    }

    /// Overwrite the stored position after a rescan, even if it moves back.
    pub async fn rebase(&self, volume: &VolumeId, journal_id: u64, usn: Usn) -> Result<()> {
        let cursor = JournalCursor {
            volume_id: volume.clone(),
            journal_id,
            last_usn: usn,
            updated_at: Utc::now(),
        };
        self.cursors.put(volume.as_str(), &cursor).await?;
        event!(
            Level::INFO,
            volume_id = %volume,
            journal_id,
            usn = usn.0,
            "cursor rebased after rescan"
        );
        Ok(())
    }

    /// Forget the stored position so the next pass rescans the volume.
    pub async fn reset(&self, volume: &VolumeId) -> Result<bool> {
        let removed = self.cursors.delete(volume.as_str()).await?;
        if removed {
            event!(Level::INFO, volume_id = %volume, "cursor reset");
        }
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<JournalCursor>> {
        let rows = self
            .cursors
            .query(&Filter::all().order_by("volume_id", SortOrder::Asc))
            .await?;
        Ok(rows.into_iter().map(|(_, cursor)| cursor).collect())
    }
}
