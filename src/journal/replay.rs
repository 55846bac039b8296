//! Spool-directory journal backend.
//!
//! ```text
//! <spool>/<volume>/journal.json   {"journal_id": .., "first_usn": .., "next_usn": ..}
//! <spool>/<volume>/journal.usn    concatenated journal records
//! <spool>/<volume>/baseline.usn   optional full-tree listing, same record format
//! ```
//!
//! Captured journals replay through this source exactly as a live volume
//! would, which is also how the binary runs on hosts without a change journal.

use super::decoder::{ChangeEvent, decode_buffer, encode_record, peek_record};
use super::reason::{CLOSE, ReasonFlags};
use super::source::{BaselineEntry, BaselineScanner, JournalMetadata, JournalRead, JournalSource};
use crate::core::{PipelineError, Result, Usn, VolumeId};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{Level, event, warn};

const MANIFEST_FILE: &str = "journal.json";
const RECORDS_FILE: &str = "journal.usn";
const BASELINE_FILE: &str = "baseline.usn";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpoolManifest {
    journal_id: u64,
    #[serde(default)]
    first_usn: Usn,
    /// Derived from the last record when absent.
    #[serde(default)]
    next_usn: Option<Usn>,
}

#[derive(Debug, Clone)]
pub struct SpoolJournal {
    root: PathBuf,
}

impl SpoolJournal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn volume_dir(&self, volume: &VolumeId) -> PathBuf {
        let name: String = volume
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(name)
    }

    async fn manifest(&self, volume: &VolumeId) -> Result<SpoolManifest> {
        let path = self.volume_dir(volume).join(MANIFEST_FILE);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::NotFound(format!("spool journal for volume '{volume}'")));
            }
            Err(err) => return Err(PipelineError::storage(format!("read {}: {err}", path.display()))),
        };
        serde_json::from_str(&raw)
            .map_err(|err| PipelineError::Serialization(format!("{}: {err}", path.display())))
    }

    async fn write_manifest(&self, volume: &VolumeId, manifest: &SpoolManifest) -> Result<()> {
        let dir = self.volume_dir(volume);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| PipelineError::storage(format!("create {}: {err}", dir.display())))?;
        let path = dir.join(MANIFEST_FILE);
        let temp = path.with_extension("tmp");
        let body = serde_json::to_vec_pretty(manifest)?;
        fs::write(&temp, body)
            .await
            .map_err(|err| PipelineError::storage(format!("write {}: {err}", temp.display())))?;
        fs::rename(&temp, &path)
            .await
            .map_err(|err| PipelineError::storage(format!("rename {}: {err}", path.display())))
    }

    async fn read_file(&self, volume: &VolumeId, file: &str) -> Result<Option<Vec<u8>>> {
        let path = self.volume_dir(volume).join(file);
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(PipelineError::storage(format!("read {}: {err}", path.display()))),
        }
    }

    async fn append_file(&self, volume: &VolumeId, file: &str, data: &[u8]) -> Result<()> {
        let dir = self.volume_dir(volume);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| PipelineError::storage(format!("create {}: {err}", dir.display())))?;
        let path = dir.join(file);
        let mut handle = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| PipelineError::storage(format!("open {}: {err}", path.display())))?;
        handle
            .write_all(data)
            .await
            .map_err(|err| PipelineError::storage(format!("append {}: {err}", path.display())))?;
        handle
            .flush()
            .await
            .map_err(|err| PipelineError::storage(format!("flush {}: {err}", path.display())))
    }

    /// Create (or re-identify) a volume's journal.
    pub async fn init_volume(&self, volume: &VolumeId, journal_id: u64, first_usn: Usn) -> Result<()> {
        let manifest = SpoolManifest {
            journal_id,
            first_usn,
            next_usn: None,
        };
        self.write_manifest(volume, &manifest).await
    }

    /// Simulate the OS recreating the journal: new id, records discarded,
    /// numbering continues after the old journal's end.
    pub async fn recreate(&self, volume: &VolumeId, journal_id: u64) -> Result<()> {
        let old = self.metadata(volume).await?;
        let path = self.volume_dir(volume).join(RECORDS_FILE);
        fs::write(&path, b"")
            .await
            .map_err(|err| PipelineError::storage(format!("truncate {}: {err}", path.display())))?;
        let manifest = SpoolManifest {
            journal_id,
            first_usn: old.next_usn,
            next_usn: Some(old.next_usn),
        };
        self.write_manifest(volume, &manifest).await
    }

    pub async fn append(&self, volume: &VolumeId, events: &[ChangeEvent]) -> Result<()> {
        let data: Vec<u8> = events.iter().flat_map(encode_record).collect();
        self.append_raw(volume, &data).await?;
        // appended records supersede a fixed end position
        let mut manifest = self.manifest(volume).await?;
        if manifest.next_usn.take().is_some() {
            self.write_manifest(volume, &manifest).await?;
        }
        Ok(())
    }

    /// Append bytes verbatim, e.g. a captured `FSCTL_READ_USN_JOURNAL` payload.
    pub async fn append_raw(&self, volume: &VolumeId, data: &[u8]) -> Result<()> {
        self.append_file(volume, RECORDS_FILE, data).await
    }

    pub async fn write_baseline(&self, volume: &VolumeId, entries: &[BaselineEntry]) -> Result<()> {
        let now = Utc::now();
        let data: Vec<u8> = entries
            .iter()
            .flat_map(|entry| {
                encode_record(&ChangeEvent {
                    volume_id: volume.clone(),
                    frn: entry.frn,
                    parent_frn: entry.parent_frn,
                    usn: Usn(0),
                    timestamp: now,
                    reason: ReasonFlags(CLOSE),
                    file_name: entry.name.clone(),
                    is_directory: entry.is_directory,
                })
            })
            .collect();
        let dir = self.volume_dir(volume);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| PipelineError::storage(format!("create {}: {err}", dir.display())))?;
        let path = dir.join(BASELINE_FILE);
        fs::write(&path, data)
            .await
            .map_err(|err| PipelineError::storage(format!("write {}: {err}", path.display())))
    }
}

#[async_trait]
impl JournalSource for SpoolJournal {
    async fn metadata(&self, volume: &VolumeId) -> Result<JournalMetadata> {
        let manifest = self.manifest(volume).await?;
        let next_usn = match manifest.next_usn {
            Some(next) => next,
            None => {
                let data = self.read_file(volume, RECORDS_FILE).await?.unwrap_or_default();
                let mut offset = 0;
                let mut last = None;
                while let Some((len, usn)) = peek_record(&data[offset..]) {
                    last = Some(usn);
                    offset += len;
                }
                last.map(Usn::next).unwrap_or(manifest.first_usn)
            }
        };
        Ok(JournalMetadata {
            journal_id: manifest.journal_id,
            first_usn: manifest.first_usn,
            next_usn: next_usn.max(manifest.first_usn),
        })
    }

    async fn read(&self, volume: &VolumeId, start_usn: Usn, max_bytes: usize) -> Result<JournalRead> {
        let metadata = self.metadata(volume).await?;
        let data = self.read_file(volume, RECORDS_FILE).await?.unwrap_or_default();

        let mut offset = 0;
        let mut begin = None;
        let mut end = 0;
        let mut last_included = start_usn <= metadata.first_usn;
        while let Some((len, usn)) = peek_record(&data[offset..]) {
            if usn < start_usn {
                last_included = false;
                offset += len;
                continue;
            }
            if let Some(begin) = begin {
                if end - begin + len > max_bytes {
                    return Ok(JournalRead {
                        records: Bytes::copy_from_slice(&data[begin..end]),
                        next_usn: usn,
                    });
                }
            }
            begin.get_or_insert(offset);
            end = offset + len;
            offset += len;
            last_included = true;
        }

        if offset < data.len() && last_included {
            // unparseable tail: hand it over so the decoder reports it
            event!(
                Level::WARN,
                volume_id = %volume,
                offset,
                error_kind = "malformed_record",
                "spool journal has an unreadable tail"
            );
            begin.get_or_insert(offset);
            end = data.len();
        }

        let records = match begin {
            Some(begin) => Bytes::copy_from_slice(&data[begin..end]),
            None => Bytes::new(),
        };
        Ok(JournalRead {
            records,
            next_usn: metadata.next_usn.max(start_usn),
        })
    }
}

#[async_trait]
impl BaselineScanner for SpoolJournal {
    async fn scan(&self, volume: &VolumeId, _metadata: &JournalMetadata) -> Result<Vec<BaselineEntry>> {
        let Some(data) = self.read_file(volume, BASELINE_FILE).await? else {
            warn!(volume_id = %volume, "no baseline listing in spool; starting from an empty tree");
            return Ok(Vec::new());
        };
        let events = decode_buffer(volume, &data)?;
        Ok(events
            .into_iter()
            .map(|e| BaselineEntry {
                frn: e.frn,
                parent_frn: e.parent_frn,
                name: e.file_name,
                is_directory: e.is_directory,
            })
            .collect())
    }
}
