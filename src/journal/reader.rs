use super::cursor::{CursorCheck, CursorStore, RescanReason};
use super::decoder::{ChangeEvent, JournalDecoder};
use super::source::{BaselineScanner, JournalMetadata, JournalSource};
use crate::config::JournalPolicy;
use crate::core::{PipelineError, Result, Usn, VolumeId};
use crate::resolver::{EntityResolver, IngestTally};
use serde::Serialize;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// What one reader pass did for a volume.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub volume_id: String,
    /// Set when the pass had to rescan, with the reason.
    pub rescan: Option<String>,
    pub baseline_entries: usize,
    pub events: usize,
    pub malformed: usize,
    pub written: usize,
    pub duplicates: usize,
    pub buffered: usize,
    pub unresolved: usize,
    pub committed: Option<Usn>,
}

impl PassReport {
    fn absorb(&mut self, tally: IngestTally) {
        self.written += tally.written;
        self.duplicates += tally.duplicates;
        self.buffered += tally.buffered;
        self.unresolved += tally.unresolved;
    }
}

/// Incremental journal reader for one volume.
pub struct VolumeReader {
    volume: VolumeId,
    source: Arc<dyn JournalSource>,
    scanner: Arc<dyn BaselineScanner>,
    cursors: CursorStore,
    resolver: Arc<EntityResolver>,
    policy: JournalPolicy,
}

impl VolumeReader {
    pub fn new(
        volume: VolumeId,
        source: Arc<dyn JournalSource>,
        scanner: Arc<dyn BaselineScanner>,
        cursors: CursorStore,
        resolver: Arc<EntityResolver>,
        policy: JournalPolicy,
    ) -> Self {
        Self {
            volume,
            source,
            scanner,
            cursors,
            resolver,
            policy,
        }
    }

    pub fn volume(&self) -> &VolumeId {
        &self.volume
    }

    /// Read everything the journal has past the stored cursor.
    pub async fn pass(&self) -> Result<PassReport> {
        let span = info_span!("journal_pass", volume_id = %self.volume);
        self.pass_inner().instrument(span).await
    }

    async fn pass_inner(&self) -> Result<PassReport> {
        let mut report = PassReport {
            volume_id: self.volume.to_string(),
            ..PassReport::default()
        };
        let metadata = self.source.metadata(&self.volume).await?;
        let mut committed = match self.cursors.check(&self.volume, &metadata).await? {
            CursorCheck::Resume { from } => from.prev(),
            CursorCheck::RescanRequired(reason) => self.rescan(&metadata, reason, &mut report).await?,
        };

        let mut start = committed.next();
        loop {
            let read = self
                .source
                .read(&self.volume, start, self.policy.read_chunk_bytes)
                .await?;
            let last = self.consume(&read.records, start, &mut report).await?;
            let processed = match last {
                Some(last) => last.max(read.next_usn.prev()),
                None => read.next_usn.prev(),
            };
            let target = match self.resolver.low_watermark(&self.volume)? {
                Some(held) => processed.min(held),
                None => processed,
            };
            if target > committed {
                self.cursors
                    .commit(&self.volume, metadata.journal_id, target)
                    .await?;
                committed = target;
                report.committed = Some(target);
            }
            if read.records.is_empty() || read.next_usn <= start {
                break;
            }
            start = read.next_usn;
        }

        event!(
            Level::DEBUG,
            volume_id = %self.volume,
            events = report.events,
            written = report.written,
            buffered = report.buffered,
            "journal pass finished"
        );
        Ok(report)
    }

    async fn rescan(
        &self,
        metadata: &JournalMetadata,
        reason: RescanReason,
        report: &mut PassReport,
    ) -> Result<Usn> {
        match CursorCheck::RescanRequired(reason.clone()).discontinuity(&self.volume) {
            Some(err) => event!(
                Level::WARN,
                volume_id = %self.volume,
                error_kind = err.kind(),
                reason = %reason,
                "journal discontinuity; rescanning volume"
            ),
            None => event!(Level::INFO, volume_id = %self.volume, "no stored cursor; scanning volume"),
        }

        let entries = self.scanner.scan(&self.volume, metadata).await?;
        report.baseline_entries = self.resolver.apply_baseline(&self.volume, &entries).await?;
        let released = self.resolver.release_volume(&self.volume).await?;
        if released > 0 {
            event!(
                Level::WARN,
                volume_id = %self.volume,
                released,
                "events held across the discontinuity written unresolved"
            );
        }

        let base = metadata.next_usn.prev();
        self.cursors
            .rebase(&self.volume, metadata.journal_id, base)
            .await?;
        report.rescan = Some(reason.to_string());
        report.committed = Some(base);
        Ok(base)
    }

    /// Decode one read in chunks and hand events to the resolver. Returns
    /// the last usn seen.
    async fn consume(&self, records: &[u8], start: Usn, report: &mut PassReport) -> Result<Option<Usn>> {
        let mut decoder = JournalDecoder::new(self.volume.clone());
        let mut last: Option<Usn> = None;
        for chunk in records.chunks(self.policy.decode_chunk_bytes.max(1)) {
            let decoded = decoder.feed(chunk);
            for err in &decoded.malformed {
                report.malformed += 1;
                self.log_malformed(err);
            }
            for change in decoded.events {
                self.check_order(&change, start, last).await?;
                last = Some(change.usn);
                report.events += 1;
                let tally = self.resolver.ingest(change).await?;
                report.absorb(tally);
            }
        }
        if let Some(err) = decoder.finish() {
            report.malformed += 1;
            self.log_malformed(&err);
        }
        Ok(last)
    }

    async fn check_order(&self, change: &ChangeEvent, start: Usn, last: Option<Usn>) -> Result<()> {
        let floor = last.unwrap_or(start.prev());
        if change.usn > floor {
            return Ok(());
        }
        let err = PipelineError::JournalDiscontinuity {
            volume: self.volume.clone(),
            reason: format!("usn moved back from {floor} to {}", change.usn),
        };
        event!(
            Level::ERROR,
            volume_id = %self.volume,
            usn = change.usn.0,
            error_kind = err.kind(),
            "usn went backwards; cursor reset for rescan"
        );
        self.cursors.reset(&self.volume).await?;
        Err(err)
    }

    fn log_malformed(&self, err: &PipelineError) {
        if let PipelineError::MalformedRecord { offset, reason } = err {
            event!(
                Level::WARN,
                volume_id = %self.volume,
                offset,
                reason = %reason,
                error_kind = err.kind(),
                "malformed journal record skipped"
            );
        }
    }
}
