//! Binary change-journal record decoding.
//!
//! # Record Format
//!
//! ```text
//! V2: [len:u32][major:u16][minor:u16][frn:u64][parent:u64][usn:i64][time:i64]
//!     [reason:u32][source:u32][security:u32][attributes:u32][name_len:u16][name_off:u16][name:utf16]
//! V3: same layout with 128-bit frn and parent (76-byte header)
//! ```
//!
//! All integers are little-endian. `len` covers the whole record including
//! the padding that keeps the next record 8-byte aligned.

use super::reason::{ReasonFlags, RenameHalf};
use crate::core::{EntityKey, EventKind, Frn, PipelineError, Result, Usn, VolumeId};
use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};

pub const V2_HEADER_SIZE: usize = 60;
pub const V3_HEADER_SIZE: usize = 76;

// Largest record NTFS emits: header plus a 255-character name, aligned.
pub const MAX_RECORD_SIZE: usize = 1024;

pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x0000_0020;

// 100ns ticks between 1601-01-01 and 1970-01-01, expressed in microseconds.
const FILETIME_UNIX_EPOCH_MICROS: i64 = 11_644_473_600_000_000;

/// One decoded journal record.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub volume_id: VolumeId,
    pub frn: Frn,
    pub parent_frn: Frn,
    pub usn: Usn,
    pub timestamp: DateTime<Utc>,
    pub reason: ReasonFlags,
    pub file_name: String,
    pub is_directory: bool,
}

impl ChangeEvent {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.volume_id.clone(), self.frn)
    }

    pub fn parent_key(&self) -> EntityKey {
        EntityKey::new(self.volume_id.clone(), self.parent_frn)
    }

    /// Both halves of a rename share this token.
    pub fn correlation_token(&self) -> EntityKey {
        self.key()
    }

    pub fn kind(&self) -> EventKind {
        self.reason.primary_kind().unwrap_or(EventKind::Metadata)
    }

    pub fn rename(&self) -> Option<RenameHalf> {
        self.reason.rename_half()
    }

    /// The volume root lists itself as its own parent.
    pub fn is_root(&self) -> bool {
        self.frn == self.parent_frn
    }
}

enum Parsed {
    Record { outcome: Result<ChangeEvent>, len: usize },
    Incomplete,
    Corrupt(PipelineError),
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn read_u128(buf: &[u8], at: usize) -> u128 {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&buf[at..at + 16]);
    u128::from_le_bytes(raw)
}

pub fn filetime_to_utc(ticks: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros((ticks / 10).checked_sub(FILETIME_UNIX_EPOCH_MICROS)?)
}

pub fn utc_to_filetime(timestamp: DateTime<Utc>) -> i64 {
    timestamp
        .timestamp_micros()
        .saturating_add(FILETIME_UNIX_EPOCH_MICROS)
        .saturating_mul(10)
}

/// Parse the record starting at `buf[0]`. `offset` is only used for errors.
fn parse_record(volume: &VolumeId, buf: &[u8], offset: usize) -> Parsed {
    if buf.len() < 8 {
        return Parsed::Incomplete;
    }
    let len = read_u32(buf, 0) as usize;
    let major = read_u16(buf, 4);
    let header = match major {
        2 => V2_HEADER_SIZE,
        3 => V3_HEADER_SIZE,
        other => {
            return Parsed::Corrupt(PipelineError::malformed(
                offset,
                format!("unsupported record version {other}"),
            ));
        }
    };
    if len < header || len > MAX_RECORD_SIZE {
        return Parsed::Corrupt(PipelineError::malformed(
            offset,
            format!("impossible record length {len}"),
        ));
    }
    if buf.len() < len {
        return Parsed::Incomplete;
    }
    let record = &buf[..len];
    Parsed::Record {
        outcome: decode_fields(volume, record, major, offset),
        len,
    }
}

fn decode_fields(volume: &VolumeId, record: &[u8], major: u16, offset: usize) -> Result<ChangeEvent> {
    let (frn, parent_frn, tail) = if major == 2 {
        (
            read_u64(record, 8) as u128,
            read_u64(record, 16) as u128,
            24,
        )
    } else {
        (read_u128(record, 8), read_u128(record, 24), 40)
    };
    let usn = read_u64(record, tail) as i64;
    let ticks = read_u64(record, tail + 8) as i64;
    let reason = ReasonFlags(read_u32(record, tail + 16));
    let attributes = read_u32(record, tail + 28);
    let name_len = read_u16(record, tail + 32) as usize;
    let name_off = read_u16(record, tail + 34) as usize;

    if !reason.is_recognized() {
        return Err(PipelineError::malformed(
            offset,
            format!("unrecognized reason flags {reason} at usn {usn}"),
        ));
    }
    let header = if major == 2 { V2_HEADER_SIZE } else { V3_HEADER_SIZE };
    if name_off < header || name_off + name_len > record.len() || name_len % 2 != 0 {
        return Err(PipelineError::malformed(
            offset,
            format!("file name {name_off}+{name_len} outside record of {} bytes", record.len()),
        ));
    }
    let units: Vec<u16> = record[name_off..name_off + name_len]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let file_name = String::from_utf16(&units)
        .map_err(|err| PipelineError::malformed(offset, format!("file name is not UTF-16: {err}")))?;
    let timestamp = filetime_to_utc(ticks)
        .ok_or_else(|| PipelineError::malformed(offset, format!("timestamp {ticks} out of range")))?;

    Ok(ChangeEvent {
        volume_id: volume.clone(),
        frn: Frn::new(frn),
        parent_frn: Frn::new(parent_frn),
        usn: Usn(usn),
        timestamp,
        reason,
        file_name,
        is_directory: attributes & FILE_ATTRIBUTE_DIRECTORY != 0,
    })
}

/// Length and usn of the record at `buf[0]`, without validating its contents.
pub fn peek_record(buf: &[u8]) -> Option<(usize, Usn)> {
    if buf.len() < 8 {
        return None;
    }
    let len = read_u32(buf, 0) as usize;
    let (header, usn_at) = match read_u16(buf, 4) {
        2 => (V2_HEADER_SIZE, 24),
        3 => (V3_HEADER_SIZE, 40),
        _ => return None,
    };
    if len < header || len > MAX_RECORD_SIZE || buf.len() < len {
        return None;
    }
    Some((len, Usn(read_u64(buf, usn_at) as i64)))
}

/// Decode one complete buffer of records.
///
/// Fails on the first record whose declared length exceeds the remaining
/// buffer or whose reason flags are unrecognized.
pub fn decode_buffer(volume: &VolumeId, buf: &[u8]) -> Result<Vec<ChangeEvent>> {
    let mut events = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        match parse_record(volume, &buf[offset..], offset) {
            Parsed::Record { outcome, len } => {
                events.push(outcome?);
                offset += len;
            }
            Parsed::Incomplete => {
                return Err(PipelineError::malformed(
                    offset,
                    format!("record truncated: {} bytes remain", buf.len() - offset),
                ));
            }
            Parsed::Corrupt(err) => return Err(err),
        }
    }
    Ok(events)
}

/// Strip the next-USN prefix of a raw `FSCTL_READ_USN_JOURNAL` output buffer.
pub fn split_read_buffer(buf: &[u8]) -> Result<(Usn, &[u8])> {
    if buf.len() < 8 {
        return Err(PipelineError::malformed(0, "read buffer shorter than its usn prefix"));
    }
    Ok((Usn(read_u64(buf, 0) as i64), &buf[8..]))
}

/// Serialize an event as a journal record: V2 when both references fit in 64
/// bits, V3 otherwise.
pub fn encode_record(event: &ChangeEvent) -> Vec<u8> {
    let wide = event.frn.get() > u64::MAX as u128 || event.parent_frn.get() > u64::MAX as u128;
    let header = if wide { V3_HEADER_SIZE } else { V2_HEADER_SIZE };
    let name: Vec<u8> = event
        .file_name
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    let len = (header + name.len()).div_ceil(8) * 8;
    let attributes = if event.is_directory {
        FILE_ATTRIBUTE_DIRECTORY
    } else {
        FILE_ATTRIBUTE_ARCHIVE
    };

    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(&(len as u32).to_le_bytes());
    if wide {
        buf.extend_from_slice(&3u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&event.frn.get().to_le_bytes());
        buf.extend_from_slice(&event.parent_frn.get().to_le_bytes());
    } else {
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&(event.frn.get() as u64).to_le_bytes());
        buf.extend_from_slice(&(event.parent_frn.get() as u64).to_le_bytes());
    }
    buf.extend_from_slice(&event.usn.0.to_le_bytes());
    buf.extend_from_slice(&utc_to_filetime(event.timestamp).to_le_bytes());
    buf.extend_from_slice(&event.reason.bits().to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // source info
    buf.extend_from_slice(&0u32.to_le_bytes()); // security id
    buf.extend_from_slice(&attributes.to_le_bytes());
    buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
    buf.extend_from_slice(&(header as u16).to_le_bytes());
    buf.extend_from_slice(&name);
    buf.resize(len, 0);
    buf
}

/// Output of one `feed` call.
#[derive(Debug, Default)]
pub struct DecodedChunk {
    pub events: Vec<ChangeEvent>,
    /// Records that were skipped, as `MalformedRecord` errors.
    pub malformed: Vec<PipelineError>,
}

/// Streaming decoder for one read segment.
///
/// Chunks may cut records anywhere; the straddling tail is kept for the next
/// `feed`. A record with bad contents is skipped on its own, but an impossible
/// length field means record boundaries are lost, so the rest of the segment
/// is discarded until `finish`.
pub struct JournalDecoder {
    volume: VolumeId,
    pending: BytesMut,
    consumed: usize,
    poisoned: bool,
}

impl JournalDecoder {
    pub fn new(volume: VolumeId) -> Self {
        Self {
            volume,
            pending: BytesMut::new(),
            consumed: 0,
            poisoned: false,
        }
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> DecodedChunk {
        let mut out = DecodedChunk::default();
        if self.poisoned {
            self.consumed += chunk.len();
            return out;
        }
        self.pending.extend_from_slice(chunk);

        loop {
            match parse_record(&self.volume, &self.pending, self.consumed) {
                Parsed::Record { outcome, len } => {
                    match outcome {
                        Ok(event) => out.events.push(event),
                        Err(err) => out.malformed.push(err),
                    }
                    self.pending.advance(len);
                    self.consumed += len;
                }
                Parsed::Incomplete => break,
                Parsed::Corrupt(err) => {
                    out.malformed.push(err);
                    self.consumed += self.pending.len();
                    self.pending.clear();
                    self.poisoned = true;
                    break;
                }
            }
        }
        out
    }

    /// End the segment. Leftover bytes are a truncated record.
    pub fn finish(&mut self) -> Option<PipelineError> {
        let leftover = self.pending.len();
        let offset = self.consumed;
        self.pending.clear();
        self.consumed = 0;
        self.poisoned = false;
        (leftover > 0).then(|| {
            PipelineError::malformed(offset, format!("segment ended inside a record ({leftover} bytes)"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::reason::{CLOSE, DATA_EXTEND, FILE_CREATE, RENAME_NEW_NAME};
    use chrono::TimeZone;

    fn event(frn: u128, usn: i64, reason: u32, name: &str) -> ChangeEvent {
        ChangeEvent {
            volume_id: VolumeId::new("C:"),
            frn: Frn::new(frn),
            parent_frn: Frn::new(5),
            usn: Usn(usn),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            reason: ReasonFlags(reason),
            file_name: name.to_string(),
            is_directory: false,
        }
    }

    #[test]
    fn decodes_v2_and_v3_records() {
        let small = event(42, 100, FILE_CREATE, "report.docx");
        let wide = event(u64::MAX as u128 + 9, 200, DATA_EXTEND | CLOSE, "données.txt");
        let mut buf = encode_record(&small);
        assert_eq!(buf.len() % 8, 0);
        buf.extend(encode_record(&wide));

        let decoded = decode_buffer(&VolumeId::new("C:"), &buf).unwrap();
        assert_eq!(decoded, vec![small, wide]);
        assert_eq!(decoded[1].kind(), EventKind::Modify);
    }

    #[test]
    fn declared_length_past_buffer_end_fails() {
        let buf = encode_record(&event(1, 1, FILE_CREATE, "a"));
        let err = decode_buffer(&VolumeId::new("C:"), &buf[..buf.len() - 8]).unwrap_err();
        assert_eq!(err.kind(), "malformed_record");
    }

    #[test]
    fn records_straddling_chunks_are_reassembled() {
        let events: Vec<_> = (0..5)
            .map(|i| event(10 + i, 100 + i as i64, RENAME_NEW_NAME, "some-longer-name.bin"))
            .collect();
        let buf: Vec<u8> = events.iter().flat_map(encode_record).collect();

        let mut decoder = JournalDecoder::new(VolumeId::new("C:"));
        let mut decoded = Vec::new();
        for chunk in buf.chunks(7) {
            let out = decoder.feed(chunk);
            assert!(out.malformed.is_empty());
            decoded.extend(out.events);
        }
        assert!(decoder.finish().is_none());
        assert_eq!(decoded, events);
    }

    #[test]
    fn unknown_reason_skips_only_that_record() {
        let mut buf = encode_record(&event(1, 10, FILE_CREATE, "a"));
        buf.extend(encode_record(&event(2, 11, 0x0400_0000, "b")));
        buf.extend(encode_record(&event(3, 12, FILE_CREATE, "c")));

        let mut decoder = JournalDecoder::new(VolumeId::new("C:"));
        let out = decoder.feed(&buf);
        let frns: Vec<_> = out.events.iter().map(|e| e.frn.get()).collect();
        assert_eq!(frns, vec![1, 3]);
        assert_eq!(out.malformed.len(), 1);
        assert!(matches!(
            out.malformed[0],
            PipelineError::MalformedRecord { offset, .. } if offset == encode_record(&event(1, 10, FILE_CREATE, "a")).len()
        ));
    }

    #[test]
    fn impossible_length_drops_rest_of_segment() {
        let mut buf = encode_record(&event(1, 10, FILE_CREATE, "a"));
        let mut bad = encode_record(&event(2, 11, FILE_CREATE, "b"));
        bad[0..4].copy_from_slice(&8u32.to_le_bytes());
        buf.extend(bad);
        let tail = encode_record(&event(3, 12, FILE_CREATE, "c"));

        let mut decoder = JournalDecoder::new(VolumeId::new("C:"));
        let first = decoder.feed(&buf);
        assert_eq!(first.events.len(), 1);
        assert_eq!(first.malformed.len(), 1);
        assert!(decoder.feed(&tail).events.is_empty());
        assert!(decoder.finish().is_none());

        // a fresh segment decodes normally
        assert_eq!(decoder.feed(&tail).events.len(), 1);
    }

    #[test]
    fn finish_reports_truncated_tail() {
        let buf = encode_record(&event(1, 10, FILE_CREATE, "a"));
        let mut decoder = JournalDecoder::new(VolumeId::new("C:"));
        assert!(decoder.feed(&buf[..20]).events.is_empty());
        assert!(decoder.finish().is_some());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn read_buffer_prefix_is_next_usn() {
        let mut raw = 4096i64.to_le_bytes().to_vec();
        raw.extend(encode_record(&event(1, 10, FILE_CREATE, "a")));
        let (next, records) = split_read_buffer(&raw).unwrap();
        assert_eq!(next, Usn(4096));
        assert_eq!(decode_buffer(&VolumeId::new("C:"), records).unwrap().len(), 1);
    }
}
