//! Change-journal capture: record decoding, journal sources, persisted
//! cursors and the per-volume reader that ties them together.

pub mod cursor;
pub mod decoder;
pub mod reader;
pub mod reason;
pub mod replay;
pub mod source;

pub use cursor::{CursorCheck, CursorStore, JournalCursor, RescanReason};
pub use decoder::{ChangeEvent, DecodedChunk, JournalDecoder, decode_buffer, encode_record, split_read_buffer};
pub use reader::{PassReport, VolumeReader};
pub use reason::{ReasonFlags, RenameHalf};
pub use replay::SpoolJournal;
pub use source::{BaselineEntry, BaselineScanner, JournalMetadata, JournalRead, JournalSource};
