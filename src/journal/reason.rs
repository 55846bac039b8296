//! NTFS `USN_REASON_*` flags.

use crate::core::EventKind;
use std::fmt;

pub const DATA_OVERWRITE: u32 = 0x0000_0001;
pub const DATA_EXTEND: u32 = 0x0000_0002;
pub const DATA_TRUNCATION: u32 = 0x0000_0004;
pub const NAMED_DATA_OVERWRITE: u32 = 0x0000_0010;
pub const NAMED_DATA_EXTEND: u32 = 0x0000_0020;
pub const NAMED_DATA_TRUNCATION: u32 = 0x0000_0040;
pub const FILE_CREATE: u32 = 0x0000_0100;
pub const FILE_DELETE: u32 = 0x0000_0200;
pub const EA_CHANGE: u32 = 0x0000_0400;
pub const SECURITY_CHANGE: u32 = 0x0000_0800;
pub const RENAME_OLD_NAME: u32 = 0x0000_1000;
pub const RENAME_NEW_NAME: u32 = 0x0000_2000;
pub const INDEXABLE_CHANGE: u32 = 0x0000_4000;
pub const BASIC_INFO_CHANGE: u32 = 0x0000_8000;
pub const HARD_LINK_CHANGE: u32 = 0x0001_0000;
pub const COMPRESSION_CHANGE: u32 = 0x0002_0000;
pub const ENCRYPTION_CHANGE: u32 = 0x0004_0000;
pub const OBJECT_ID_CHANGE: u32 = 0x0008_0000;
pub const REPARSE_POINT_CHANGE: u32 = 0x0010_0000;
pub const STREAM_CHANGE: u32 = 0x0020_0000;
pub const TRANSACTED_CHANGE: u32 = 0x0040_0000;
pub const INTEGRITY_CHANGE: u32 = 0x0080_0000;
pub const DESIRED_STORAGE_CLASS_CHANGE: u32 = 0x0100_0000;
pub const CLOSE: u32 = 0x8000_0000;

const DATA_MASK: u32 = DATA_OVERWRITE
    | DATA_EXTEND
    | DATA_TRUNCATION
    | NAMED_DATA_OVERWRITE
    | NAMED_DATA_EXTEND
    | NAMED_DATA_TRUNCATION;

const METADATA_MASK: u32 = EA_CHANGE
    | SECURITY_CHANGE
    | INDEXABLE_CHANGE
    | BASIC_INFO_CHANGE
    | HARD_LINK_CHANGE
    | COMPRESSION_CHANGE
    | ENCRYPTION_CHANGE
    | OBJECT_ID_CHANGE
    | REPARSE_POINT_CHANGE
    | STREAM_CHANGE
    | TRANSACTED_CHANGE
    | INTEGRITY_CHANGE
    | DESIRED_STORAGE_CLASS_CHANGE;

pub const KNOWN_MASK: u32 =
    DATA_MASK | METADATA_MASK | FILE_CREATE | FILE_DELETE | RENAME_OLD_NAME | RENAME_NEW_NAME | CLOSE;

/// Which half of a rename pair a record is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenameHalf {
    Old,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReasonFlags(pub u32);

impl ReasonFlags {
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn unknown_bits(self) -> u32 {
        self.0 & !KNOWN_MASK
    }

    /// Non-empty and made only of documented bits.
    pub fn is_recognized(self) -> bool {
        self.0 != 0 && self.unknown_bits() == 0
    }

    /// The single activity kind a record counts as.
    pub fn primary_kind(self) -> Option<EventKind> {
        if !self.is_recognized() {
            return None;
        }
        let kind = if self.0 & FILE_DELETE != 0 {
            EventKind::Delete
        } else if self.0 & FILE_CREATE != 0 {
            EventKind::Create
        } else if self.0 & (RENAME_OLD_NAME | RENAME_NEW_NAME) != 0 {
            EventKind::Rename
        } else if self.0 & DATA_MASK != 0 {
            EventKind::Modify
        } else if self.0 & METADATA_MASK != 0 {
            EventKind::Metadata
        } else {
            EventKind::Close
        };
        Some(kind)
    }

    pub fn rename_half(self) -> Option<RenameHalf> {
        if self.0 & RENAME_OLD_NAME != 0 {
            Some(RenameHalf::Old)
        } else if self.0 & RENAME_NEW_NAME != 0 {
            Some(RenameHalf::New)
        } else {
            None
        }
    }
}

impl fmt::Display for ReasonFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_outranks_everything() {
        let flags = ReasonFlags(FILE_CREATE | FILE_DELETE | CLOSE);
        assert_eq!(flags.primary_kind(), Some(EventKind::Delete));
    }

    #[test]
    fn close_only_is_close() {
        assert_eq!(ReasonFlags(CLOSE).primary_kind(), Some(EventKind::Close));
        assert_eq!(
            ReasonFlags(DATA_EXTEND | CLOSE).primary_kind(),
            Some(EventKind::Modify)
        );
        assert_eq!(
            ReasonFlags(SECURITY_CHANGE).primary_kind(),
            Some(EventKind::Metadata)
        );
    }

    #[test]
    fn undocumented_bits_are_unrecognized() {
        let flags = ReasonFlags(FILE_CREATE | 0x0200_0000);
        assert!(!flags.is_recognized());
        assert_eq!(flags.unknown_bits(), 0x0200_0000);
        assert_eq!(flags.primary_kind(), None);
        assert!(!ReasonFlags(0).is_recognized());
    }

    #[test]
    fn rename_halves() {
        assert_eq!(
            ReasonFlags(RENAME_OLD_NAME).rename_half(),
            Some(RenameHalf::Old)
        );
        assert_eq!(
            ReasonFlags(RENAME_NEW_NAME | CLOSE).rename_half(),
            Some(RenameHalf::New)
        );
        assert_eq!(ReasonFlags(FILE_CREATE).rename_half(), None);
    }
}
