use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a monitored volume ("C:", "\\?\Volume{...}", or a spool name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(String);

impl VolumeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VolumeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// File reference number. Wide enough for 128-bit V3 references; stored as a
/// decimal string because JSON documents cannot carry integers past u64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Frn(u128);

impl Frn {
    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u128 {
        self.0
    }
}

impl fmt::Display for Frn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Frn> for String {
    fn from(value: Frn) -> Self {
        value.0.to_string()
    }
}

impl TryFrom<String> for Frn {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value
            .parse::<u128>()
            .map(Frn)
            .map_err(|err| format!("invalid file reference number '{value}': {err}"))
    }
}

impl From<u64> for Frn {
    fn from(value: u64) -> Self {
        Self(value as u128)
    }
}

/// Update sequence number: the journal's monotonic byte position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Usn(pub i64);

impl Usn {
    pub fn next(self) -> Usn {
        Usn(self.0.saturating_add(1))
    }

    pub fn prev(self) -> Usn {
        Usn(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Usn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, never-reused application identity of a filesystem object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

const PLACEHOLDER_PREFIX: &str = "unresolved:";

impl EntityId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Tag used for activity whose entity could not be resolved. Encodes the
    /// volume and frn so the records can be reassigned later.
    pub fn placeholder(volume: &VolumeId, frn: Frn) -> Self {
        Self(format!("{PLACEHOLDER_PREFIX}{volume}|{frn}"))
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(PLACEHOLDER_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `(volume, frn)`: the only identity a journal record carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub volume: VolumeId,
    pub frn: Frn,
}

impl EntityKey {
    pub fn new(volume: VolumeId, frn: Frn) -> Self {
        Self { volume, frn }
    }

    /// Document key shared by the entity and resolution-queue collections.
    pub fn storage_key(&self) -> String {
        format!("{}|{}", self.volume, self.frn)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.volume, self.frn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    File,
    Directory,
    Unknown,
}

impl EntityType {
    pub fn from_is_directory(is_directory: bool) -> Self {
        if is_directory {
            Self::Directory
        } else {
            Self::File
        }
    }
}

/// Activity classification written to the hot tier and counted in the warm tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Modify,
    Delete,
    Rename,
    Metadata,
    Close,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Create,
        EventKind::Modify,
        EventKind::Delete,
        EventKind::Rename,
        EventKind::Metadata,
        EventKind::Close,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Rename => "rename",
            Self::Metadata => "metadata",
            Self::Close => "close",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
