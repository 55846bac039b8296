pub mod error;
pub mod types;

pub use error::{PipelineError, Result};
pub use types::{EntityId, EntityKey, EntityType, EventKind, Frn, Usn, VolumeId};
