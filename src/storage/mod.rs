pub mod collection;
pub mod engine;
pub mod filter;
pub mod memory;
pub mod persistence;

pub use collection::TypedCollection;
pub use engine::{Collection, DocumentStore};
pub use filter::{Condition, Filter, SortOrder};
pub use memory::InMemoryDocumentStore;
pub use persistence::{DurabilityMode, DurableDocumentStore};
