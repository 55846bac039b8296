use super::filter::Filter;
use crate::core::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

/// Logically separate named collections. No cross-collection constraint is
/// assumed from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Cursors,
    Entities,
    ResolutionQueue,
    HotTier,
    WarmTier,
    Checkpoints,
}

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::Cursors,
        Collection::Entities,
        Collection::ResolutionQueue,
        Collection::HotTier,
        Collection::WarmTier,
        Collection::Checkpoints,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cursors => "cursors",
            Self::Entities => "entities",
            Self::ResolutionQueue => "resolution_queue",
            Self::HotTier => "hot_tier",
            Self::WarmTier => "warm_tier",
            Self::Checkpoints => "checkpoints",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document store trait - allows pluggable storage backends
///
/// Every call either fully applies or returns `StorageUnavailable`; callers
/// treat an error as "nothing changed" and retry on the next iteration.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document by key
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>>;

    /// Insert or replace a document
    async fn put(&self, collection: Collection, key: &str, document: Value) -> Result<()>;

    /// Insert only if the key is free; returns false when it already existed
    ///
    /// The default is check-then-put; backends that can do it atomically should.
    async fn put_if_absent(
        &self,
        collection: Collection,
        key: &str,
        document: Value,
    ) -> Result<bool> {
        if self.get(collection, key).await?.is_some() {
            return Ok(false);
        }
        self.put(collection, key, document).await?;
        Ok(true)
    }

    /// Remove a document; returns whether it existed
    async fn delete(&self, collection: Collection, key: &str) -> Result<bool>;

    /// Select documents matching a filter, in filter order
    async fn query(&self, collection: Collection, filter: &Filter) -> Result<Vec<(String, Value)>>;

    /// Write several documents
    async fn put_batch(&self, collection: Collection, documents: Vec<(String, Value)>) -> Result<()> {
        for (key, document) in documents {
            self.put(collection, &key, document).await?;
        }
        Ok(())
    }

    /// Remove several documents; returns how many existed
    async fn delete_batch(&self, collection: Collection, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.delete(collection, key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Number of documents matching a filter
    async fn count(&self, collection: Collection, filter: &Filter) -> Result<usize> {
        Ok(self.query(collection, filter).await?.len())
    }
}
