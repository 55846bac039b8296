use super::engine::{Collection, DocumentStore};
use super::filter::Filter;
use crate::core::{PipelineError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

pub type CollectionData = BTreeMap<String, Value>;

pub struct InMemoryDocumentStore {
    /// Collections with individual locks
    collections: HashMap<Collection, Arc<RwLock<CollectionData>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        let collections = Collection::ALL
            .into_iter()
            .map(|c| (c, Arc::new(RwLock::new(BTreeMap::new()))))
            .collect();
        Self { collections }
    }

    /// Get a handle on one collection for concurrent access
    pub fn get_collection(&self, collection: Collection) -> Result<Arc<RwLock<CollectionData>>> {
        self.collections
            .get(&collection)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("collection '{collection}'")))
    }

    /// Copy every collection (for snapshots)
    pub async fn export_all(&self) -> HashMap<Collection, CollectionData> {
        let mut exported = HashMap::new();
        for (collection, handle) in &self.collections {
            let data = handle.read().await;
            exported.insert(*collection, data.clone());
        }
        exported
    }

    /// Replace every collection (for crash recovery)
    pub async fn restore_all(&self, mut data: HashMap<Collection, CollectionData>) {
        for (collection, handle) in &self.collections {
            let mut guard = handle.write().await;
            *guard = data.remove(collection).unwrap_or_default();
        }
    }

    /// Number of documents in one collection
    pub async fn len(&self, collection: Collection) -> Result<usize> {
        let handle = self.get_collection(collection)?;
        let data = handle.read().await;
        Ok(data.len())
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>> {
        let handle = self.get_collection(collection)?;
        let data = handle.read().await;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, collection: Collection, key: &str, document: Value) -> Result<()> {
        let handle = self.get_collection(collection)?;
        let mut data = handle.write().await;
        data.insert(key.to_string(), document);
        Ok(())
    }

    async fn put_if_absent(
        &self,
        collection: Collection,
        key: &str,
        document: Value,
    ) -> Result<bool> {
        let handle = self.get_collection(collection)?;
        let mut data = handle.write().await;
        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(key.to_string(), document);
        Ok(true)
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool> {
        let handle = self.get_collection(collection)?;
        let mut data = handle.write().await;
        Ok(data.remove(key).is_some())
    }

    async fn query(&self, collection: Collection, filter: &Filter) -> Result<Vec<(String, Value)>> {
        let handle = self.get_collection(collection)?;
        let data = handle.read().await;
        Ok(filter.apply(data.iter()))
    }

    async fn put_batch(&self, collection: Collection, documents: Vec<(String, Value)>) -> Result<()> {
        let handle = self.get_collection(collection)?;
        let mut data = handle.write().await;
        data.extend(documents);
        Ok(())
    }

    async fn delete_batch(&self, collection: Collection, keys: &[String]) -> Result<usize> {
        let handle = self.get_collection(collection)?;
        let mut data = handle.write().await;
        Ok(keys.iter().filter(|key| data.remove(key.as_str()).is_some()).count())
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<usize> {
        let handle = self.get_collection(collection)?;
        let data = handle.read().await;
        Ok(data.values().filter(|doc| filter.matches(doc)).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_if_absent_refuses_existing_key() {
        let store = InMemoryDocumentStore::new();
        assert!(store.put_if_absent(Collection::HotTier, "k", json!({"n": 1})).await.unwrap());
        assert!(!store.put_if_absent(Collection::HotTier, "k", json!({"n": 2})).await.unwrap());
        let doc = store.get(Collection::HotTier, "k").await.unwrap().unwrap();
        assert_eq!(doc["n"], 1);
    }

    #[tokio::test]
    async fn collections_are_isolated() {
        let store = InMemoryDocumentStore::new();
        store.put(Collection::Entities, "k", json!({})).await.unwrap();
        assert!(store.get(Collection::WarmTier, "k").await.unwrap().is_none());
        assert_eq!(store.len(Collection::Entities).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_batch_counts_existing_only() {
        let store = InMemoryDocumentStore::new();
        store
            .put_batch(
                Collection::HotTier,
                vec![("a".into(), json!({})), ("b".into(), json!({}))],
            )
            .await
            .unwrap();
        let removed = store
            .delete_batch(Collection::HotTier, &["a".into(), "zz".into()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count(Collection::HotTier, &Filter::all()).await.unwrap(), 1);
    }
}
