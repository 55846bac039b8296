use super::engine::{Collection, DocumentStore};
use super::filter::Filter;
use crate::core::{PipelineError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;

/// Typed view over one collection. Documents that do not decode into `T`
/// are rejected here instead of travelling further as loose JSON.
pub struct TypedCollection<T> {
    store: Arc<dyn DocumentStore>,
    collection: Collection,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedCollection<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            collection: self.collection,
            _marker: PhantomData,
        }
    }
}

impl<T> TypedCollection<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<dyn DocumentStore>, collection: Collection) -> Self {
        Self {
            store,
            collection,
            _marker: PhantomData,
        }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(self.collection, key).await? {
            Some(doc) => Ok(Some(self.decode(key, doc)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, value: &T) -> Result<()> {
        let doc = encode(value)?;
        self.store.put(self.collection, key, doc).await
    }

    pub async fn put_if_absent(&self, key: &str, value: &T) -> Result<bool> {
        let doc = encode(value)?;
        self.store.put_if_absent(self.collection, key, doc).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.store.delete(self.collection, key).await
    }

    pub async fn query(&self, filter: &Filter) -> Result<Vec<(String, T)>> {
        let rows = self.store.query(self.collection, filter).await?;
        rows.into_iter()
            .map(|(key, doc)| {
                let value = self.decode(&key, doc)?;
                Ok((key, value))
            })
            .collect()
    }

    pub async fn put_batch(&self, values: &[(String, T)]) -> Result<()> {
        let docs = values
            .iter()
            .map(|(key, value)| Ok((key.clone(), encode(value)?)))
            .collect::<Result<Vec<_>>>()?;
        self.store.put_batch(self.collection, docs).await
    }

    pub async fn delete_batch(&self, keys: &[String]) -> Result<usize> {
        self.store.delete_batch(self.collection, keys).await
    }

    pub async fn count(&self, filter: &Filter) -> Result<usize> {
        self.store.count(self.collection, filter).await
    }

    fn decode(&self, key: &str, doc: Value) -> Result<T> {
        serde_json::from_value(doc).map_err(|err| {
            PipelineError::Serialization(format!(
                "document '{key}' in '{}' has unexpected shape: {err}",
                self.collection
            ))
        })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(PipelineError::from)
}
