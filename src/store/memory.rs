//! In-memory document store, primarily for tests.

use super::{DocumentStore, Filter, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Vec-backed store preserving insertion order per collection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>, StoreError> {
        let collections = self.collections.lock().unwrap();
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| filter.matches(d)).cloned()))
    }

    async fn find_all(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let collections = self.collections.lock().unwrap();
        Ok(collections
            .get(collection)
            .map(|docs| docs.iter().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_one(&self, collection: &str, doc: Value) -> Result<(), StoreError> {
        let mut collections = self.collections.lock().unwrap();
        collections.entry(collection.to_string()).or_default().push(doc);
        Ok(())
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        doc: Value,
    ) -> Result<bool, StoreError> {
        let mut collections = self.collections.lock().unwrap();
        if let Some(docs) = collections.get_mut(collection) {
            if let Some(slot) = docs.iter_mut().find(|d| filter.matches(d)) {
                *slot = doc;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<bool, StoreError> {
        let mut collections = self.collections.lock().unwrap();
        if let Some(docs) = collections.get_mut(collection) {
            if let Some(idx) = docs.iter().position(|d| filter.matches(d)) {
                docs.remove(idx);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let mut collections = self.collections.lock().unwrap();
        if let Some(docs) = collections.get_mut(collection) {
            let before = docs.len();
            docs.retain(|d| !filter.matches(d));
            return Ok((before - docs.len()) as u64);
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_and_find_preserve_order() {
        let store = MemoryStore::new();
        store.insert_one("fills", json!({"id": 1})).await.unwrap();
        store.insert_one("fills", json!({"id": 2})).await.unwrap();

        let all = store.find_all("fills", &Filter::new()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0]["id"], 1);
        assert_eq!(all[1]["id"], 2);
    }

    #[tokio::test]
    async fn test_delete_one_removes_first_match_only() {
        let store = MemoryStore::new();
        store
            .insert_one("fills", json!({"key": "a", "n": 1}))
            .await
            .unwrap();
        store
            .insert_one("fills", json!({"key": "a", "n": 2}))
            .await
            .unwrap();

        let removed = store
            .delete_one("fills", &Filter::new().eq("key", "a"))
            .await
            .unwrap();
        assert!(removed);

        let remaining = store.find_all("fills", &Filter::new()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["n"], 2);
    }

    #[tokio::test]
    async fn test_replace_one_without_match_returns_false() {
        let store = MemoryStore::new();
        let replaced = store
            .replace_one("summaries", &Filter::new().eq("subaccount", "x"), json!({}))
            .await
            .unwrap();
        assert!(!replaced);
    }

    #[tokio::test]
    async fn test_delete_many_counts_removals() {
        let store = MemoryStore::new();
        for n in 0..3 {
            store
                .insert_one("fills", json!({"symbol": "BTCUSDT", "n": n}))
                .await
                .unwrap();
        }
        store
            .insert_one("fills", json!({"symbol": "ETHUSDT", "n": 9}))
            .await
            .unwrap();

        let removed = store
            .delete_many("fills", &Filter::new().eq("symbol", "BTCUSDT"))
            .await
            .unwrap();
        assert_eq!(removed, 3);

        let left = store.find_all("fills", &Filter::new()).await.unwrap();
        assert_eq!(left.len(), 1);
    }
}
