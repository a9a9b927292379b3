//! SQLite-backed document store.
//!
//! Documents are stored as JSON text rows; rowid order is insertion order.
//! Filters are evaluated in process so the semantics match `MemoryStore`
//! exactly, which keeps the duplicate-resolution rules identical across
//! backends.

use super::{DocumentStore, Filter, StoreError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory {:?}", parent))?;
        }

        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Document store opened at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);
            "#,
        )?;
        Ok(())
    }

    /// Load `(rowid, doc)` pairs for a collection in insertion order.
    fn load(&self, collection: &str) -> Result<Vec<(i64, Value)>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, doc FROM documents WHERE collection = ?1 ORDER BY id ASC")
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut docs = Vec::new();
        for row in rows {
            let (id, text) = row.map_err(|e| StoreError::Database(e.to_string()))?;
            docs.push((id, serde_json::from_str(&text)?));
        }
        Ok(docs)
    }

    fn delete_rows(&self, ids: &[i64]) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut removed = 0u64;
        for id in ids {
            removed += conn
                .execute("DELETE FROM documents WHERE id = ?1", params![id])
                .map_err(|e| StoreError::Database(e.to_string()))? as u64;
        }
        Ok(removed)
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>, StoreError> {
        Ok(self
            .load(collection)?
            .into_iter()
            .map(|(_, doc)| doc)
            .find(|doc| filter.matches(doc)))
    }

    async fn find_all(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        Ok(self
            .load(collection)?
            .into_iter()
            .map(|(_, doc)| doc)
            .filter(|doc| filter.matches(doc))
            .collect())
    }

    async fn insert_one(&self, collection: &str, doc: Value) -> Result<(), StoreError> {
        let text = serde_json::to_string(&doc)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO documents (collection, doc) VALUES (?1, ?2)",
            params![collection, text],
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        doc: Value,
    ) -> Result<bool, StoreError> {
        let target = self
            .load(collection)?
            .into_iter()
            .find(|(_, doc)| filter.matches(doc));

        match target {
            Some((id, _)) => {
                let text = serde_json::to_string(&doc)?;
                let conn = self.conn.lock().unwrap();
                conn.execute(
                    "UPDATE documents SET doc = ?1 WHERE id = ?2",
                    params![text, id],
                )
                .map_err(|e| StoreError::Database(e.to_string()))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<bool, StoreError> {
        let target = self
            .load(collection)?
            .into_iter()
            .find(|(_, doc)| filter.matches(doc));

        match target {
            Some((id, _)) => Ok(self.delete_rows(&[id])? > 0),
            None => Ok(false),
        }
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let ids: Vec<i64> = self
            .load(collection)?
            .into_iter()
            .filter(|(_, doc)| filter.matches(doc))
            .map(|(id, _)| id)
            .collect();
        self.delete_rows(&ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn temp_store() -> SqliteStore {
        let dir = std::env::temp_dir().join(format!(
            "grid-hedger-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        SqliteStore::new(dir.join("store.db")).unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_and_insertion_order() {
        let store = temp_store();
        store
            .insert_one("fills", json!({"clientOrderId": "v1:3", "n": 1}))
            .await
            .unwrap();
        store
            .insert_one("fills", json!({"clientOrderId": "v1:3", "n": 2}))
            .await
            .unwrap();

        let all = store
            .find_all("fills", &Filter::new().eq("clientOrderId", "v1:3"))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0]["n"], 1);

        // delete_one removes the earliest-inserted match
        store
            .delete_one("fills", &Filter::new().eq("clientOrderId", "v1:3"))
            .await
            .unwrap();
        let left = store.find_all("fills", &Filter::new()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0]["n"], 2);
    }

    #[tokio::test]
    async fn test_replace_one() {
        let store = temp_store();
        assert_ok!(
            store
                .insert_one("summaries", json!({"subaccount": "a", "flag": false}))
                .await
        );

        let filter = Filter::new().eq("subaccount", "a");
        let replaced = store
            .replace_one("summaries", &filter, json!({"subaccount": "a", "flag": true}))
            .await
            .unwrap();
        assert!(replaced);

        let doc = store.find_one("summaries", &filter).await.unwrap().unwrap();
        assert_eq!(doc["flag"], true);
    }
}
