//! Abstract document store used for durable trading state.
//!
//! The core only depends on filter/CRUD semantics against named collections, so
//! the storage engine stays swappable:
//! - `SqliteStore`: documents as JSON rows in SQLite
//! - `MemoryStore`: in-process vectors, used by tests

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;

/// Errors surfaced by a document store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Equality filter over top-level document fields.
///
/// An empty filter matches every document in the collection.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    terms: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality term.
    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.terms.push((field.to_string(), value.into()));
        self
    }

    /// Whether a document satisfies every term.
    pub fn matches(&self, doc: &Value) -> bool {
        self.terms
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Document store contract consumed by the core.
///
/// `find_all` returns documents in insertion order; `delete_one` removes the
/// first match in insertion order. Both the execution gateway and the
/// reconciliation engine rely on these orderings for duplicate resolution.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>, StoreError>;

    async fn find_all(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StoreError>;

    async fn insert_one(&self, collection: &str, doc: Value) -> Result<(), StoreError>;

    /// Replace the first matching document. Returns `false` when nothing
    /// matched (no upsert).
    async fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        doc: Value,
    ) -> Result<bool, StoreError>;

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<bool, StoreError>;

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_on_all_terms() {
        let filter = Filter::new().eq("symbol", "BTCUSDT").eq("side", "BUY");

        assert!(filter.matches(&json!({"symbol": "BTCUSDT", "side": "BUY", "qty": "1"})));
        assert!(!filter.matches(&json!({"symbol": "BTCUSDT", "side": "SELL"})));
        assert!(!filter.matches(&json!({"side": "BUY"})));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(Filter::new().matches(&json!({"anything": 1})));
    }
}
