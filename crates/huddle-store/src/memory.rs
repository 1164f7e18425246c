//! In-process [`DocumentStore`] kept entirely in memory.
//!
//! Used for ephemeral servers (`DATABASE_PATH=:memory:`) and in tests.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::document::{Document, DocumentStore, Filter, Update, UpdateResult};
use crate::error::{Result, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryStore {
    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>> {
        let guard = self.collections.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard
            .get(collection)
            .map(|docs| docs.iter().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default())
    }

    fn insert_one(&self, collection: &str, doc: Document) -> Result<()> {
        let mut guard = self.collections.write().map_err(|_| StoreError::Poisoned)?;
        guard.entry(collection.to_string()).or_default().push(doc);
        Ok(())
    }

    fn update_one(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        let mut guard = self.collections.write().map_err(|_| StoreError::Poisoned)?;
        let mut result = UpdateResult::default();
        if let Some(doc) = guard
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| filter.matches(d)))
        {
            result.matched = 1;
            if update.apply(doc) {
                result.modified = 1;
            }
        }
        Ok(result)
    }

    fn update_many(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        let mut guard = self.collections.write().map_err(|_| StoreError::Poisoned)?;
        let mut result = UpdateResult::default();
        if let Some(docs) = guard.get_mut(collection) {
            for doc in docs.iter_mut().filter(|d| filter.matches(d)) {
                result.matched += 1;
                if update.apply(doc) {
                    result.modified += 1;
                }
            }
        }
        Ok(result)
    }

    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut guard = self.collections.write().map_err(|_| StoreError::Poisoned)?;
        let Some(docs) = guard.get_mut(collection) else {
            return Ok(0);
        };
        match docs.iter().position(|d| filter.matches(d)) {
            Some(index) => {
                docs.remove(index);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut guard = self.collections.write().map_err(|_| StoreError::Poisoned)?;
        let Some(docs) = guard.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|d| !filter.matches(d));
        Ok((before - docs.len()) as u64)
    }

    fn max_id(&self, collection: &str) -> Result<Option<i64>> {
        let guard = self.collections.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard
            .get(collection)
            .and_then(|docs| docs.iter().filter_map(|d| d.get("id")?.as_i64()).max()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn crud_cycle() {
        let store = MemoryStore::new();
        store
            .insert_many("users", vec![json!({ "id": 1, "n": "a" }), json!({ "id": 2, "n": "b" })])
            .unwrap();

        assert_eq!(store.max_id("users").unwrap(), Some(2));
        assert_eq!(store.max_id("groups").unwrap(), None);

        let updated = store
            .update_one("users", &Filter::by_id(2), &Update::set("n", json!("c")))
            .unwrap();
        assert_eq!(updated, UpdateResult { matched: 1, modified: 1 });

        let doc = store.find_one("users", &Filter::eq("n", "c")).unwrap().unwrap();
        assert_eq!(doc["id"], 2);

        assert_eq!(store.delete_many("users", &Filter::All).unwrap(), 2);
        assert!(store.find("users", &Filter::All).unwrap().is_empty());
    }

    #[test]
    fn update_without_match_reports_zero() {
        let store = MemoryStore::new();
        let result = store
            .update_one("users", &Filter::by_id(1), &Update::set("n", json!("x")))
            .unwrap();
        assert_eq!(result.matched, 0);
    }
}
