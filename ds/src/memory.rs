//! In-memory store backend
//!
//! Collections are nested hash maps behind a single RwLock. Intended for
//! tests and single-process embedding; contents vanish with the process.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use tracing::debug;

use crate::error::StoreError;
use crate::filter::{Filter, matches_all};
use crate::record::{IndexValue, Record};
use crate::store::Store;

struct StoredRecord {
    body: Value,
    indexes: HashMap<String, IndexValue>,
}

/// Volatile store keyed collection → id → record
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, HashMap<String, StoredRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn put<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let body = serde_json::to_value(record)?;
        let stored = StoredRecord {
            body,
            indexes: record.indexed_fields(),
        };
        let mut collections = self.collections.write().expect("memory store lock poisoned");
        collections
            .entry(R::collection_name().to_string())
            .or_default()
            .insert(record.id().to_string(), stored);
        debug!(collection = R::collection_name(), id = record.id(), "put");
        Ok(())
    }

    fn get<R: Record>(&self, id: &str) -> Result<Option<R>, StoreError> {
        let collections = self.collections.read().expect("memory store lock poisoned");
        let Some(stored) = collections.get(R::collection_name()).and_then(|c| c.get(id)) else {
            return Ok(None);
        };
        let record = serde_json::from_value(stored.body.clone())?;
        Ok(Some(record))
    }

    fn delete<R: Record>(&self, id: &str) -> Result<bool, StoreError> {
        let mut collections = self.collections.write().expect("memory store lock poisoned");
        let existed = collections
            .get_mut(R::collection_name())
            .map(|c| c.remove(id).is_some())
            .unwrap_or(false);
        debug!(collection = R::collection_name(), id, existed, "delete");
        Ok(existed)
    }

    fn query<R: Record>(&self, filters: &[Filter]) -> Result<Vec<R>, StoreError> {
        let collections = self.collections.read().expect("memory store lock poisoned");
        let Some(collection) = collections.get(R::collection_name()) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for stored in collection.values() {
            if matches_all(filters, &stored.indexes) {
                out.push(serde_json::from_value(stored.body.clone())?);
            }
        }
        Ok(out)
    }
}
