//! In-memory sink writer
//!
//! Keyed tables behind an RwLock. Upsert resolves row identity from the
//! interface's primary keys (content fingerprint when none are
//! declared), so replaying a committed batch is a no-op, which is the
//! property the at-least-once contract rests on.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::Interface;
use crate::error::SyncError;
use crate::pipeline::{RecordBatch, Row};

use super::SinkWriter;

/// Ordered in-memory table per interface
#[derive(Default)]
struct Table {
    rows: HashMap<String, Row>,
    insertion_order: Vec<String>,
}

#[derive(Default)]
pub struct MemorySink {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently in an interface's table
    pub fn row_count(&self, interface_id: &str) -> usize {
        self.tables
            .read()
            .expect("sink lock poisoned")
            .get(interface_id)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    /// Fetch one row by its identity, for assertions
    pub fn get_row(&self, interface_id: &str, row_id: &str) -> Option<Row> {
        self.tables
            .read()
            .expect("sink lock poisoned")
            .get(interface_id)
            .and_then(|t| t.rows.get(row_id).cloned())
    }
}

#[async_trait]
impl SinkWriter for MemorySink {
    async fn ensure_table(&self, interface: &Interface) -> Result<(), SyncError> {
        let mut tables = self.tables.write().expect("sink lock poisoned");
        tables.entry(interface.id.clone()).or_default();
        Ok(())
    }

    async fn upsert(&self, interface: &Interface, batch: &RecordBatch) -> Result<u64, SyncError> {
        let pk_cols = interface.primary_key_columns();
        let mut tables = self.tables.write().expect("sink lock poisoned");
        let table = tables.entry(interface.id.clone()).or_default();
        let mut written = 0u64;
        for row in &batch.rows {
            let identity = RecordBatch::row_identity(row, &pk_cols);
            if table.rows.insert(identity.clone(), row.clone()).is_none() {
                table.insertion_order.push(identity);
            }
            written += 1;
        }
        debug!(interface = %interface.name, batch = %batch.id, written, "upsert");
        Ok(written)
    }

    async fn sample(&self, interface_id: &str, limit: usize) -> Result<Vec<Row>, SyncError> {
        let tables = self.tables.read().expect("sink lock poisoned");
        let Some(table) = tables.get(interface_id) else {
            return Ok(Vec::new());
        };
        Ok(table
            .insertion_order
            .iter()
            .take(limit)
            .filter_map(|id| table.rows.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DataType, Field, TransportType};
    use serde_json::json;

    fn interface() -> Interface {
        let mut iface = Interface::new("lib-1", "orders", TransportType::Http);
        iface.fields = vec![Field::new("id", DataType::Integer).primary_key()];
        iface
    }

    fn row(id: i64, extra: &str) -> Row {
        let mut r = Row::new();
        r.insert("id".to_string(), json!(id));
        r.insert("extra".to_string(), json!(extra));
        r
    }

    #[tokio::test]
    async fn test_upsert_deduplicates_by_pk() {
        let sink = MemorySink::new();
        let iface = interface();

        let batch = RecordBatch::new(&iface.id, vec![row(1, "a"), row(2, "b")]);
        sink.upsert(&iface, &batch).await.unwrap();
        // Same pk, new payload: updates in place
        let batch2 = RecordBatch::new(&iface.id, vec![row(1, "updated")]);
        sink.upsert(&iface, &batch2).await.unwrap();

        assert_eq!(sink.row_count(&iface.id), 2);
        assert_eq!(sink.get_row(&iface.id, "1").unwrap()["extra"], json!("updated"));
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let sink = MemorySink::new();
        let iface = interface();
        let batch = RecordBatch::new(&iface.id, vec![row(1, "a")]);
        sink.upsert(&iface, &batch).await.unwrap();
        sink.upsert(&iface, &batch).await.unwrap();
        assert_eq!(sink.row_count(&iface.id), 1);
    }

    #[tokio::test]
    async fn test_sample_insertion_order() {
        let sink = MemorySink::new();
        let iface = interface();
        let batch = RecordBatch::new(&iface.id, vec![row(3, "c"), row(1, "a"), row(2, "b")]);
        sink.upsert(&iface, &batch).await.unwrap();

        let rows = sink.sample(&iface.id, 2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], json!(3));
    }

    #[tokio::test]
    async fn test_sample_unknown_interface_empty() {
        let sink = MemorySink::new();
        assert!(sink.sample("nope", 10).await.unwrap().is_empty());
    }
}
