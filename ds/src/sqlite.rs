//! SQLite store backend
//!
//! One `records` table holds every collection (JSON body column); indexed
//! fields are mirrored into `record_index` so equality filters can narrow
//! candidates server-side. Residual filters are verified against the
//! deserialized record, which keeps index rows advisory rather than
//! authoritative.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, params};
use tracing::debug;

use crate::error::StoreError;
use crate::filter::{Filter, FilterOp, matches_all};
use crate::record::{IndexValue, Record};
use crate::store::Store;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    collection  TEXT NOT NULL,
    id          TEXT NOT NULL,
    updated_at  INTEGER NOT NULL,
    body        TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE TABLE IF NOT EXISTS record_index (
    collection  TEXT NOT NULL,
    id          TEXT NOT NULL,
    field       TEXT NOT NULL,
    value_text  TEXT,
    value_int   INTEGER,
    PRIMARY KEY (collection, id, field)
);
CREATE INDEX IF NOT EXISTS idx_record_index_lookup
    ON record_index (collection, field, value_text, value_int);
";

/// Durable single-file store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.as_ref().display(), "opened sqlite store");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database (useful for tests)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn index_columns(value: &IndexValue) -> (Option<String>, Option<i64>) {
        match value {
            IndexValue::String(s) => (Some(s.clone()), None),
            IndexValue::Int(i) => (None, Some(*i)),
            IndexValue::Bool(b) => (None, Some(i64::from(*b))),
        }
    }

    /// Ids matching the first equality filter, used to narrow the scan
    fn candidate_ids(
        conn: &Connection,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<String>, StoreError> {
        let (text, int) = Self::index_columns(&filter.value);
        let mut stmt = conn.prepare(
            "SELECT id FROM record_index
             WHERE collection = ?1 AND field = ?2
               AND (value_text IS ?3) AND (value_int IS ?4)",
        )?;
        let ids = stmt
            .query_map(params![collection, filter.field, text, int], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn load<R: Record>(collection: &str, id: &str, body: &str) -> Result<R, StoreError> {
        serde_json::from_str(body).map_err(|e| StoreError::Corrupt {
            collection: collection.to_string(),
            id: id.to_string(),
            reason: e.to_string(),
        })
    }
}

impl Store for SqliteStore {
    fn put<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let collection = R::collection_name();
        let body = serde_json::to_string(record)?;
        let mut conn = self.conn.lock().expect("sqlite store lock poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO records (collection, id, updated_at, body) VALUES (?1, ?2, ?3, ?4)",
            params![collection, record.id(), record.updated_at(), body],
        )?;
        tx.execute(
            "DELETE FROM record_index WHERE collection = ?1 AND id = ?2",
            params![collection, record.id()],
        )?;
        for (field, value) in record.indexed_fields() {
            let (text, int) = Self::index_columns(&value);
            tx.execute(
                "INSERT INTO record_index (collection, id, field, value_text, value_int)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![collection, record.id(), field, text, int],
            )?;
        }
        tx.commit()?;
        debug!(collection, id = record.id(), "put");
        Ok(())
    }

    fn get<R: Record>(&self, id: &str) -> Result<Option<R>, StoreError> {
        let collection = R::collection_name();
        let conn = self.conn.lock().expect("sqlite store lock poisoned");
        let mut stmt = conn.prepare("SELECT body FROM records WHERE collection = ?1 AND id = ?2")?;
        let mut rows = stmt.query_map(params![collection, id], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(body) => Ok(Some(Self::load(collection, id, &body?)?)),
            None => Ok(None),
        }
    }

    fn delete<R: Record>(&self, id: &str) -> Result<bool, StoreError> {
        let collection = R::collection_name();
        let mut conn = self.conn.lock().expect("sqlite store lock poisoned");
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        tx.execute(
            "DELETE FROM record_index WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn query<R: Record>(&self, filters: &[Filter]) -> Result<Vec<R>, StoreError> {
        let collection = R::collection_name();
        let conn = self.conn.lock().expect("sqlite store lock poisoned");

        // Narrow by the first equality filter when there is one; verify the
        // full conjunction against the deserialized record either way.
        let eq_filter = filters.iter().find(|f| f.op == FilterOp::Eq);
        let mut records: Vec<R> = Vec::new();

        if let Some(eq) = eq_filter {
            for id in Self::candidate_ids(&conn, collection, eq)? {
                let mut stmt =
                    conn.prepare("SELECT body FROM records WHERE collection = ?1 AND id = ?2")?;
                let mut rows = stmt.query_map(params![collection, id], |row| row.get::<_, String>(0))?;
                if let Some(body) = rows.next() {
                    records.push(Self::load(collection, &id, &body?)?);
                }
            }
        } else {
            let mut stmt = conn.prepare("SELECT id, body FROM records WHERE collection = ?1")?;
            let rows = stmt.query_map(params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (id, body) = row?;
                records.push(Self::load(collection, &id, &body)?);
            }
        }

        records.retain(|r| matches_all(filters, &r.indexed_fields()));
        Ok(records)
    }
}
