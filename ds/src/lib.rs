//! SyncStore - generic record persistence for the data hub
//!
//! Collections of typed records with secondary indexes, behind a single
//! `Store` trait. Two backends ship: an in-memory store for tests and
//! single-process embedding, and a SQLite store for durable single-node
//! deployments. Records carry their own identity and index fields; the
//! store never interprets record bodies beyond JSON (de)serialization.

mod error;
mod filter;
mod memory;
mod record;
mod sqlite;
mod store;

pub use error::StoreError;
pub use filter::{Filter, FilterOp};
pub use memory::MemoryStore;
pub use record::{IndexValue, Record};
pub use sqlite::SqliteStore;
pub use store::Store;

/// Current wall-clock time as Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        // Sanity: after 2020-01-01
        assert!(a > 1_577_836_800_000);
    }
}
