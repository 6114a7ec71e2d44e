//! Store error types

use thiserror::Error;

/// Errors surfaced by store backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt record in collection '{collection}' id '{id}': {reason}")]
    Corrupt {
        collection: String,
        id: String,
        reason: String,
    },
}

impl StoreError {
    /// Whether retrying the same operation could succeed
    ///
    /// Serialization failures and corrupt rows are deterministic; only
    /// backend-level errors (locked database, I/O) are worth a retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Serialize(_) => false,
            StoreError::Corrupt { .. } => false,
            StoreError::Sqlite(e) => matches!(
                e,
                rusqlite::Error::SqliteFailure(info, _)
                    if info.code == rusqlite::ErrorCode::DatabaseBusy
                        || info.code == rusqlite::ErrorCode::DatabaseLocked
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_not_retryable() {
        let err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        assert!(!StoreError::Serialize(err).is_retryable());
    }

    #[test]
    fn test_corrupt_not_retryable() {
        let err = StoreError::Corrupt {
            collection: "tasks".to_string(),
            id: "abc".to_string(),
            reason: "missing body".to_string(),
        };
        assert!(!err.is_retryable());
    }
}
