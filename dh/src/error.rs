//! Error taxonomy for the sync engine
//!
//! Every failure crossing a component boundary is classified into one of
//! these variants; callers branch on [`ErrorKind`] and the retry decision,
//! never on message strings.

use std::time::Duration;

use serde_json::{Map, Value, json};
use thiserror::Error;

/// Classified errors surfaced by connectors, pipeline stages, and repositories
#[derive(Debug, Error)]
pub enum SyncError {
    /// Bad task/interface/source definition; surfaced at create or update
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Transient I/O: broker down, DNS failure, connection refused
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Authentication or authorization failure
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Deadline exceeded on I/O or execution
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Response shape or type coercion failure
    #[error("schema mismatch: {0}")]
    Schema(String),

    /// A validation rule reported fatal severity
    #[error("validation rejected: {0}")]
    ValidationLogic(String),

    /// Upsert contention at the sink
    #[error("write conflict: {0}")]
    WriteConflict(String),

    /// Cooperative cancellation; terminal but not a reportable failure
    #[error("cancelled")]
    Cancelled,

    /// Programmer error or invariant violation; suppresses further dispatch
    #[error("fatal: {0}")]
    Fatal(String),

    /// A taxonomy error annotated with the pipeline stage and batch it hit
    #[error("{stage} stage failed on batch {batch_id}: {source}")]
    Stage {
        stage: &'static str,
        batch_id: String,
        #[source]
        source: Box<SyncError>,
    },
}

/// The bare classification of a [`SyncError`], stripped of context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Unavailable,
    Auth,
    Timeout,
    Schema,
    ValidationLogic,
    WriteConflict,
    Cancelled,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Auth => "auth",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Schema => "schema",
            ErrorKind::ValidationLogic => "validation_logic",
            ErrorKind::WriteConflict => "write_conflict",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// What the retry policy should do with a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Never retry
    No,
    /// Refresh credentials once, then retry
    RefreshThenRetry,
    /// Retry with backoff up to the attempt cap
    Retry,
}

impl SyncError {
    /// Root classification, unwrapping stage annotations
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Config(_) => ErrorKind::Config,
            SyncError::Unavailable(_) => ErrorKind::Unavailable,
            SyncError::Auth(_) => ErrorKind::Auth,
            SyncError::Timeout(_) => ErrorKind::Timeout,
            SyncError::Schema(_) => ErrorKind::Schema,
            SyncError::ValidationLogic(_) => ErrorKind::ValidationLogic,
            SyncError::WriteConflict(_) => ErrorKind::WriteConflict,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Fatal(_) => ErrorKind::Fatal,
            SyncError::Stage { source, .. } => source.kind(),
        }
    }

    /// Retry classification per the engine policy
    pub fn retry_decision(&self) -> RetryDecision {
        match self.kind() {
            ErrorKind::Unavailable | ErrorKind::Timeout | ErrorKind::WriteConflict => RetryDecision::Retry,
            ErrorKind::Auth => RetryDecision::RefreshThenRetry,
            ErrorKind::Config
            | ErrorKind::Schema
            | ErrorKind::ValidationLogic
            | ErrorKind::Cancelled
            | ErrorKind::Fatal => RetryDecision::No,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_decision() != RetryDecision::No
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Annotate with the pipeline stage and batch that raised it
    pub fn in_stage(self, stage: &'static str, batch_id: impl Into<String>) -> SyncError {
        SyncError::Stage {
            stage,
            batch_id: batch_id.into(),
            source: Box::new(self),
        }
    }

    /// Single-line message bounded to 500 chars, for the execution record
    pub fn concise_message(&self) -> String {
        let mut msg: String = self.to_string().replace('\n', " ");
        if msg.len() > 500 {
            let mut cut = 497;
            while !msg.is_char_boundary(cut) {
                cut -= 1;
            }
            msg.truncate(cut);
            msg.push_str("...");
        }
        msg
    }

    /// Structured detail map stored alongside the concise message
    pub fn detail(&self) -> Map<String, Value> {
        let mut detail = Map::new();
        detail.insert("kind".to_string(), json!(self.kind().as_str()));
        if let SyncError::Stage { stage, batch_id, .. } = self {
            detail.insert("stage".to_string(), json!(stage));
            detail.insert("batch_id".to_string(), json!(batch_id));
        }
        detail.insert("message".to_string(), json!(self.to_string()));
        detail
    }
}

impl From<syncstore::StoreError> for SyncError {
    fn from(e: syncstore::StoreError) -> Self {
        if e.is_retryable() {
            SyncError::Unavailable(e.to_string())
        } else {
            SyncError::Fatal(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Schema(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(SyncError::Config("x".into()).kind(), ErrorKind::Config);
        assert_eq!(SyncError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            SyncError::Timeout(Duration::from_secs(5)).kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_retry_decisions() {
        assert_eq!(
            SyncError::Unavailable("down".into()).retry_decision(),
            RetryDecision::Retry
        );
        assert_eq!(
            SyncError::WriteConflict("pk".into()).retry_decision(),
            RetryDecision::Retry
        );
        assert_eq!(
            SyncError::Auth("expired".into()).retry_decision(),
            RetryDecision::RefreshThenRetry
        );
        assert_eq!(SyncError::Schema("shape".into()).retry_decision(), RetryDecision::No);
        assert_eq!(SyncError::Fatal("bug".into()).retry_decision(), RetryDecision::No);
        assert_eq!(SyncError::Cancelled.retry_decision(), RetryDecision::No);
    }

    #[test]
    fn test_stage_annotation_preserves_kind() {
        let err = SyncError::Schema("bad field".into()).in_stage("parse", "batch-7");
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("parse"));
        assert!(err.to_string().contains("batch-7"));
    }

    #[test]
    fn test_concise_message_bounded() {
        let long = "x".repeat(2000);
        let msg = SyncError::Unavailable(long).concise_message();
        assert!(msg.len() <= 500);
        assert!(msg.ends_with("..."));
        assert!(!msg.contains('\n'));
    }

    #[test]
    fn test_detail_includes_stage() {
        let err = SyncError::WriteConflict("dup pk".into()).in_stage("write", "b-1");
        let detail = err.detail();
        assert_eq!(detail["kind"], "write_conflict");
        assert_eq!(detail["stage"], "write");
        assert_eq!(detail["batch_id"], "b-1");
    }
}
