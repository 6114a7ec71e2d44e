//! Incremental sync state
//!
//! One record per sync config (task-interface pair). The watermark only
//! ever moves forward; the single exception is an explicit operator
//! reset. Values are stringly typed because increment fields vary
//! (RFC 3339 timestamps, numeric ids, log offsets); comparison is numeric
//! when both sides parse as numbers, lexical otherwise.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use syncstore::{IndexValue, Record, now_ms};

use super::id::new_id;

/// What the increment field represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementalKind {
    Timestamp,
    IdRange,
    LogBased,
}

/// Compare two watermark values
///
/// Both numeric → numeric order; otherwise lexical. RFC 3339 timestamps
/// order correctly under lexical comparison.
pub fn compare_values(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// Per-sync-config incremental cursor state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalState {
    pub id: String,
    /// `{task_id}/{interface_id}`
    pub sync_config_id: String,
    pub task_id: String,
    pub interface_id: String,
    pub kind: IncrementalKind,
    /// High watermark: everything ≤ this has been committed
    #[serde(default)]
    pub last_sync_value: Option<String>,
    /// Lowest value ever observed, for reporting
    #[serde(default)]
    pub low_watermark: Option<String>,
    /// Offset within equal-watermark runs (secondary cursor)
    #[serde(default)]
    pub sync_offset: u64,
    pub batch_size: usize,
    #[serde(default)]
    pub last_execution_id: Option<String>,
    #[serde(default)]
    pub failure_count: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl IncrementalState {
    pub fn new(task_id: impl Into<String>, interface_id: impl Into<String>, kind: IncrementalKind) -> Self {
        let task_id = task_id.into();
        let interface_id = interface_id.into();
        let now = now_ms();
        Self {
            id: new_id(),
            sync_config_id: Self::config_id(&task_id, &interface_id),
            task_id,
            interface_id,
            kind,
            last_sync_value: None,
            low_watermark: None,
            sync_offset: 0,
            batch_size: 500,
            last_execution_id: None,
            failure_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn config_id(task_id: &str, interface_id: &str) -> String {
        format!("{task_id}/{interface_id}")
    }

    /// Advance the watermark; returns whether it moved
    ///
    /// Never regresses: an older value is ignored. Equal values keep the
    /// watermark but may advance the secondary offset.
    pub fn advance(&mut self, value: &str, execution_id: &str) -> bool {
        if self.low_watermark.is_none() {
            self.low_watermark = Some(value.to_string());
        }
        let moved = match &self.last_sync_value {
            None => true,
            Some(current) => compare_values(value, current) == Ordering::Greater,
        };
        if moved {
            self.last_sync_value = Some(value.to_string());
            self.sync_offset = 0;
        }
        self.last_execution_id = Some(execution_id.to_string());
        self.failure_count = 0;
        self.updated_at = now_ms();
        moved
    }

    /// Explicit operator reset back to the beginning
    pub fn reset(&mut self) {
        self.last_sync_value = None;
        self.low_watermark = None;
        self.sync_offset = 0;
        self.failure_count = 0;
        self.updated_at = now_ms();
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.updated_at = now_ms();
    }
}

impl Record for IncrementalState {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "incremental_state"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert(
            "sync_config_id".to_string(),
            IndexValue::String(self.sync_config_id.clone()),
        );
        fields.insert("task_id".to_string(), IndexValue::String(self.task_id.clone()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_numeric() {
        assert_eq!(compare_values("9", "10"), Ordering::Less);
        assert_eq!(compare_values("10", "10"), Ordering::Equal);
        assert_eq!(compare_values("10.5", "10"), Ordering::Greater);
    }

    #[test]
    fn test_compare_timestamps_lexical() {
        assert_eq!(
            compare_values("2025-06-01T00:00:00Z", "2025-06-02T00:00:00Z"),
            Ordering::Less
        );
    }

    #[test]
    fn test_advance_monotonic() {
        let mut state = IncrementalState::new("t-1", "if-1", IncrementalKind::Timestamp);
        assert!(state.advance("2025-06-01T00:00:00Z", "e-1"));
        assert!(state.advance("2025-06-02T00:00:00Z", "e-2"));
        // Regression is ignored
        assert!(!state.advance("2025-05-01T00:00:00Z", "e-3"));
        assert_eq!(state.last_sync_value.as_deref(), Some("2025-06-02T00:00:00Z"));
        // Equal value does not move the watermark
        assert!(!state.advance("2025-06-02T00:00:00Z", "e-4"));
    }

    #[test]
    fn test_advance_tracks_low_watermark() {
        let mut state = IncrementalState::new("t-1", "if-1", IncrementalKind::IdRange);
        state.advance("100", "e-1");
        state.advance("200", "e-2");
        assert_eq!(state.low_watermark.as_deref(), Some("100"));
    }

    #[test]
    fn test_reset() {
        let mut state = IncrementalState::new("t-1", "if-1", IncrementalKind::IdRange);
        state.advance("100", "e-1");
        state.reset();
        assert!(state.last_sync_value.is_none());
        assert_eq!(state.sync_offset, 0);
        // Advancing after reset may legally go "backwards"
        assert!(state.advance("50", "e-2"));
    }

    #[test]
    fn test_failure_count_clears_on_advance() {
        let mut state = IncrementalState::new("t-1", "if-1", IncrementalKind::IdRange);
        state.record_failure();
        state.record_failure();
        assert_eq!(state.failure_count, 2);
        state.advance("1", "e-1");
        assert_eq!(state.failure_count, 0);
    }
}
