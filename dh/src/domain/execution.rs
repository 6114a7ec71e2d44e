//! Sync task execution domain type
//!
//! One record per run of a sync task, append-only. Per-interface
//! sub-executions mirror the same state machine and roll up into the
//! overall result according to the task's failure policy.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use syncstore::{IndexValue, Record, now_ms};

use super::id::new_id;
use super::task::FailurePolicy;
use crate::error::SyncError;

/// Why this execution was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Manual,
    Scheduled,
    Retry,
}

/// Execution state machine: pending → running → {success|failed|cancelled}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Row counters for one execution or sub-execution
///
/// Invariant at terminal state: `processed == success + error + skipped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCounters {
    pub processed: u64,
    pub success: u64,
    pub error: u64,
    pub skipped: u64,
    /// Total expected rows where the source can tell us (None = unbounded)
    #[serde(default)]
    pub total: Option<u64>,
}

impl ExecutionCounters {
    pub fn record_batch(&mut self, success: u64, error: u64, skipped: u64) {
        self.processed += success + error + skipped;
        self.success += success;
        self.error += error;
        self.skipped += skipped;
    }

    pub fn merge(&mut self, other: &ExecutionCounters) {
        self.processed += other.processed;
        self.success += other.success;
        self.error += other.error;
        self.skipped += other.skipped;
        if let Some(t) = other.total {
            *self.total.get_or_insert(0) += t;
        }
    }

    /// The counter identity every terminal execution must satisfy
    pub fn is_consistent(&self) -> bool {
        self.processed == self.success + self.error + self.skipped
    }
}

/// Per-interface sub-execution, owned by its parent execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceExecution {
    pub id: String,
    pub execution_id: String,
    pub interface_id: String,
    pub status: ExecutionStatus,
    pub counters: ExecutionCounters,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_detail: Option<Map<String, Value>>,
    /// Realtime overflow / reconnecting; the sub keeps running
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub reconnect_count: u32,
}

impl InterfaceExecution {
    pub fn new(execution_id: impl Into<String>, interface_id: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            execution_id: execution_id.into(),
            interface_id: interface_id.into(),
            status: ExecutionStatus::Pending,
            counters: ExecutionCounters::default(),
            started_at: None,
            finished_at: None,
            error_message: None,
            error_detail: None,
            degraded: false,
            reconnect_count: 0,
        }
    }

    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(now_ms());
    }

    pub fn succeed(&mut self) {
        self.status = ExecutionStatus::Success;
        self.finished_at = Some(now_ms());
    }

    pub fn fail(&mut self, err: &SyncError) {
        self.status = ExecutionStatus::Failed;
        self.finished_at = Some(now_ms());
        self.error_message = Some(err.concise_message());
        self.error_detail = Some(err.detail());
    }

    pub fn cancel(&mut self) {
        self.status = ExecutionStatus::Cancelled;
        self.finished_at = Some(now_ms());
    }
}

/// One run of a sync task, start to terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTaskExecution {
    pub id: String,
    pub task_id: String,
    pub execution_type: ExecutionType,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
    pub counters: ExecutionCounters,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_detail: Option<Map<String, Value>>,
    #[serde(default)]
    pub degraded: bool,
    /// Per-interface sub-results, exclusively owned by this execution
    #[serde(default)]
    pub interface_results: Vec<InterfaceExecution>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SyncTaskExecution {
    pub fn new(task_id: impl Into<String>, execution_type: ExecutionType) -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            task_id: task_id.into(),
            execution_type,
            status: ExecutionStatus::Pending,
            started_at: None,
            finished_at: None,
            counters: ExecutionCounters::default(),
            error_message: None,
            error_detail: None,
            degraded: false,
            interface_results: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_start(&self) -> bool {
        self.status == ExecutionStatus::Pending
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self.status, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    pub fn can_retry(&self) -> bool {
        matches!(self.status, ExecutionStatus::Failed | ExecutionStatus::Cancelled)
    }

    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(now_ms());
        self.updated_at = now_ms();
    }

    pub fn fail(&mut self, err: &SyncError) {
        self.status = ExecutionStatus::Failed;
        self.finished_at = Some(now_ms());
        self.error_message = Some(err.concise_message());
        self.error_detail = Some(err.detail());
        self.updated_at = now_ms();
    }

    pub fn cancel(&mut self) {
        self.status = ExecutionStatus::Cancelled;
        self.finished_at = Some(now_ms());
        self.updated_at = now_ms();
    }

    /// Fold sub-execution states into the overall status
    ///
    /// `success` requires every sub to succeed. With `FailurePolicy::Any` a
    /// single failed sub fails the run; with `All`, only all-failed does. A
    /// cancelled sub makes the run cancelled unless a failure already
    /// decided it.
    pub fn roll_up(&mut self, policy: FailurePolicy) {
        let total = self.interface_results.len();
        let failed = self
            .interface_results
            .iter()
            .filter(|r| r.status == ExecutionStatus::Failed)
            .count();
        let cancelled = self
            .interface_results
            .iter()
            .filter(|r| r.status == ExecutionStatus::Cancelled)
            .count();

        self.counters = ExecutionCounters::default();
        for sub in &self.interface_results {
            self.counters.merge(&sub.counters);
        }
        self.degraded = self.interface_results.iter().any(|r| r.degraded);

        let status = if total > 0 && failed == total {
            ExecutionStatus::Failed
        } else if failed > 0 && policy == FailurePolicy::Any {
            ExecutionStatus::Failed
        } else if cancelled > 0 {
            ExecutionStatus::Cancelled
        } else if failed > 0 {
            // FailurePolicy::All with a partial failure still counts as success
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Success
        };
        self.status = status;
        self.finished_at = Some(now_ms());
        self.updated_at = now_ms();

        if self.error_message.is_none() {
            if let Some(first_failed) = self
                .interface_results
                .iter()
                .find(|r| r.status == ExecutionStatus::Failed)
            {
                self.error_message = first_failed.error_message.clone();
                self.error_detail = first_failed.error_detail.clone();
            }
        }
    }
}

impl Record for SyncTaskExecution {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "sync_executions"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("task_id".to_string(), IndexValue::String(self.task_id.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        if let Some(start) = self.started_at {
            fields.insert("started_at".to_string(), IndexValue::Int(start));
        }
        fields
    }
}
