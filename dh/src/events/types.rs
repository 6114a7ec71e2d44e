//! Event types for sync engine activity streaming
//!
//! Every observable lifecycle moment of an execution emits one of these:
//! task start/completion, batch commits, progress, quality issues, and
//! stream connection health.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::domain::{ExecutionCounters, ExecutionStatus, IssueSeverity};

/// Core event enum - the vocabulary of engine activity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HubEvent {
    /// An execution has started
    TaskStarted {
        task_id: String,
        execution_id: String,
        execution_type: String,
    },
    /// Row-count progress, throttled by the emitter
    Progress {
        task_id: String,
        execution_id: String,
        interface_id: String,
        processed: u64,
        total: Option<u64>,
        /// Rows per second over the last window
        speed: f64,
    },
    /// A batch was committed to the sink
    BatchCommitted {
        task_id: String,
        execution_id: String,
        interface_id: String,
        size: usize,
        quality_score: Option<f64>,
    },
    /// A quality rule flagged one or more rows
    QualityIssue {
        task_id: String,
        execution_id: String,
        rule: String,
        severity: IssueSeverity,
        count: u64,
    },
    /// A streaming connector lost its connection
    ConnectionLost {
        task_id: String,
        execution_id: String,
        source: String,
    },
    /// A streaming connector re-established its connection
    ConnectionRestored {
        task_id: String,
        execution_id: String,
        source: String,
        reconnect_count: u32,
    },
    /// Sticky degraded condition (overflow, reconnecting); task stays running
    Degraded {
        task_id: String,
        execution_id: String,
        reason: String,
    },
    /// An execution reached a terminal state
    TaskCompleted {
        task_id: String,
        execution_id: String,
        status: ExecutionStatus,
        counters: ExecutionCounters,
    },
}

impl HubEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            HubEvent::TaskStarted { execution_id, .. }
            | HubEvent::Progress { execution_id, .. }
            | HubEvent::BatchCommitted { execution_id, .. }
            | HubEvent::QualityIssue { execution_id, .. }
            | HubEvent::ConnectionLost { execution_id, .. }
            | HubEvent::ConnectionRestored { execution_id, .. }
            | HubEvent::Degraded { execution_id, .. }
            | HubEvent::TaskCompleted { execution_id, .. } => execution_id,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            HubEvent::TaskStarted { task_id, .. }
            | HubEvent::Progress { task_id, .. }
            | HubEvent::BatchCommitted { task_id, .. }
            | HubEvent::QualityIssue { task_id, .. }
            | HubEvent::ConnectionLost { task_id, .. }
            | HubEvent::ConnectionRestored { task_id, .. }
            | HubEvent::Degraded { task_id, .. }
            | HubEvent::TaskCompleted { task_id, .. } => task_id,
        }
    }

    /// The event kind name as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            HubEvent::TaskStarted { .. } => "task_started",
            HubEvent::Progress { .. } => "progress",
            HubEvent::BatchCommitted { .. } => "batch_committed",
            HubEvent::QualityIssue { .. } => "quality_issue",
            HubEvent::ConnectionLost { .. } => "connection_lost",
            HubEvent::ConnectionRestored { .. } => "connection_restored",
            HubEvent::Degraded { .. } => "degraded",
            HubEvent::TaskCompleted { .. } => "task_completed",
        }
    }

    /// Whether this event marks a lifecycle transition worth persisting
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            HubEvent::TaskStarted { .. }
                | HubEvent::TaskCompleted { .. }
                | HubEvent::Degraded { .. }
                | HubEvent::ConnectionLost { .. }
                | HubEvent::ConnectionRestored { .. }
        )
    }

    /// Wire envelope: `{task_id, execution_id, kind, ts, data}`
    pub fn envelope(&self, ts: DateTime<Utc>) -> Value {
        let mut data = serde_json::to_value(self).expect("event serializes");
        if let Some(obj) = data.as_object_mut() {
            obj.remove("kind");
            obj.remove("task_id");
            obj.remove("execution_id");
        }
        json!({
            "task_id": self.task_id(),
            "execution_id": self.execution_id(),
            "kind": self.kind(),
            "ts": ts.to_rfc3339(),
            "data": data,
        })
    }
}

/// A timestamped event log entry for file persistence
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogEntry {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub event: HubEvent,
}

impl EventLogEntry {
    pub fn new(event: HubEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}
