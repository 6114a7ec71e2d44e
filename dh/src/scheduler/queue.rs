//! Queue types for the scheduler

use std::time::{Duration, Instant};

use crate::domain::{ExecutionType, Priority};

/// Whether a queued entry is a sync task or a standalone quality task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Sync,
    Quality,
}

/// A dispatchable unit handed to a worker
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub kind: ContextKind,
    pub task_id: String,
    pub priority: Priority,
    pub execution_type: ExecutionType,
    /// Wall-clock bound on the execution
    pub timeout: Duration,
    pub enqueued_at: Instant,
}

impl TaskContext {
    pub fn sync(task_id: impl Into<String>, priority: Priority, execution_type: ExecutionType, timeout: Duration) -> Self {
        Self {
            kind: ContextKind::Sync,
            task_id: task_id.into(),
            priority,
            execution_type,
            timeout,
            enqueued_at: Instant::now(),
        }
    }

    pub fn quality(task_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            kind: ContextKind::Quality,
            task_id: task_id.into(),
            priority: Priority::Normal,
            execution_type: ExecutionType::Scheduled,
            timeout,
            enqueued_at: Instant::now(),
        }
    }
}

impl Eq for TaskContext {}

impl PartialEq for TaskContext {
    fn eq(&self, other: &Self) -> bool {
        self.task_id == other.task_id && self.kind == other.kind
    }
}

impl Ord for TaskContext {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first, FIFO within a priority class
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
    }
}

impl PartialOrd for TaskContext {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Scheduler counters, exposed for operators and tests
#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    pub scans: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub lease_conflicts: u64,
    pub dependency_deferrals: u64,
    pub queue_full_deferrals: u64,
    pub worker_crashes: u64,
    pub recovered_executions: u64,
    pub peak_queue_depth: usize,
    pub peak_running: usize,
}
