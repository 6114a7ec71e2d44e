//! Scheduler configuration

use std::time::Duration;

/// Tunables for the scheduler and its worker pool
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the due-task scan runs
    pub check_interval: Duration,
    /// Process-wide cap on concurrent executions
    pub max_workers: usize,
    /// Dispatch queue capacity; a full queue defers tasks to a later scan
    pub queue_capacity: usize,
    /// How long a cancelled execution gets to reach a terminal state
    pub graceful_shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            max_workers: 4,
            queue_capacity: 64,
            graceful_shutdown_timeout: Duration::from_secs(30),
        }
    }
}
