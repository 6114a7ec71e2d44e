//! Sync task domain type
//!
//! User-owned task definitions. The scheduler may only touch run
//! bookkeeping (`next_run_time`, `last_run_time`, status, counters,
//! lease); everything else belongs to the owner via create/update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use syncstore::{IndexValue, Record, now_ms};

use super::execution::{ExecutionCounters, ExecutionStatus};
use super::id::new_id;
use super::library::LibraryKind;
use super::priority::Priority;
use super::rules::ConflictPolicy;
use crate::error::SyncError;
use crate::trigger;

/// How much of the source a run covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Full,
    Incremental,
    Realtime,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Full => write!(f, "full"),
            TaskType::Incremental => write!(f, "incremental"),
            TaskType::Realtime => write!(f, "realtime"),
        }
    }
}

/// What causes a run to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Once,
    Interval,
    Cron,
}

/// Task-level status as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Fatal error observed; no further dispatch until operator reset
    Suppressed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::Suppressed => write!(f, "suppressed"),
        }
    }
}

impl TaskStatus {
    /// Statuses from which the scheduler may dispatch a new run
    pub fn is_dispatchable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// How sub-execution failures fold into the run result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any failed interface fails the run
    #[default]
    Any,
    /// Only all interfaces failing fails the run
    All,
}

/// What happens to a batch scoring below the quality threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    Drop,
    Quarantine,
    #[default]
    PassThrough,
}

/// Key-matching settings for thematic merges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    /// Primary tuple the merge joins on
    pub keys: Vec<String>,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Interface ids in precedence order for `prefer_source_rank`
    #[serde(default)]
    pub source_rank: Vec<String>,
}

/// Per-task runtime knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    #[serde(default = "default_interface_concurrency")]
    pub interface_concurrency: usize,
    /// Realtime ingest channel capacity
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default)]
    pub gate_policy: GatePolicy,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Thematic tasks: how records merge across interfaces
    #[serde(default)]
    pub merge: Option<MergeConfig>,
    /// Salt for deterministic pseudonymization (defaults to the task id)
    #[serde(default)]
    pub mask_salt: Option<String>,
}

fn default_interface_concurrency() -> usize {
    1
}

fn default_buffer_size() -> usize {
    1024
}

fn default_timeout() -> u64 {
    3600
}

fn default_max_retries() -> u32 {
    3
}

fn default_quality_threshold() -> f64 {
    0.8
}

fn default_batch_size() -> usize {
    500
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            interface_concurrency: default_interface_concurrency(),
            buffer_size: default_buffer_size(),
            timeout_seconds: default_timeout(),
            max_retries: default_max_retries(),
            failure_policy: FailurePolicy::default(),
            quality_threshold: default_quality_threshold(),
            gate_policy: GatePolicy::default(),
            batch_size: default_batch_size(),
            merge: None,
            mask_salt: None,
        }
    }
}

impl TaskConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.interface_concurrency == 0 {
            return Err(SyncError::Config("interface_concurrency must be > 0".into()));
        }
        if self.buffer_size == 0 {
            return Err(SyncError::Config("buffer_size must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(SyncError::Config("quality_threshold must be in [0, 1]".into()));
        }
        if let Some(merge) = &self.merge {
            if merge.keys.is_empty() {
                return Err(SyncError::Config("merge keys must not be empty".into()));
            }
        }
        Ok(())
    }
}

/// Join entity: one member interface of a sync task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTaskInterface {
    pub interface_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Override of the task-level batch size
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Last observed sub-execution status
    #[serde(default)]
    pub last_status: Option<ExecutionStatus>,
    /// Fraction complete of the last/current run, 0..=1
    #[serde(default)]
    pub progress: f64,
    /// Counters from the most recent run
    #[serde(default)]
    pub last_counters: Option<ExecutionCounters>,
}

fn default_true() -> bool {
    true
}

impl SyncTaskInterface {
    pub fn new(interface_id: impl Into<String>) -> Self {
        Self {
            interface_id: interface_id.into(),
            enabled: true,
            batch_size: None,
            last_status: None,
            progress: 0.0,
            last_counters: None,
        }
    }
}

/// Lifetime aggregate counters on the task definition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounters {
    pub total_runs: u64,
    pub success_runs: u64,
    pub failed_runs: u64,
    pub rows_processed: u64,
}

/// A user-defined recurring or one-off ingestion job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: String,
    pub name: String,
    pub owner: String,

    pub library_kind: LibraryKind,
    pub library_id: String,
    #[serde(default)]
    pub source_id: Option<String>,

    pub task_type: TaskType,
    pub trigger: TriggerType,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub status: TaskStatus,

    pub interfaces: Vec<SyncTaskInterface>,
    /// Thematic only: the interface in the owning library merged rows
    /// are written to
    #[serde(default)]
    pub target_interface_id: Option<String>,
    #[serde(default)]
    pub config: TaskConfig,

    /// Task ids that must have completed recently before this one runs
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_true")]
    pub wait_for_success: bool,
    /// How recent a dependency's terminal state must be, in seconds
    #[serde(default = "default_dependency_window")]
    pub dependency_window_secs: u64,

    /// Next due time (Unix ms); None = dormant
    #[serde(default)]
    pub next_run_time: Option<i64>,
    #[serde(default)]
    pub last_run_time: Option<i64>,

    /// Held while an execution runs; expiry means the worker is lost
    #[serde(default)]
    pub lease_token: Option<String>,
    #[serde(default)]
    pub lease_expires_at: Option<i64>,

    #[serde(default)]
    pub counters: TaskCounters,

    pub created_at: i64,
    pub updated_at: i64,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_dependency_window() -> u64 {
    24 * 3600
}

impl SyncTask {
    pub fn new(
        name: impl Into<String>,
        library_kind: LibraryKind,
        library_id: impl Into<String>,
        task_type: TaskType,
        trigger: TriggerType,
    ) -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            name: name.into(),
            owner: String::new(),
            library_kind,
            library_id: library_id.into(),
            source_id: None,
            task_type,
            trigger,
            cron: None,
            interval_seconds: None,
            scheduled_time: None,
            timezone: default_timezone(),
            priority: Priority::Normal,
            enabled: true,
            status: TaskStatus::Pending,
            interfaces: Vec::new(),
            target_interface_id: None,
            config: TaskConfig::default(),
            dependencies: Vec::new(),
            wait_for_success: true,
            dependency_window_secs: default_dependency_window(),
            next_run_time: Some(now),
            last_run_time: None,
            lease_token: None,
            lease_expires_at: None,
            counters: TaskCounters::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Structural validation at create/update; invalid definitions never
    /// reach the scheduler
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.interfaces.is_empty() {
            return Err(SyncError::Config(format!("task {} has no member interfaces", self.name)));
        }
        trigger::parse_tz(&self.timezone)?;
        match self.trigger {
            TriggerType::Cron => {
                let expr = self
                    .cron
                    .as_deref()
                    .ok_or_else(|| SyncError::Config("cron trigger requires a cron expression".into()))?;
                trigger::validate_cron(expr)?;
            }
            TriggerType::Interval => {
                if self.interval_seconds.unwrap_or(0) == 0 {
                    return Err(SyncError::Config("interval trigger requires interval_seconds > 0".into()));
                }
            }
            TriggerType::Once => {
                if self.scheduled_time.is_none() {
                    return Err(SyncError::Config("once trigger requires scheduled_time".into()));
                }
            }
            TriggerType::Manual => {}
        }
        self.config.validate()?;
        if self.library_kind == LibraryKind::Thematic {
            if self.target_interface_id.is_none() {
                return Err(SyncError::Config(format!(
                    "thematic task {} declares no target interface",
                    self.name
                )));
            }
            if self.config.merge.is_none() && self.interfaces.len() > 1 {
                return Err(SyncError::Config(format!(
                    "thematic task {} joins multiple interfaces without merge keys",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Next due time after `now`, per trigger kind
    ///
    /// `once` goes dormant after its scheduled time has been consumed;
    /// `manual` never self-schedules.
    pub fn compute_next_run(&self, now: DateTime<Utc>) -> Result<Option<i64>, SyncError> {
        match self.trigger {
            TriggerType::Manual => Ok(self.next_run_time),
            TriggerType::Once => Ok(None),
            TriggerType::Interval => {
                let secs = self
                    .interval_seconds
                    .ok_or_else(|| SyncError::Config("interval trigger lost its interval".into()))?;
                Ok(Some(now.timestamp_millis() + (secs as i64) * 1000))
            }
            TriggerType::Cron => {
                let expr = self
                    .cron
                    .as_deref()
                    .ok_or_else(|| SyncError::Config("cron trigger lost its expression".into()))?;
                let tz = trigger::parse_tz(&self.timezone)?;
                Ok(trigger::next_cron_after(expr, tz, now)?.map(|dt| dt.timestamp_millis()))
            }
        }
    }

    /// Whether the lease is currently held
    pub fn lease_active(&self, now_ms: i64) -> bool {
        self.lease_token.is_some() && self.lease_expires_at.is_some_and(|exp| exp > now_ms)
    }

    pub fn record_run(&mut self, status: ExecutionStatus, rows: u64) {
        self.counters.total_runs += 1;
        match status {
            ExecutionStatus::Success => self.counters.success_runs += 1,
            ExecutionStatus::Failed => self.counters.failed_runs += 1,
            _ => {}
        }
        self.counters.rows_processed += rows;
        self.updated_at = now_ms();
    }

    /// Salt used by deterministic pseudonymization
    pub fn mask_salt(&self) -> &str {
        self.config.mask_salt.as_deref().unwrap_or(&self.id)
    }
}

impl Record for SyncTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "sync_tasks"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("enabled".to_string(), IndexValue::Bool(self.enabled));
        fields.insert("library_id".to_string(), IndexValue::String(self.library_id.clone()));
        if let Some(next) = self.next_run_time {
            fields.insert("next_run_time".to_string(), IndexValue::Int(next));
        }
        fields
    }
}

/// Task definition payload exchanged with the admin surface
///
/// Unknown keys are rejected; the payload is normalized into a `SyncTask`
/// after structural validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskPayload {
    #[serde(default)]
    pub name: Option<String>,
    pub library_type: LibraryKind,
    pub library_id: String,
    #[serde(default)]
    pub data_source_id: Option<String>,
    pub task_type: TaskType,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    pub interface_ids: Vec<String>,
    #[serde(default)]
    pub target_interface_id: Option<String>,
    #[serde(default)]
    pub config: Option<TaskConfig>,
}

impl TaskPayload {
    /// Parse a payload, rejecting unknown keys
    pub fn from_json(raw: &str) -> Result<Self, SyncError> {
        serde_json::from_str(raw).map_err(|e| SyncError::Config(format!("invalid task payload: {e}")))
    }

    /// Normalize into a validated task definition
    pub fn into_task(self, owner: impl Into<String>) -> Result<SyncTask, SyncError> {
        let name = self
            .name
            .unwrap_or_else(|| format!("{}-{}", self.task_type, self.library_id));
        let mut task = SyncTask::new(name, self.library_type, self.library_id, self.task_type, self.trigger_type);
        task.owner = owner.into();
        task.source_id = self.data_source_id;
        task.cron = self.cron;
        task.interval_seconds = self.interval_seconds;
        task.scheduled_time = self.scheduled_time;
        if let Some(tz) = self.timezone {
            task.timezone = tz;
        }
        if let Some(p) = self.priority {
            task.priority = p;
        }
        task.interfaces = self.interface_ids.into_iter().map(SyncTaskInterface::new).collect();
        task.target_interface_id = self.target_interface_id;
        if let Some(config) = self.config {
            task.config = config;
        }
        // A once task is due at its scheduled time; a manual task only
        // runs on demand; everything else is due immediately
        match task.trigger {
            TriggerType::Once => task.next_run_time = task.scheduled_time.map(|t| t.timestamp_millis()),
            TriggerType::Manual => task.next_run_time = None,
            _ => {}
        }
        task.validate()?;
        Ok(task)
    }
}
