//! Sync executor
//!
//! Runs one task execution end-to-end: lease acquisition, per-interface
//! fan-out bounded by the task's interface concurrency, thematic
//! merging, result roll-up, and lease release. Also runs standalone
//! quality task executions.

mod interface_run;

pub(crate) use interface_run::stamp_issues;

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::ConnectorRegistry;
use crate::domain::{
    ConflictPolicy, ExecutionStatus, ExecutionType, IncrementalState, Interface, LineageRecord, MergeConfig,
    QualityExecution, SyncTask, SyncTaskExecution, new_id, now_ms,
};
use crate::error::{ErrorKind, SyncError};
use crate::events::EventBus;
use crate::pipeline::{self, RecordBatch};
use crate::quality::QualityEngine;
use crate::repo::Repos;
use crate::retry::RetryPolicy;

use interface_run::{CollectedBatch, InterfaceRunner, RunOutcome};

/// Extra slack on the lease beyond the task timeout, so a slow terminal
/// write does not let the lease lapse mid-release
const LEASE_SLACK_MS: i64 = 60_000;

pub struct SyncExecutor {
    repos: Repos,
    registry: Arc<ConnectorRegistry>,
    bus: Arc<EventBus>,
    retry: RetryPolicy,
}

impl SyncExecutor {
    pub fn new(repos: Repos, registry: Arc<ConnectorRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            repos,
            registry,
            bus,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run one execution of a task to a terminal state
    ///
    /// Returns `None` when the lease could not be acquired (another
    /// execution is running); the dispatch is then a no-op.
    pub async fn execute(
        &self,
        task_id: &str,
        execution_type: ExecutionType,
        cancel: CancellationToken,
    ) -> Result<Option<SyncTaskExecution>, SyncError> {
        let task = self
            .repos
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| SyncError::Config(format!("unknown task {task_id}")))?;

        let token = new_id();
        let lease_ttl = (task.config.timeout_seconds as i64) * 1000 + LEASE_SLACK_MS;
        if !self.repos.tasks.try_acquire_lease(task_id, &token, lease_ttl).await? {
            debug!(task_id, "lease not acquired, dispatch is a no-op");
            return Ok(None);
        }

        let task = Arc::new(task);
        let mut execution = SyncTaskExecution::new(&task.id, execution_type);
        self.repos.executions.put(&execution).await?;

        let run = self.run_leased(Arc::clone(&task), &mut execution, cancel).await;

        if let Err(e) = &run {
            if !execution.status.is_terminal() {
                if e.is_cancelled() {
                    execution.cancel();
                } else {
                    execution.fail(e);
                }
            }
        }
        self.repos.executions.put(&execution).await?;

        let emitter = self.bus.emitter_for(&task.id, &execution.id);
        emitter.task_completed(execution.status, execution.counters);

        self.repos
            .tasks
            .release_lease(&task.id, &token, execution.status, execution.counters.processed)
            .await?;

        // A fatal error suppresses further dispatch until an operator steps in
        let fatal = matches!(&run, Err(e) if e.kind() == ErrorKind::Fatal)
            || execution
                .error_detail
                .as_ref()
                .is_some_and(|d| d.get("kind").and_then(|k| k.as_str()) == Some("fatal"));
        if fatal {
            warn!(task_id = %task.id, "fatal error, suppressing task");
            self.repos.tasks.suppress(&task.id).await?;
        }

        info!(
            task_id = %task.id,
            execution_id = %execution.id,
            status = %execution.status,
            processed = execution.counters.processed,
            "execution finished"
        );
        Ok(Some(execution))
    }

    async fn run_leased(
        &self,
        task: Arc<SyncTask>,
        execution: &mut SyncTaskExecution,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        execution.start();
        self.repos.executions.put(execution).await?;

        let type_label = match execution.execution_type {
            ExecutionType::Manual => "manual",
            ExecutionType::Scheduled => "scheduled",
            ExecutionType::Retry => "retry",
        };
        let emitter = self.bus.emitter_for(&task.id, &execution.id);
        emitter.task_started(type_label);

        let library = self
            .repos
            .catalog
            .get_library(&task.library_id)
            .await?
            .ok_or_else(|| SyncError::Config(format!("task {} references unknown library", task.name)))?;
        if library.kind != task.library_kind {
            return Err(SyncError::Config(format!(
                "task {} declares library kind {} but {} is {}",
                task.name, task.library_kind, library.name, library.kind
            )));
        }
        if !library.is_syncable() {
            return Err(SyncError::Config(format!(
                "library {} is {}, not active",
                library.name, library.status
            )));
        }

        let thematic = task.library_kind == crate::domain::LibraryKind::Thematic;
        let mut runners = Vec::new();
        let mut interfaces: HashMap<String, Interface> = HashMap::new();

        for member in task.interfaces.iter().filter(|m| m.enabled) {
            let interface = self
                .repos
                .catalog
                .get_interface(&member.interface_id)
                .await?
                .ok_or_else(|| SyncError::Config(format!("unknown interface {}", member.interface_id)))?;
            let source_id = interface
                .source_id
                .clone()
                .or_else(|| task.source_id.clone())
                .ok_or_else(|| {
                    SyncError::Config(format!("interface {} has no data source", interface.name))
                })?;
            let source = self
                .repos
                .catalog
                .get_source(&source_id)
                .await?
                .ok_or_else(|| SyncError::Config(format!("unknown data source {source_id}")))?;
            let connector = self.registry.build(&source, &interface)?;

            if !interface.is_table_created {
                self.repos.sink.ensure_table(&interface).await?;
                let mut marked = interface.clone();
                marked.mark_table_created();
                self.repos.catalog.put_interface(&marked).await?;
            }

            interfaces.insert(interface.id.clone(), interface.clone());
            runners.push(InterfaceRunner {
                repos: self.repos.clone(),
                retry: self.retry.clone(),
                task: Arc::clone(&task),
                interface,
                connector: Some(connector),
                emitter: self.bus.emitter_for(&task.id, &execution.id),
                cancel: cancel.clone(),
                execution_id: execution.id.clone(),
                batch_size: member.batch_size.unwrap_or(task.config.batch_size),
                collect_for_merge: thematic,
            });
        }

        let outcomes: Vec<RunOutcome> = stream::iter(runners.into_iter().map(|runner| runner.run()))
            .buffer_unordered(task.config.interface_concurrency.max(1))
            .collect()
            .await;

        let mut collected: Vec<(String, Vec<CollectedBatch>)> = Vec::new();
        for outcome in outcomes {
            if !outcome.collected.is_empty() {
                collected.push((outcome.sub.interface_id.clone(), outcome.collected));
            }
            execution.interface_results.push(outcome.sub);
        }

        if thematic
            && execution
                .interface_results
                .iter()
                .all(|sub| sub.status != ExecutionStatus::Failed)
        {
            self.merge_and_write(&task, execution, &interfaces, collected).await?;
        }

        execution.roll_up(task.config.failure_policy);
        self.repos.executions.put(execution).await?;
        Ok(())
    }

    /// Thematic aggregation: merge the collected per-interface batches on
    /// the task's key tuple, write to the target interface, record
    /// lineage, and advance each source watermark
    async fn merge_and_write(
        &self,
        task: &SyncTask,
        execution: &mut SyncTaskExecution,
        interfaces: &HashMap<String, Interface>,
        collected: Vec<(String, Vec<CollectedBatch>)>,
    ) -> Result<(), SyncError> {
        let target_id = task
            .target_interface_id
            .as_deref()
            .ok_or_else(|| SyncError::Config(format!("thematic task {} has no target interface", task.name)))?;
        let target = self
            .repos
            .catalog
            .get_interface(target_id)
            .await?
            .ok_or_else(|| SyncError::Config(format!("unknown target interface {target_id}")))?;
        if !target.is_table_created {
            self.repos.sink.ensure_table(&target).await?;
            let mut marked = target.clone();
            marked.mark_table_created();
            self.repos.catalog.put_interface(&marked).await?;
        }

        let merge_config = task.config.merge.clone().unwrap_or_else(|| MergeConfig {
            keys: target.primary_key_columns(),
            conflict_policy: ConflictPolicy::PreferLatest,
            source_rank: Vec::new(),
        });

        let mut inputs: Vec<(String, RecordBatch)> = Vec::new();
        let mut quality_sum = 0.0;
        let mut quality_n = 0u32;
        for (interface_id, batches) in &collected {
            for collected_batch in batches {
                quality_sum += collected_batch.quality_score;
                quality_n += 1;
                inputs.push((interface_id.clone(), collected_batch.batch.clone()));
            }
        }
        let merged = pipeline::merge(&target.id, &inputs, &merge_config)?;
        if merged.is_empty() {
            return Ok(());
        }
        let quality_score = if quality_n > 0 { quality_sum / quality_n as f64 } else { 1.0 };

        let written = self.repos.sink.upsert(&target, &merged).await?;
        debug!(target = %target.name, written, "thematic merge written");

        // Lineage: each merged row traces back to every contributing
        // source row sharing its key tuple
        let mut lineage: Vec<LineageRecord> = Vec::new();
        for (interface_id, batches) in &collected {
            let Some(source_interface) = interfaces.get(interface_id) else { continue };
            let source_pk = source_interface.primary_key_columns();
            for collected_batch in batches {
                for row in &collected_batch.batch.rows {
                    let source_identity = RecordBatch::row_identity(row, &source_pk);
                    let target_identity = RecordBatch::row_identity(row, &merge_config.keys);
                    lineage.push(
                        LineageRecord::new(
                            &source_interface.library_id,
                            interface_id,
                            &source_identity,
                            &target.id,
                            &target_identity,
                            &execution.id,
                        )
                        .with_transforms(collected_batch.transforms.clone())
                        .with_quality_score(quality_score),
                    );
                }
            }
        }
        self.repos.lineage.record(&lineage).await?;

        // Watermarks advance only after the merged write lands
        for (interface_id, batches) in &collected {
            let Some(interface) = interfaces.get(interface_id) else { continue };
            let Some(increment) = interface.increment_field() else { continue };
            let max_value = batches
                .iter()
                .filter_map(|b| b.batch.max_increment_value(&increment.name))
                .max_by(|a, b| crate::domain::compare_values(a, b));
            if let Some(value) = max_value {
                let config_id = IncrementalState::config_id(&task.id, interface_id);
                if let Some(mut state) = self.repos.watermarks.get(&config_id).await? {
                    state.advance(&value, &execution.id);
                    self.repos.watermarks.put(&state).await?;
                }
            }
        }
        Ok(())
    }

    /// Run one standalone quality task execution over a sink sample
    pub async fn execute_quality(&self, quality_task_id: &str) -> Result<QualityExecution, SyncError> {
        let task = self
            .repos
            .quality
            .get_task(quality_task_id)
            .await?
            .ok_or_else(|| SyncError::Config(format!("unknown quality task {quality_task_id}")))?;
        let interface = self
            .repos
            .catalog
            .get_interface(&task.interface_id)
            .await?
            .ok_or_else(|| SyncError::Config(format!("unknown interface {}", task.interface_id)))?;

        let mut execution = QualityExecution::new(&task.id);
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(now_ms());
        self.repos.quality.put_execution(&execution).await?;

        let rows = match self.repos.sink.sample(&task.interface_id, task.sample_size).await {
            Ok(rows) => rows,
            Err(e) => {
                execution.status = ExecutionStatus::Failed;
                execution.finished_at = Some(now_ms());
                execution.updated_at = now_ms();
                self.repos.quality.put_execution(&execution).await?;
                return Err(e);
            }
        };
        let batch = RecordBatch::new(&task.interface_id, rows);
        let record_count = batch.len();

        let mut engine = QualityEngine::default();
        let outcome = engine.evaluate(&batch, &task.rules, &interface.primary_key_columns());

        execution.passed = outcome.passes(task.threshold);

        let issues = stamp_issues(&execution.id, &task.id, &task.interface_id, outcome.issues);
        if !issues.is_empty() {
            self.repos.issues.record(&issues).await?;
        }

        execution.overall_score = outcome.overall_score;
        execution.dimension_results = outcome.results;
        execution.status = ExecutionStatus::Success;
        execution.finished_at = Some(now_ms());
        execution.updated_at = now_ms();
        self.repos.quality.put_execution(&execution).await?;

        info!(
            quality_task = %task.name,
            score = execution.overall_score,
            passed = execution.passed,
            sampled = record_count,
            "quality run finished"
        );
        Ok(execution)
    }
}
