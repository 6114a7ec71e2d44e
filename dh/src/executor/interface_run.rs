//! Per-interface sub-execution
//!
//! Drives one member interface of a sync task: obtains records through
//! the connector, runs them through the pipeline, and commits batches
//! atomically with watermark advancement. Batch mode pulls pages until
//! EOF; realtime mode consumes a bounded channel fed by the connector's
//! subscription. Cancellation is observed at batch boundaries.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connector::{Connector, FetchResult, StreamEvent};
use crate::domain::{
    DataType, IncrementalKind, IncrementalState, Interface, InterfaceExecution, IssueRecord, IssueSeverity,
    LineageRecord, SyncTask, TaskType,
};
use crate::error::{ErrorKind, SyncError};
use crate::events::EventEmitter;
use crate::pipeline::{Pipeline, ProcessedBatch, RecordBatch, RowIssue};
use crate::repo::Repos;
use crate::retry::{RetryAction, RetryPolicy};

/// A processed batch held back for thematic merging
pub(crate) struct CollectedBatch {
    pub batch: RecordBatch,
    pub quality_score: f64,
    pub transforms: Vec<String>,
}

pub(crate) struct RunOutcome {
    pub sub: InterfaceExecution,
    pub collected: Vec<CollectedBatch>,
}

pub(crate) struct InterfaceRunner {
    pub repos: Repos,
    pub retry: RetryPolicy,
    pub task: Arc<SyncTask>,
    pub interface: Interface,
    pub connector: Option<Box<dyn Connector>>,
    pub emitter: EventEmitter,
    pub cancel: CancellationToken,
    pub execution_id: String,
    pub batch_size: usize,
    /// Thematic tasks hold batches back for the cross-interface merge
    pub collect_for_merge: bool,
}

impl InterfaceRunner {
    pub async fn run(mut self) -> RunOutcome {
        let mut sub = InterfaceExecution::new(&self.execution_id, &self.interface.id);
        sub.start();
        let mut collected = Vec::new();

        let mut connector = match self.connector.take() {
            Some(connector) => connector,
            None => {
                sub.fail(&SyncError::Fatal("interface runner built without a connector".into()));
                return RunOutcome { sub, collected };
            }
        };

        let result = self.drive(&mut connector, &mut sub, &mut collected).await;

        // Release the connector on every exit path
        if let Err(e) = connector.close().await {
            warn!(interface = %self.interface.name, error = %e, "connector close failed");
        }

        match result {
            Ok(true) => sub.cancel(),
            Ok(false) => sub.succeed(),
            Err(e) if e.is_cancelled() => sub.cancel(),
            Err(e) => {
                if e.kind() == ErrorKind::Schema {
                    let issue = self.batch_failure_issue(&e);
                    if let Err(persist) = self.repos.issues.record(&[issue]).await {
                        warn!(error = %persist, "failed to persist schema issue");
                    }
                }
                sub.fail(&e);
            }
        }
        RunOutcome { sub, collected }
    }

    async fn drive(
        &mut self,
        connector: &mut Box<dyn Connector>,
        sub: &mut InterfaceExecution,
        collected: &mut Vec<CollectedBatch>,
    ) -> Result<bool, SyncError> {
        self.open_with_retry(connector).await?;
        match self.task.task_type {
            TaskType::Full | TaskType::Incremental => self.run_batched(connector, sub, collected).await,
            TaskType::Realtime => self.run_realtime(connector, sub).await,
        }
    }

    /// Batch-mode loop; returns whether the run ended by cancellation
    async fn run_batched(
        &mut self,
        connector: &mut Box<dyn Connector>,
        sub: &mut InterfaceExecution,
        collected: &mut Vec<CollectedBatch>,
    ) -> Result<bool, SyncError> {
        let mut pipeline = Pipeline::new(
            self.interface.clone(),
            self.interface.default_quality_rules(),
            self.task.mask_salt(),
            self.task.config.quality_threshold,
            self.task.config.gate_policy,
        );
        let increment_field = self.interface.increment_field().map(|f| f.name.clone());

        // Incremental runs resume from the committed watermark
        let state = if self.task.task_type == TaskType::Incremental && increment_field.is_some() {
            Some(self.load_or_create_state().await?)
        } else {
            None
        };
        let sync_config_id = state.as_ref().map(|s| s.sync_config_id.clone());
        let mut cursor = connector.initial_cursor(state.as_ref().and_then(|s| s.last_sync_value.as_deref()));

        let started = Instant::now();
        let mut approximation_warned = false;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }

            let fetched = self.fetch_with_retry(connector, cursor.as_deref(), self.batch_size).await?;
            if fetched.records.is_empty() && fetched.eof {
                break;
            }

            let processed = match pipeline.process_payloads(&fetched.records) {
                Ok(processed) => processed,
                Err(failure) => {
                    self.persist_issues(failure.issues).await;
                    return Err(failure.error);
                }
            };
            self.persist_issues(processed.issues.clone()).await;

            let watermark_value = increment_field
                .as_deref()
                .and_then(|field| processed.batch.max_increment_value(field));

            if self.collect_for_merge {
                sub.counters.record_batch(processed.batch.len() as u64, processed.rejected, processed.skipped);
                collected.push(CollectedBatch {
                    batch: processed.batch,
                    quality_score: processed.quality_score,
                    transforms: pipeline.transform_names(),
                });
            } else {
                let written = self.commit_with_retry(&pipeline, &processed, &sync_config_id, &watermark_value).await?;
                sub.counters.record_batch(written, processed.rejected, processed.skipped);
                self.emitter
                    .batch_committed(&self.interface.id, processed.batch.len(), Some(processed.quality_score));
            }

            for result in &processed.quality {
                if result.issue_count > 0 {
                    self.emitter
                        .quality_issue(&result.rule_name, IssueSeverity::Medium, result.issue_count);
                }
            }
            if processed.approximated && !approximation_warned {
                approximation_warned = true;
                self.emitter.quality_issue("uniqueness_approximated", IssueSeverity::Low, 1);
            }

            let elapsed = started.elapsed().as_secs_f64().max(0.001);
            let speed = sub.counters.processed as f64 / elapsed;
            self.emitter
                .progress(&self.interface.id, sub.counters.processed, sub.counters.total, speed);

            cursor = fetched.next_cursor;
            if fetched.eof {
                break;
            }
        }
        sub.counters.total = Some(sub.counters.processed);
        Ok(false)
    }

    /// Realtime loop: subscription feeding a bounded channel; each record
    /// is a singleton batch
    async fn run_realtime(
        &mut self,
        connector: &mut Box<dyn Connector>,
        sub: &mut InterfaceExecution,
    ) -> Result<bool, SyncError> {
        let mut pipeline = Pipeline::new(
            self.interface.clone(),
            self.interface.default_quality_rules(),
            self.task.mask_salt(),
            self.task.config.quality_threshold,
            self.task.config.gate_policy,
        );

        let (tx, mut rx) = mpsc::channel::<StreamEvent>(self.task.config.buffer_size);
        let consume_cancel = self.cancel.child_token();
        let subscribe_cancel = consume_cancel.clone();

        let repos = self.repos.clone();
        let interface = self.interface.clone();
        let task = Arc::clone(&self.task);
        let execution_id = self.execution_id.clone();
        let mut emitter = self.emitter.fork();

        let subscribe_fut = connector.subscribe(subscribe_cancel, tx);

        let consume_fut = async {
            let started = Instant::now();
            let mut result: Result<(), SyncError> = Ok(());
            while let Some(event) = rx.recv().await {
                // Cancellation is observed per record, the realtime batch
                // boundary; whatever was committed stays committed
                if consume_cancel.is_cancelled() {
                    break;
                }
                match event {
                    StreamEvent::Record { payload, channel, .. } => {
                        debug!(channel, "realtime record");
                        match pipeline.process_payloads(std::slice::from_ref(&payload)) {
                            Ok(processed) => {
                                let issues =
                                    stamp_issues(&execution_id, &task.id, &interface.id, processed.issues.clone());
                                if let Err(e) = repos.issues.record(&issues).await {
                                    warn!(error = %e, "failed to persist issues");
                                }
                                let lineage = lineage_for(
                                    &interface,
                                    &processed,
                                    &interface.id,
                                    &execution_id,
                                    &pipeline.transform_names(),
                                );
                                match repos.commit_batch(&interface, &processed.batch, &lineage, None).await {
                                    Ok(written) => {
                                        sub.counters.record_batch(written, processed.rejected, processed.skipped);
                                        let elapsed = started.elapsed().as_secs_f64().max(0.001);
                                        emitter.progress(
                                            &interface.id,
                                            sub.counters.processed,
                                            None,
                                            sub.counters.processed as f64 / elapsed,
                                        );
                                    }
                                    Err(e) => {
                                        result = Err(e);
                                        break;
                                    }
                                }
                            }
                            Err(failure) => {
                                let issues =
                                    stamp_issues(&execution_id, &task.id, &interface.id, failure.issues);
                                if let Err(e) = repos.issues.record(&issues).await {
                                    warn!(error = %e, "failed to persist issues");
                                }
                                sub.counters.record_batch(0, 1, 0);
                            }
                        }
                    }
                    StreamEvent::ConnectionLost { source } => {
                        sub.degraded = true;
                        emitter.connection_lost(&source);
                        emitter.degraded("stream connection lost, reconnecting");
                    }
                    StreamEvent::ConnectionRestored {
                        source,
                        reconnect_count,
                    } => {
                        sub.reconnect_count = reconnect_count;
                        emitter.connection_restored(&source, reconnect_count);
                    }
                }
            }
            // A consume-side failure must unwind the subscription too
            if result.is_err() {
                consume_cancel.cancel();
            }
            result
        };

        let (subscribed, consumed) = tokio::join!(subscribe_fut, consume_fut);

        let overflow = connector.stats().overflow;
        if overflow > 0 {
            sub.degraded = true;
            self.emitter.degraded("ingest buffer overflow, records dropped");
            sub.counters.record_batch(0, 0, overflow);
            let mut issue = IssueRecord::new(
                &self.execution_id,
                &self.interface.id,
                "overflow",
                "ingest_overflow",
                IssueSeverity::High,
                format!("{overflow} records dropped on ingest buffer overflow"),
            );
            issue.task_id = Some(self.task.id.clone());
            if let Err(e) = self.repos.issues.record(&[issue]).await {
                warn!(error = %e, "failed to persist overflow issue");
            }
        }

        subscribed?;
        consumed?;
        Ok(self.cancel.is_cancelled())
    }

    async fn load_or_create_state(&self) -> Result<IncrementalState, SyncError> {
        let config_id = IncrementalState::config_id(&self.task.id, &self.interface.id);
        if let Some(state) = self.repos.watermarks.get(&config_id).await? {
            return Ok(state);
        }
        let kind = match self.interface.increment_field().map(|f| f.data_type) {
            Some(DataType::Timestamp) => IncrementalKind::Timestamp,
            Some(DataType::Integer) => IncrementalKind::IdRange,
            _ => IncrementalKind::LogBased,
        };
        let mut state = IncrementalState::new(&self.task.id, &self.interface.id, kind);
        state.batch_size = self.batch_size;
        self.repos.watermarks.put(&state).await?;
        Ok(state)
    }

    async fn open_with_retry(&self, connector: &mut Box<dyn Connector>) -> Result<(), SyncError> {
        let mut attempt = 0u32;
        let mut refreshed = false;
        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            match connector.open().await {
                Ok(()) => return Ok(()),
                Err(e) => match self.retry.next_action(&e, attempt, refreshed) {
                    RetryAction::Abort => return Err(e),
                    RetryAction::RefreshAndRetry => {
                        connector.refresh_auth().await?;
                        refreshed = true;
                        attempt += 1;
                    }
                    RetryAction::RetryAfter(delay) => {
                        attempt += 1;
                        self.sleep_or_cancel(delay).await?;
                    }
                },
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        connector: &mut Box<dyn Connector>,
        cursor: Option<&str>,
        max: usize,
    ) -> Result<FetchResult, SyncError> {
        let mut attempt = 0u32;
        let mut refreshed = false;
        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            match connector.fetch_batch(cursor, max).await {
                Ok(result) => return Ok(result),
                Err(e) => match self.retry.next_action(&e, attempt, refreshed) {
                    RetryAction::Abort => return Err(e),
                    RetryAction::RefreshAndRetry => {
                        debug!(interface = %self.interface.name, "refreshing credentials after auth failure");
                        connector.refresh_auth().await?;
                        refreshed = true;
                        attempt += 1;
                    }
                    RetryAction::RetryAfter(delay) => {
                        debug!(interface = %self.interface.name, attempt, ?delay, "retrying fetch");
                        attempt += 1;
                        self.sleep_or_cancel(delay).await?;
                    }
                },
            }
        }
    }

    /// Commit with retry; the whole batch is retried on write conflicts,
    /// which is safe because the upsert is idempotent
    async fn commit_with_retry(
        &self,
        pipeline: &Pipeline,
        processed: &ProcessedBatch,
        sync_config_id: &Option<String>,
        watermark_value: &Option<String>,
    ) -> Result<u64, SyncError> {
        let lineage = lineage_for(
            &self.interface,
            processed,
            &self.interface.id,
            &self.execution_id,
            &pipeline.transform_names(),
        );
        let watermark = match (sync_config_id, watermark_value) {
            (Some(config), Some(value)) => Some((config.as_str(), value.as_str(), self.execution_id.as_str())),
            _ => None,
        };

        let mut attempt = 0u32;
        loop {
            match self
                .repos
                .commit_batch(&self.interface, &processed.batch, &lineage, watermark)
                .await
            {
                Ok(written) => return Ok(written),
                Err(e) => match self.retry.next_action(&e, attempt, true) {
                    RetryAction::RetryAfter(delay) => {
                        warn!(interface = %self.interface.name, attempt, error = %e, "retrying batch commit");
                        attempt += 1;
                        self.sleep_or_cancel(delay).await?;
                    }
                    _ => return Err(e),
                },
            }
        }
    }

    async fn sleep_or_cancel(&self, delay: std::time::Duration) -> Result<(), SyncError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn persist_issues(&self, issues: Vec<RowIssue>) {
        if issues.is_empty() {
            return;
        }
        let records = stamp_issues(&self.execution_id, &self.task.id, &self.interface.id, issues);
        if let Err(e) = self.repos.issues.record(&records).await {
            warn!(error = %e, "failed to persist issues");
        }
    }

    fn batch_failure_issue(&self, error: &SyncError) -> IssueRecord {
        let mut issue = IssueRecord::new(
            &self.execution_id,
            &self.interface.id,
            "schema",
            "schema_mismatch",
            IssueSeverity::Critical,
            error.concise_message(),
        );
        issue.task_id = Some(self.task.id.clone());
        issue
    }
}

/// Stamp execution context onto stage-produced row issues
pub(crate) fn stamp_issues(
    execution_id: &str,
    task_id: &str,
    interface_id: &str,
    issues: Vec<RowIssue>,
) -> Vec<IssueRecord> {
    issues
        .into_iter()
        .map(|issue| {
            let mut record = IssueRecord::new(
                execution_id,
                interface_id,
                issue.rule_id,
                issue.rule_name,
                issue.severity,
                issue.message,
            );
            record.task_id = Some(task_id.to_string());
            record.row_id = Some(issue.row_id);
            record.field = issue.field;
            record.actual = issue.actual;
            record.expected = issue.expected;
            record.dimension = issue.dimension;
            record
        })
        .collect()
}

/// One lineage record per row written
pub(crate) fn lineage_for(
    source_interface: &Interface,
    processed: &ProcessedBatch,
    target_interface_id: &str,
    execution_id: &str,
    transforms: &[String],
) -> Vec<LineageRecord> {
    let pk_cols = source_interface.primary_key_columns();
    processed
        .batch
        .rows
        .iter()
        .map(|row| {
            let identity = RecordBatch::row_identity(row, &pk_cols);
            LineageRecord::new(
                &source_interface.library_id,
                &source_interface.id,
                &identity,
                target_interface_id,
                &identity,
                execution_id,
            )
            .with_transforms(transforms.to_vec())
            .with_quality_score(processed.quality_score)
        })
        .collect()
}
