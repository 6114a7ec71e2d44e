//! Repository ports
//!
//! Narrow async interfaces the engine depends on for persistence. The
//! core never talks to a store directly; production deployments plug in
//! their own implementations, and the store-backed reference
//! implementations in this module cover tests and single-node use.
//!
//! The one atomicity requirement lives in [`Repos::commit_batch`]: the
//! sink upsert and the watermark advance for a sync config happen under
//! a per-config lock, so a crash between them can only ever replay a
//! batch (idempotent upsert), never skip one.

mod sink;
mod store_impl;

pub use sink::MemorySink;
pub use store_impl::StoreBackend;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    DataSource, ExecutionStatus, IncrementalState, Interface, IssueRecord, Library, LineageRecord,
    QualityExecution, QualityRuleTemplate, QualityTask, SyncTask, SyncTaskExecution,
};
use crate::error::SyncError;
use crate::pipeline::{RecordBatch, Row};

/// Sync task definitions and their scheduler bookkeeping
#[async_trait]
pub trait TaskRepo: Send + Sync {
    async fn put(&self, task: &SyncTask) -> Result<(), SyncError>;
    async fn get(&self, id: &str) -> Result<Option<SyncTask>, SyncError>;
    async fn delete(&self, id: &str) -> Result<bool, SyncError>;
    async fn list(&self) -> Result<Vec<SyncTask>, SyncError>;
    /// Enabled tasks due at or before `now` in a dispatchable status
    async fn list_due(&self, now_ms: i64) -> Result<Vec<SyncTask>, SyncError>;

    /// Compare-and-set lease acquisition: succeeds only when the task is
    /// enabled, dispatchable, and holds no active lease. On success the
    /// task is `running` with the given lease.
    async fn try_acquire_lease(&self, task_id: &str, token: &str, ttl_ms: i64) -> Result<bool, SyncError>;

    /// Stamp dispatch bookkeeping: `last_run_time` and the advanced
    /// `next_run_time` (None sends the task dormant)
    async fn advance_schedule(
        &self,
        task_id: &str,
        next_run_time: Option<i64>,
        last_run_time: i64,
    ) -> Result<(), SyncError>;

    /// Release the lease if `token` still owns it, settling the task
    /// status from the execution outcome and bumping run counters
    async fn release_lease(
        &self,
        task_id: &str,
        token: &str,
        outcome: ExecutionStatus,
        rows: u64,
    ) -> Result<(), SyncError>;

    /// Mark a task suppressed after a fatal error; no further dispatch
    /// until an operator resets it
    async fn suppress(&self, task_id: &str) -> Result<(), SyncError>;
}

/// Append-only execution records
#[async_trait]
pub trait ExecutionRepo: Send + Sync {
    async fn put(&self, execution: &SyncTaskExecution) -> Result<(), SyncError>;
    async fn get(&self, id: &str) -> Result<Option<SyncTaskExecution>, SyncError>;
    async fn list_for_task(&self, task_id: &str) -> Result<Vec<SyncTaskExecution>, SyncError>;
    async fn list_running(&self) -> Result<Vec<SyncTaskExecution>, SyncError>;
}

/// Incremental watermark state, keyed by sync config
#[async_trait]
pub trait WatermarkRepo: Send + Sync {
    async fn get(&self, sync_config_id: &str) -> Result<Option<IncrementalState>, SyncError>;
    async fn put(&self, state: &IncrementalState) -> Result<(), SyncError>;
}

/// Lineage records, write-once
#[async_trait]
pub trait LineageRepo: Send + Sync {
    async fn record(&self, records: &[LineageRecord]) -> Result<(), SyncError>;
    async fn list_for_execution(&self, execution_id: &str) -> Result<Vec<LineageRecord>, SyncError>;
}

/// Issue records, write-once
#[async_trait]
pub trait IssueRepo: Send + Sync {
    async fn record(&self, issues: &[IssueRecord]) -> Result<(), SyncError>;
    async fn list_for_execution(&self, execution_id: &str) -> Result<Vec<IssueRecord>, SyncError>;
}

/// Library/interface/source catalog lookups (ids only cross entity
/// boundaries; joins resolve here)
#[async_trait]
pub trait CatalogRepo: Send + Sync {
    async fn put_library(&self, library: &Library) -> Result<(), SyncError>;
    async fn get_library(&self, id: &str) -> Result<Option<Library>, SyncError>;
    async fn put_interface(&self, interface: &Interface) -> Result<(), SyncError>;
    async fn get_interface(&self, id: &str) -> Result<Option<Interface>, SyncError>;
    async fn put_source(&self, source: &DataSource) -> Result<(), SyncError>;
    async fn get_source(&self, id: &str) -> Result<Option<DataSource>, SyncError>;
}

/// Standalone quality tasks, rule templates, and their executions
#[async_trait]
pub trait QualityRepo: Send + Sync {
    async fn put_task(&self, task: &QualityTask) -> Result<(), SyncError>;
    async fn get_task(&self, id: &str) -> Result<Option<QualityTask>, SyncError>;
    async fn list_due_tasks(&self, now_ms: i64) -> Result<Vec<QualityTask>, SyncError>;
    async fn put_template(&self, template: &QualityRuleTemplate) -> Result<(), SyncError>;
    async fn list_templates(&self) -> Result<Vec<QualityRuleTemplate>, SyncError>;
    async fn put_execution(&self, execution: &QualityExecution) -> Result<(), SyncError>;
    async fn list_executions(&self, quality_task_id: &str) -> Result<Vec<QualityExecution>, SyncError>;
}

/// The downstream store rows land in
#[async_trait]
pub trait SinkWriter: Send + Sync {
    /// Materialize the sink table if it does not exist yet
    async fn ensure_table(&self, interface: &Interface) -> Result<(), SyncError>;

    /// Upsert the batch by the interface's primary key columns; returns
    /// the number of rows written. Must be idempotent for identical rows.
    async fn upsert(&self, interface: &Interface, batch: &RecordBatch) -> Result<u64, SyncError>;

    /// Up to `limit` rows currently in the sink, for quality sampling
    async fn sample(&self, interface_id: &str, limit: usize) -> Result<Vec<Row>, SyncError>;
}

/// The full port bundle handed to executors and the scheduler
#[derive(Clone)]
pub struct Repos {
    pub tasks: Arc<dyn TaskRepo>,
    pub executions: Arc<dyn ExecutionRepo>,
    pub watermarks: Arc<dyn WatermarkRepo>,
    pub lineage: Arc<dyn LineageRepo>,
    pub issues: Arc<dyn IssueRepo>,
    pub catalog: Arc<dyn CatalogRepo>,
    pub quality: Arc<dyn QualityRepo>,
    pub sink: Arc<dyn SinkWriter>,
    commit_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl Repos {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskRepo>,
        executions: Arc<dyn ExecutionRepo>,
        watermarks: Arc<dyn WatermarkRepo>,
        lineage: Arc<dyn LineageRepo>,
        issues: Arc<dyn IssueRepo>,
        catalog: Arc<dyn CatalogRepo>,
        quality: Arc<dyn QualityRepo>,
        sink: Arc<dyn SinkWriter>,
    ) -> Self {
        Self {
            tasks,
            executions,
            watermarks,
            lineage,
            issues,
            catalog,
            quality,
            sink,
            commit_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fully in-memory bundle for tests and embedded use
    pub fn in_memory() -> Self {
        let backend = Arc::new(StoreBackend::new(syncstore::MemoryStore::new()));
        Self::new(
            backend.clone(),
            backend.clone(),
            backend.clone(),
            backend.clone(),
            backend.clone(),
            backend.clone(),
            backend,
            Arc::new(MemorySink::new()),
        )
    }

    async fn commit_lock(&self, sync_config_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.commit_locks.lock().await;
        locks.entry(sync_config_id.to_string()).or_default().clone()
    }

    /// Commit one processed batch: upsert, lineage, watermark advance,
    /// all under the sync config's commit lock
    ///
    /// Returns the number of rows written and whether the watermark
    /// moved. Issues are NOT written here; they are not part of the
    /// atomic unit and survive even when the commit fails.
    pub async fn commit_batch(
        &self,
        interface: &Interface,
        batch: &RecordBatch,
        lineage: &[LineageRecord],
        watermark: Option<(&str, &str, &str)>,
    ) -> Result<u64, SyncError> {
        let _guard = match watermark {
            Some((sync_config_id, _, _)) => {
                let lock = self.commit_lock(sync_config_id).await;
                Some(lock.lock_owned().await)
            }
            None => None,
        };

        let written = self.sink.upsert(interface, batch).await?;
        if !lineage.is_empty() {
            self.lineage.record(lineage).await?;
        }

        if let Some((sync_config_id, value, execution_id)) = watermark {
            let mut state = self.watermarks.get(sync_config_id).await?.ok_or_else(|| {
                SyncError::Fatal(format!("incremental state missing for {sync_config_id}"))
            })?;
            state.advance(value, execution_id);
            self.watermarks.put(&state).await?;
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DataType, Field, IncrementalKind, TransportType};
    use serde_json::json;

    fn interface() -> Interface {
        let mut iface = Interface::new("lib-1", "orders", TransportType::Http);
        iface.fields = vec![
            Field::new("id", DataType::Integer).primary_key(),
            Field::new("updated_at", DataType::Timestamp).increment(),
        ];
        iface
    }

    fn row(id: i64, ts: &str) -> Row {
        let mut r = Row::new();
        r.insert("id".to_string(), json!(id));
        r.insert("updated_at".to_string(), json!(ts));
        r
    }

    #[tokio::test]
    async fn test_commit_batch_advances_watermark() {
        let repos = Repos::in_memory();
        let iface = interface();
        repos.catalog.put_interface(&iface).await.unwrap();

        let state = IncrementalState::new("t-1", &iface.id, IncrementalKind::Timestamp);
        let config_id = state.sync_config_id.clone();
        repos.watermarks.put(&state).await.unwrap();

        let batch = RecordBatch::new(&iface.id, vec![row(1, "2025-06-01T00:00:00Z")]);
        let written = repos
            .commit_batch(&iface, &batch, &[], Some((&config_id, "2025-06-01T00:00:00Z", "e-1")))
            .await
            .unwrap();
        assert_eq!(written, 1);

        let state = repos.watermarks.get(&config_id).await.unwrap().unwrap();
        assert_eq!(state.last_sync_value.as_deref(), Some("2025-06-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_commit_batch_idempotent_replay() {
        let repos = Repos::in_memory();
        let iface = interface();

        let batch = RecordBatch::new(&iface.id, vec![row(1, "2025-06-01T00:00:00Z")]);
        repos.commit_batch(&iface, &batch, &[], None).await.unwrap();
        repos.commit_batch(&iface, &batch, &[], None).await.unwrap();

        let rows = repos.sink.sample(&iface.id, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_batch_missing_watermark_is_fatal() {
        let repos = Repos::in_memory();
        let iface = interface();
        let batch = RecordBatch::new(&iface.id, vec![row(1, "2025-06-01T00:00:00Z")]);
        let err = repos
            .commit_batch(&iface, &batch, &[], Some(("t-1/nope", "x", "e-1")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
    }
}
