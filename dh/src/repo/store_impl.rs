//! Store-backed reference implementation of the repository ports
//!
//! One backend over any `syncstore::Store`. Lease acquisition is a
//! read-modify-write serialized by an internal mutex, which is enough
//! for the single-process deployments this implementation targets.

use async_trait::async_trait;
use syncstore::{Filter, FilterOp, Store, now_ms};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{
    DataSource, ExecutionStatus, IncrementalState, Interface, IssueRecord, Library, LineageRecord,
    QualityExecution, QualityRuleTemplate, QualityTask, SyncTask, SyncTaskExecution, TaskStatus,
};
use crate::error::SyncError;

use super::{CatalogRepo, ExecutionRepo, IssueRepo, LineageRepo, QualityRepo, TaskRepo, WatermarkRepo};

pub struct StoreBackend<S: Store> {
    store: S,
    task_mutex: Mutex<()>,
}

impl<S: Store> StoreBackend<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            task_mutex: Mutex::new(()),
        }
    }

    fn load_task(&self, task_id: &str) -> Result<SyncTask, SyncError> {
        self.store
            .get::<SyncTask>(task_id)?
            .ok_or_else(|| SyncError::Config(format!("unknown task {task_id}")))
    }
}

#[async_trait]
impl<S: Store + 'static> TaskRepo for StoreBackend<S> {
    async fn put(&self, task: &SyncTask) -> Result<(), SyncError> {
        task.validate()?;
        self.store.put(task)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SyncTask>, SyncError> {
        Ok(self.store.get(id)?)
    }

    async fn delete(&self, id: &str) -> Result<bool, SyncError> {
        Ok(self.store.delete::<SyncTask>(id)?)
    }

    async fn list(&self) -> Result<Vec<SyncTask>, SyncError> {
        Ok(self.store.all()?)
    }

    async fn list_due(&self, now_ms: i64) -> Result<Vec<SyncTask>, SyncError> {
        let mut due: Vec<SyncTask> = self.store.query(&[
            Filter::eq("enabled", true),
            Filter::new("next_run_time", FilterOp::Lte, now_ms),
        ])?;
        due.retain(|t| t.status.is_dispatchable());
        Ok(due)
    }

    async fn try_acquire_lease(&self, task_id: &str, token: &str, ttl_ms: i64) -> Result<bool, SyncError> {
        let _guard = self.task_mutex.lock().await;
        let mut task = self.load_task(task_id)?;
        let now = now_ms();
        if !task.enabled || !task.status.is_dispatchable() || task.lease_active(now) {
            debug!(task_id, status = %task.status, "lease denied");
            return Ok(false);
        }
        task.status = TaskStatus::Running;
        task.lease_token = Some(token.to_string());
        task.lease_expires_at = Some(now + ttl_ms);
        task.updated_at = now;
        self.store.put(&task)?;
        debug!(task_id, token, "lease acquired");
        Ok(true)
    }

    async fn advance_schedule(
        &self,
        task_id: &str,
        next_run_time: Option<i64>,
        last_run_time: i64,
    ) -> Result<(), SyncError> {
        let _guard = self.task_mutex.lock().await;
        let mut task = self.load_task(task_id)?;
        task.next_run_time = next_run_time;
        task.last_run_time = Some(last_run_time);
        task.updated_at = now_ms();
        self.store.put(&task)?;
        Ok(())
    }

    async fn release_lease(
        &self,
        task_id: &str,
        token: &str,
        outcome: ExecutionStatus,
        rows: u64,
    ) -> Result<(), SyncError> {
        let _guard = self.task_mutex.lock().await;
        let mut task = self.load_task(task_id)?;
        if task.lease_token.as_deref() != Some(token) {
            debug!(task_id, token, "stale lease release ignored");
            return Ok(());
        }
        task.lease_token = None;
        task.lease_expires_at = None;
        task.status = match outcome {
            ExecutionStatus::Success => TaskStatus::Completed,
            ExecutionStatus::Cancelled => TaskStatus::Cancelled,
            _ => TaskStatus::Failed,
        };
        task.record_run(outcome, rows);
        self.store.put(&task)?;
        Ok(())
    }

    async fn suppress(&self, task_id: &str) -> Result<(), SyncError> {
        let _guard = self.task_mutex.lock().await;
        let mut task = self.load_task(task_id)?;
        task.status = TaskStatus::Suppressed;
        task.lease_token = None;
        task.lease_expires_at = None;
        task.updated_at = now_ms();
        self.store.put(&task)?;
        Ok(())
    }
}

#[async_trait]
impl<S: Store + 'static> ExecutionRepo for StoreBackend<S> {
    async fn put(&self, execution: &SyncTaskExecution) -> Result<(), SyncError> {
        self.store.put(execution)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SyncTaskExecution>, SyncError> {
        Ok(self.store.get(id)?)
    }

    async fn list_for_task(&self, task_id: &str) -> Result<Vec<SyncTaskExecution>, SyncError> {
        let mut execs: Vec<SyncTaskExecution> = self.store.query(&[Filter::eq("task_id", task_id)])?;
        execs.sort_by_key(|e| std::cmp::Reverse(e.started_at.unwrap_or(e.created_at)));
        Ok(execs)
    }

    async fn list_running(&self) -> Result<Vec<SyncTaskExecution>, SyncError> {
        Ok(self.store.query(&[Filter::eq("status", "running")])?)
    }
}

#[async_trait]
impl<S: Store + 'static> WatermarkRepo for StoreBackend<S> {
    async fn get(&self, sync_config_id: &str) -> Result<Option<IncrementalState>, SyncError> {
        let mut states: Vec<IncrementalState> =
            self.store.query(&[Filter::eq("sync_config_id", sync_config_id)])?;
        Ok(states.pop())
    }

    async fn put(&self, state: &IncrementalState) -> Result<(), SyncError> {
        self.store.put(state)?;
        Ok(())
    }
}

#[async_trait]
impl<S: Store + 'static> LineageRepo for StoreBackend<S> {
    async fn record(&self, records: &[LineageRecord]) -> Result<(), SyncError> {
        for record in records {
            self.store.put(record)?;
        }
        Ok(())
    }

    async fn list_for_execution(&self, execution_id: &str) -> Result<Vec<LineageRecord>, SyncError> {
        Ok(self.store.query(&[Filter::eq("execution_id", execution_id)])?)
    }
}

#[async_trait]
impl<S: Store + 'static> IssueRepo for StoreBackend<S> {
    async fn record(&self, issues: &[IssueRecord]) -> Result<(), SyncError> {
        for issue in issues {
            self.store.put(issue)?;
        }
        Ok(())
    }

    async fn list_for_execution(&self, execution_id: &str) -> Result<Vec<IssueRecord>, SyncError> {
        Ok(self.store.query(&[Filter::eq("execution_id", execution_id)])?)
    }
}

#[async_trait]
impl<S: Store + 'static> CatalogRepo for StoreBackend<S> {
    async fn put_library(&self, library: &Library) -> Result<(), SyncError> {
        self.store.put(library)?;
        Ok(())
    }

    async fn get_library(&self, id: &str) -> Result<Option<Library>, SyncError> {
        Ok(self.store.get(id)?)
    }

    async fn put_interface(&self, interface: &Interface) -> Result<(), SyncError> {
        interface.validate()?;
        self.store.put(interface)?;
        Ok(())
    }

    async fn get_interface(&self, id: &str) -> Result<Option<Interface>, SyncError> {
        Ok(self.store.get(id)?)
    }

    async fn put_source(&self, source: &DataSource) -> Result<(), SyncError> {
        source.connection.validate()?;
        self.store.put(source)?;
        Ok(())
    }

    async fn get_source(&self, id: &str) -> Result<Option<DataSource>, SyncError> {
        Ok(self.store.get(id)?)
    }
}

#[async_trait]
impl<S: Store + 'static> QualityRepo for StoreBackend<S> {
    async fn put_task(&self, task: &QualityTask) -> Result<(), SyncError> {
        task.validate()?;
        self.store.put(task)?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<QualityTask>, SyncError> {
        Ok(self.store.get(id)?)
    }

    async fn list_due_tasks(&self, now_ms: i64) -> Result<Vec<QualityTask>, SyncError> {
        Ok(self.store.query(&[
            Filter::eq("enabled", true),
            Filter::new("next_run_time", FilterOp::Lte, now_ms),
        ])?)
    }

    async fn put_template(&self, template: &QualityRuleTemplate) -> Result<(), SyncError> {
        self.store.put(template)?;
        Ok(())
    }

    async fn list_templates(&self) -> Result<Vec<QualityRuleTemplate>, SyncError> {
        Ok(self.store.all()?)
    }

    async fn put_execution(&self, execution: &QualityExecution) -> Result<(), SyncError> {
        self.store.put(execution)?;
        Ok(())
    }

    async fn list_executions(&self, quality_task_id: &str) -> Result<Vec<QualityExecution>, SyncError> {
        Ok(self.store.query(&[Filter::eq("quality_task_id", quality_task_id)])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LibraryKind, SyncTaskInterface, TaskType, TriggerType};
    use syncstore::MemoryStore;

    fn task(name: &str) -> SyncTask {
        let mut t = SyncTask::new(name, LibraryKind::Basic, "lib-1", TaskType::Full, TriggerType::Manual);
        t.interfaces.push(SyncTaskInterface::new("if-1"));
        t
    }

    fn backend() -> StoreBackend<MemoryStore> {
        StoreBackend::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_task_roundtrip() {
        let b = backend();
        let t = task("alpha");
        TaskRepo::put(&b, &t).await.unwrap();
        let loaded = TaskRepo::get(&b, &t.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "alpha");
    }

    #[tokio::test]
    async fn test_put_rejects_invalid_task() {
        let b = backend();
        let mut t = task("bad");
        t.interfaces.clear();
        assert!(TaskRepo::put(&b, &t).await.is_err());
    }

    #[tokio::test]
    async fn test_list_due_filters() {
        let b = backend();
        let now = now_ms();

        let mut due = task("due");
        due.next_run_time = Some(now - 1000);
        TaskRepo::put(&b, &due).await.unwrap();

        let mut later = task("later");
        later.next_run_time = Some(now + 60_000);
        TaskRepo::put(&b, &later).await.unwrap();

        let mut disabled = task("disabled");
        disabled.next_run_time = Some(now - 1000);
        disabled.enabled = false;
        TaskRepo::put(&b, &disabled).await.unwrap();

        let listed = b.list_due(now).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "due");
    }

    #[tokio::test]
    async fn test_lease_cas() {
        let b = backend();
        let t = task("leased");
        TaskRepo::put(&b, &t).await.unwrap();

        assert!(b.try_acquire_lease(&t.id, "w-1", 30_000).await.unwrap());
        // Second acquisition is a no-op while the lease is live
        assert!(!b.try_acquire_lease(&t.id, "w-2", 30_000).await.unwrap());

        b.release_lease(&t.id, "w-1", ExecutionStatus::Success, 42).await.unwrap();
        let loaded = TaskRepo::get(&b, &t.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.counters.success_runs, 1);
        assert_eq!(loaded.counters.rows_processed, 42);

        // Released task can be leased again
        assert!(b.try_acquire_lease(&t.id, "w-3", 30_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_release_ignored() {
        let b = backend();
        let t = task("stale");
        TaskRepo::put(&b, &t).await.unwrap();
        b.try_acquire_lease(&t.id, "w-1", 30_000).await.unwrap();

        b.release_lease(&t.id, "not-the-owner", ExecutionStatus::Failed, 0)
            .await
            .unwrap();
        let loaded = TaskRepo::get(&b, &t.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_suppress_blocks_lease() {
        let b = backend();
        let t = task("fatal");
        TaskRepo::put(&b, &t).await.unwrap();
        b.suppress(&t.id).await.unwrap();
        assert!(!b.try_acquire_lease(&t.id, "w-1", 30_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_executions_sorted_desc() {
        let b = backend();
        let mut e1 = SyncTaskExecution::new("t-1", crate::domain::ExecutionType::Scheduled);
        e1.start();
        ExecutionRepo::put(&b, &e1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut e2 = SyncTaskExecution::new("t-1", crate::domain::ExecutionType::Scheduled);
        e2.start();
        ExecutionRepo::put(&b, &e2).await.unwrap();

        let listed = b.list_for_task("t-1").await.unwrap();
        assert_eq!(listed[0].id, e2.id);
    }

    #[tokio::test]
    async fn test_watermark_lookup_by_config() {
        let b = backend();
        let state = IncrementalState::new("t-1", "if-1", crate::domain::IncrementalKind::Timestamp);
        WatermarkRepo::put(&b, &state).await.unwrap();
        let loaded = WatermarkRepo::get(&b, &state.sync_config_id).await.unwrap().unwrap();
        assert_eq!(loaded.id, state.id);
        assert!(WatermarkRepo::get(&b, "t-x/if-x").await.unwrap().is_none());
    }
}
