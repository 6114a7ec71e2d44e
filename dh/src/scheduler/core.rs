//! Scheduler implementation
//!
//! Scans for due tasks on a fixed interval, evaluates dependencies,
//! enqueues dispatchable work on a bounded priority queue, and runs a
//! fixed pool of workers that execute with a per-task deadline wired to
//! the cancellation token. Every instance is self-contained: tests can
//! run several schedulers side by side.

use std::collections::BinaryHeap;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{ExecutionType, SyncTask, now_ms};
use crate::error::SyncError;
use crate::executor::SyncExecutor;
use crate::repo::Repos;

use super::config::SchedulerConfig;
use super::queue::{ContextKind, SchedulerStats, TaskContext};

struct Inner {
    queue: BinaryHeap<TaskContext>,
    /// Keys of everything queued or running, to enforce one in-flight
    /// dispatch per task
    pending: HashSet<String>,
    stats: SchedulerStats,
}

fn key(kind: ContextKind, task_id: &str) -> String {
    match kind {
        ContextKind::Sync => format!("s:{task_id}"),
        ContextKind::Quality => format!("q:{task_id}"),
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    repos: Repos,
    executor: Arc<SyncExecutor>,
    inner: Mutex<Inner>,
    notify: Notify,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, repos: Repos, executor: Arc<SyncExecutor>) -> Arc<Self> {
        Arc::new(Self {
            config,
            repos,
            executor,
            inner: Mutex::new(Inner {
                queue: BinaryHeap::new(),
                pending: HashSet::new(),
                stats: SchedulerStats::default(),
            }),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Recovery pass plus scan loop and worker pool startup
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        self.recover().await?;

        let mut handles = self.handles.lock().await;
        for worker_id in 0..self.config.max_workers {
            let scheduler = Arc::clone(self);
            handles.push(tokio::spawn(async move { scheduler.worker_loop(worker_id).await }));
        }
        let scheduler = Arc::clone(self);
        handles.push(tokio::spawn(async move { scheduler.scan_loop().await }));
        info!(workers = self.config.max_workers, "scheduler started");
        Ok(())
    }

    /// Cancel everything and wait for workers to settle
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.notify.notify_waiters();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            let bounded = tokio::time::timeout(self.config.graceful_shutdown_timeout, handle).await;
            if let Ok(Err(e)) = bounded {
                if !e.is_cancelled() {
                    warn!(error = %e, "scheduler task ended abnormally");
                }
            }
        }
        info!("scheduler stopped");
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.inner.lock().await.stats.clone()
    }

    /// On-demand dispatch of a sync task, ahead of its schedule
    pub async fn trigger_now(&self, task_id: &str) -> Result<bool, SyncError> {
        let task = self
            .repos
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| SyncError::Config(format!("unknown task {task_id}")))?;
        let ctx = TaskContext::sync(
            &task.id,
            task.priority,
            ExecutionType::Manual,
            std::time::Duration::from_secs(task.config.timeout_seconds),
        );
        Ok(self.enqueue(ctx).await)
    }

    /// Executions still marked running whose lease has lapsed belong to a
    /// dead worker; settle them as failed
    async fn recover(&self) -> Result<(), SyncError> {
        let now = now_ms();
        let orphans = self.repos.executions.list_running().await?;
        for mut execution in orphans {
            let task = self.repos.tasks.get(&execution.task_id).await?;
            let stale = task.as_ref().is_none_or(|t| !t.lease_active(now));
            if !stale {
                continue;
            }
            execution.fail(&SyncError::Fatal("worker_lost".into()));
            self.repos.executions.put(&execution).await?;
            if let Some(mut task) = task {
                task.lease_token = None;
                task.lease_expires_at = None;
                task.status = crate::domain::TaskStatus::Failed;
                self.repos.tasks.put(&task).await?;
            }
            let mut inner = self.inner.lock().await;
            inner.stats.recovered_executions += 1;
            warn!(execution_id = %execution.id, "recovered orphaned execution as failed");
        }
        Ok(())
    }

    async fn scan_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.check_interval) => {}
            }
            if let Err(e) = self.scan_once().await {
                warn!(error = %e, "scheduler scan failed");
            }
        }
    }

    /// One due-task scan: sync tasks, then standalone quality tasks
    pub async fn scan_once(&self) -> Result<(), SyncError> {
        let now = now_ms();
        {
            let mut inner = self.inner.lock().await;
            inner.stats.scans += 1;
        }

        for task in self.repos.tasks.list_due(now).await? {
            if !self.dependencies_satisfied(&task, now).await? {
                let mut inner = self.inner.lock().await;
                inner.stats.dependency_deferrals += 1;
                continue;
            }
            let ctx = TaskContext::sync(
                &task.id,
                task.priority,
                ExecutionType::Scheduled,
                std::time::Duration::from_secs(task.config.timeout_seconds),
            );
            if self.enqueue(ctx).await {
                let next = task.compute_next_run(Utc::now())?;
                self.repos.tasks.advance_schedule(&task.id, next, now).await?;
                debug!(task = %task.name, ?next, "dispatched");
            }
        }

        for mut task in self.repos.quality.list_due_tasks(now).await? {
            let ctx = TaskContext::quality(&task.id, std::time::Duration::from_secs(600));
            if self.enqueue(ctx).await {
                task.next_run_time = task.compute_next_run(Utc::now())?;
                task.last_run_time = Some(now);
                task.updated_at = now;
                self.repos.quality.put_task(&task).await?;
            }
        }
        Ok(())
    }

    /// All declared dependencies must have reached a recent-enough
    /// terminal state (successful one when `wait_for_success` is set)
    async fn dependencies_satisfied(&self, task: &SyncTask, now: i64) -> Result<bool, SyncError> {
        if task.dependencies.is_empty() {
            return Ok(true);
        }
        let window_ms = (task.dependency_window_secs as i64) * 1000;
        for dep in &task.dependencies {
            let executions = self.repos.executions.list_for_task(dep).await?;
            let satisfied = executions.iter().any(|e| {
                e.status.is_terminal()
                    && e.finished_at.is_some_and(|f| now - f <= window_ms)
                    && (!task.wait_for_success || e.status == crate::domain::ExecutionStatus::Success)
            });
            if !satisfied {
                debug!(task = %task.name, dep, "dependency unmet, deferring");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn enqueue(&self, ctx: TaskContext) -> bool {
        let mut inner = self.inner.lock().await;
        let ctx_key = key(ctx.kind, &ctx.task_id);
        if inner.pending.contains(&ctx_key) {
            return false;
        }
        if inner.queue.len() >= self.config.queue_capacity {
            inner.stats.queue_full_deferrals += 1;
            return false;
        }
        inner.pending.insert(ctx_key);
        inner.queue.push(ctx);
        inner.stats.dispatched += 1;
        inner.stats.peak_queue_depth = inner.stats.peak_queue_depth.max(inner.queue.len());
        drop(inner);
        self.notify.notify_one();
        true
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "worker started");
        loop {
            let ctx = loop {
                if self.shutdown.is_cancelled() {
                    return;
                }
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(ctx) = inner.queue.pop() {
                        let running = self.config.max_workers.min(inner.pending.len() - inner.queue.len());
                        inner.stats.peak_running = inner.stats.peak_running.max(running);
                        break ctx;
                    }
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(self.config.check_interval) => {}
                }
            };

            self.dispatch(&ctx).await;

            let mut inner = self.inner.lock().await;
            inner.pending.remove(&key(ctx.kind, &ctx.task_id));
            inner.stats.completed += 1;
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Run one context on this worker with its deadline; panics and
    /// overruns are contained so the worker slot never leaks
    async fn dispatch(&self, ctx: &TaskContext) {
        let cancel = self.shutdown.child_token();
        let executor = Arc::clone(&self.executor);
        let task_id = ctx.task_id.clone();
        let execution_type = ctx.execution_type;
        let kind = ctx.kind;

        let run_cancel = cancel.clone();
        let mut handle = tokio::spawn(async move {
            match kind {
                ContextKind::Sync => executor
                    .execute(&task_id, execution_type, run_cancel)
                    .await
                    .map(|_| ()),
                ContextKind::Quality => executor.execute_quality(&task_id).await.map(|_| ()),
            }
        });

        let finished = tokio::select! {
            joined = &mut handle => Some(joined),
            _ = tokio::time::sleep(ctx.timeout) => None,
        };

        let joined = match finished {
            Some(joined) => joined,
            None => {
                debug!(task_id = %ctx.task_id, "deadline hit, cancelling execution");
                cancel.cancel();
                tokio::select! {
                    joined = &mut handle => joined,
                    _ = tokio::time::sleep(self.config.graceful_shutdown_timeout) => {
                        // Graceful window overshot: force it down
                        handle.abort();
                        handle.await
                    }
                }
            }
        };

        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(task_id = %ctx.task_id, error = %e, "dispatch failed");
            }
            Err(join_error) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.stats.worker_crashes += 1;
                }
                if join_error.is_panic() {
                    warn!(task_id = %ctx.task_id, "worker panicked, settling execution as failed");
                }
                self.settle_crashed(&ctx.task_id).await;
            }
        }
    }

    /// Mark any still-running execution of a crashed dispatch as failed
    async fn settle_crashed(&self, task_id: &str) {
        let running = match self.repos.executions.list_running().await {
            Ok(running) => running,
            Err(e) => {
                warn!(error = %e, "could not list running executions after crash");
                return;
            }
        };
        for mut execution in running.into_iter().filter(|e| e.task_id == task_id) {
            execution.fail(&SyncError::Fatal("worker crashed".into()));
            if let Err(e) = self.repos.executions.put(&execution).await {
                warn!(error = %e, "could not settle crashed execution");
            }
        }
    }
}
