//! Best-effort event persistence
//!
//! A spawned consumer appends lifecycle events to one JSONL file per
//! execution. Writes are batched on a flush interval; a write failure is
//! logged and dropped, never propagated back to the executor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::bus::EventBus;
use super::types::{EventLogEntry, HubEvent};

/// How long buffered entries wait before being flushed
const FLUSH_INTERVAL: Duration = Duration::from_millis(750);

/// Consume lifecycle events from the bus and append them to JSONL files
/// under `dir`, one file per execution id
pub fn spawn_event_logger(bus: &Arc<EventBus>, dir: impl Into<PathBuf>) -> JoinHandle<()> {
    let dir = dir.into();
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        let mut buffer: HashMap<String, Vec<EventLogEntry>> = HashMap::new();
        let mut flush = tokio::time::interval(FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) if event.is_lifecycle() => {
                            buffer
                                .entry(event.execution_id().to_string())
                                .or_default()
                                .push(EventLogEntry::new(event));
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                _ = flush.tick() => {
                    flush_buffer(&dir, &mut buffer).await;
                }
            }
        }
        flush_buffer(&dir, &mut buffer).await;
        debug!("event logger stopped");
    })
}

async fn flush_buffer(dir: &Path, buffer: &mut HashMap<String, Vec<EventLogEntry>>) {
    for (execution_id, entries) in buffer.drain() {
        if let Err(e) = append_entries(dir, &execution_id, &entries).await {
            warn!(execution_id, error = %e, "failed to persist events, dropping");
        }
    }
}

async fn append_entries(dir: &Path, execution_id: &str, entries: &[EventLogEntry]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{execution_id}.jsonl"));
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
    let mut out = String::new();
    for entry in entries {
        match serde_json::to_string(&entry.event.envelope(entry.timestamp)) {
            Ok(line) => {
                out.push_str(&line);
                out.push('\n');
            }
            Err(e) => warn!(execution_id, error = %e, "unserializable event skipped"),
        }
    }
    file.write_all(out.as_bytes()).await?;
    Ok(())
}

/// Read back the persisted events for an execution, oldest first
pub async fn read_execution_events(dir: impl AsRef<Path>, execution_id: &str) -> std::io::Result<Vec<serde_json::Value>> {
    let path = dir.as_ref().join(format!("{execution_id}.jsonl"));
    let raw = tokio::fs::read_to_string(&path).await?;
    Ok(raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::bus::create_event_bus;

    #[tokio::test]
    async fn test_logger_persists_lifecycle_events() {
        let dir = tempfile::tempdir().unwrap();
        let bus = create_event_bus();
        let handle = spawn_event_logger(&bus, dir.path());

        let emitter = bus.emitter_for("t-1", "e-log");
        emitter.task_started("manual");
        emitter.task_completed(
            crate::domain::ExecutionStatus::Success,
            crate::domain::ExecutionCounters::default(),
        );

        // Wait out a flush tick
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let events = read_execution_events(dir.path(), "e-log").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["kind"], "task_started");
        assert_eq!(events[1]["kind"], "task_completed");

        handle.abort();
    }

    #[tokio::test]
    async fn test_logger_skips_progress_events() {
        let dir = tempfile::tempdir().unwrap();
        let bus = create_event_bus();
        let handle = spawn_event_logger(&bus, dir.path());

        let mut emitter = bus.emitter_for("t-1", "e-prog");
        emitter.progress("if-1", 10, None, 1.0);
        emitter.task_started("manual");

        tokio::time::sleep(Duration::from_millis(1200)).await;

        let events = read_execution_events(dir.path(), "e-prog").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["kind"], "task_started");

        handle.abort();
    }
}
