//! Event bus - pub/sub for engine activity
//!
//! Built on tokio broadcast channels: emit is fire-and-forget, a slow
//! consumer lags and skips (drop-oldest) rather than stalling the
//! executor. Skipped events are tallied on the bus so operators can see
//! that a consumer fell behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::debug;

use super::types::HubEvent;
use crate::domain::{ExecutionCounters, ExecutionStatus, IssueSeverity};

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8192;

/// Minimum spacing between progress events from one emitter (≤ 2 Hz)
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Central event bus for engine activity
pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers; no subscribers is fine
    pub fn emit(&self, event: HubEvent) {
        debug!(kind = event.kind(), execution_id = event.execution_id(), "emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(self: &Arc<Self>) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
            bus: Arc::clone(self),
        }
    }

    /// Emitter bound to one execution
    pub fn emitter_for(
        self: &Arc<Self>,
        task_id: impl Into<String>,
        execution_id: impl Into<String>,
    ) -> EventEmitter {
        EventEmitter {
            tx: self.tx.clone(),
            task_id: task_id.into(),
            execution_id: execution_id.into(),
            last_progress: None,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Events skipped by lagging consumers so far
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Receiving half; transparently counts drop-oldest skips on the bus
pub struct EventSubscriber {
    rx: broadcast::Receiver<HubEvent>,
    bus: Arc<EventBus>,
}

impl EventSubscriber {
    /// Next event; lag is recorded on the bus and skipped over
    pub async fn recv(&mut self) -> Option<HubEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.bus.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant for drain loops in tests and shutdown paths
    pub fn try_recv(&mut self) -> Option<HubEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.bus.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}

/// Handle for one execution to emit events without owning the bus
pub struct EventEmitter {
    tx: broadcast::Sender<HubEvent>,
    task_id: String,
    execution_id: String,
    last_progress: Option<Instant>,
}

impl EventEmitter {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn emit(&self, event: HubEvent) {
        let _ = self.tx.send(event);
    }

    /// A second emitter bound to the same execution (for parallel subs)
    pub fn fork(&self) -> EventEmitter {
        EventEmitter {
            tx: self.tx.clone(),
            task_id: self.task_id.clone(),
            execution_id: self.execution_id.clone(),
            last_progress: None,
        }
    }

    pub fn task_started(&self, execution_type: &str) {
        self.emit(HubEvent::TaskStarted {
            task_id: self.task_id.clone(),
            execution_id: self.execution_id.clone(),
            execution_type: execution_type.to_string(),
        });
    }

    /// Progress, throttled to at most one event per [`PROGRESS_INTERVAL`]
    ///
    /// Returns whether the event was actually emitted.
    pub fn progress(&mut self, interface_id: &str, processed: u64, total: Option<u64>, speed: f64) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_progress {
            if now.duration_since(last) < PROGRESS_INTERVAL {
                return false;
            }
        }
        self.last_progress = Some(now);
        self.emit(HubEvent::Progress {
            task_id: self.task_id.clone(),
            execution_id: self.execution_id.clone(),
            interface_id: interface_id.to_string(),
            processed,
            total,
            speed,
        });
        true
    }

    pub fn batch_committed(&self, interface_id: &str, size: usize, quality_score: Option<f64>) {
        self.emit(HubEvent::BatchCommitted {
            task_id: self.task_id.clone(),
            execution_id: self.execution_id.clone(),
            interface_id: interface_id.to_string(),
            size,
            quality_score,
        });
    }

    pub fn quality_issue(&self, rule: &str, severity: IssueSeverity, count: u64) {
        self.emit(HubEvent::QualityIssue {
            task_id: self.task_id.clone(),
            execution_id: self.execution_id.clone(),
            rule: rule.to_string(),
            severity,
            count,
        });
    }

    pub fn connection_lost(&self, source: &str) {
        self.emit(HubEvent::ConnectionLost {
            task_id: self.task_id.clone(),
            execution_id: self.execution_id.clone(),
            source: source.to_string(),
        });
    }

    pub fn connection_restored(&self, source: &str, reconnect_count: u32) {
        self.emit(HubEvent::ConnectionRestored {
            task_id: self.task_id.clone(),
            execution_id: self.execution_id.clone(),
            source: source.to_string(),
            reconnect_count,
        });
    }

    pub fn degraded(&self, reason: &str) {
        self.emit(HubEvent::Degraded {
            task_id: self.task_id.clone(),
            execution_id: self.execution_id.clone(),
            reason: reason.to_string(),
        });
    }

    pub fn task_completed(&self, status: ExecutionStatus, counters: ExecutionCounters) {
        self.emit(HubEvent::TaskCompleted {
            task_id: self.task_id.clone(),
            execution_id: self.execution_id.clone(),
            status,
            counters,
        });
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}
