//! DataHub - data hub synchronization engine
//!
//! Ingests records from heterogeneous sources (HTTP APIs, SQL databases,
//! Kafka, MQTT, Redis pub/sub, files), runs them through a per-interface
//! pipeline (parse, cleanse, validate, mask, quality gate), and lands
//! the result in basic or thematic libraries through narrow repository
//! ports. Tasks run once, on interval, by cron, or on demand; full,
//! incremental, or realtime.
//!
//! # Modules
//!
//! - [`connector`] - Uniform source adapters with lifecycle and reconnect
//! - [`pipeline`] - Record batch stages
//! - [`quality`] - Dimension rule engine
//! - [`executor`] - Single-execution driver with interface fan-out
//! - [`scheduler`] - Due-task scanning and the worker pool
//! - [`repo`] - Repository ports and reference implementations
//! - [`events`] - Event bus and progress streaming
//! - [`domain`] - Entities and declarative rule configs

pub mod cli;
pub mod config;
pub mod connector;
pub mod domain;
pub mod error;
pub mod events;
pub mod executor;
pub mod pipeline;
pub mod quality;
pub mod repo;
pub mod retry;
pub mod scheduler;
pub mod trigger;

// Re-export commonly used types
pub use config::EngineConfig;
pub use connector::{Connector, ConnectorRegistry, ConnectorStats, FetchResult, StreamEvent};
pub use domain::{
    ExecutionStatus, ExecutionType, IncrementalState, Interface, Library, LibraryKind, SyncTask,
    SyncTaskExecution, TaskPayload, TaskStatus, TaskType, TriggerType,
};
pub use error::{ErrorKind, RetryDecision, SyncError};
pub use events::{EventBus, EventEmitter, HubEvent, create_event_bus};
pub use executor::SyncExecutor;
pub use pipeline::{Pipeline, ProcessedBatch, RecordBatch, Row};
pub use quality::QualityEngine;
pub use repo::{MemorySink, Repos, StoreBackend};
pub use retry::{RetryAction, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerConfig, TaskContext};
