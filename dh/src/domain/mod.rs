//! Domain types for the sync engine
//!
//! Libraries, interfaces, data sources, sync tasks and their executions,
//! incremental watermark state, quality entities, and lineage. All
//! persistable entities implement the `Record` trait so any
//! `syncstore::Store` backend can hold them.

mod execution;
mod fingerprint;
mod id;
mod interface;
mod library;
mod lineage;
mod priority;
mod quality;
mod rules;
mod source;
mod task;
mod watermark;

pub use execution::{
    ExecutionCounters, ExecutionStatus, ExecutionType, InterfaceExecution, SyncTaskExecution,
};
pub use fingerprint::{canonical_json, fingerprint};
pub use id::new_id;
pub use interface::{DataType, Field, Interface, ParseConfig, TransportType};
pub use library::{Library, LibraryKind, LibraryStatus};
pub use lineage::LineageRecord;
pub use priority::Priority;
pub use quality::{
    CompareOp, DimensionResult, DimensionStatus, IssueRecord, IssueSeverity, QualityDimension,
    QualityExecution, QualityRule, QualityRuleSpec, QualityRuleTemplate, QualityTask,
};
pub use rules::{
    CleanseAction, CleansingRule, ConflictPolicy, FieldMapping, FormatKind, MaskAction, MaskingRule,
    ValidationCheck, ValidationRule, ValidationSeverity,
};
pub use source::{ConnectionConfig, DataSource, HttpAuthConfig, MqttTopic, SourceCategory, SourceParams};
pub use task::{
    FailurePolicy, GatePolicy, MergeConfig, SyncTask, SyncTaskInterface, TaskConfig, TaskCounters,
    TaskPayload, TaskStatus, TaskType, TriggerType,
};
pub use watermark::{IncrementalKind, IncrementalState, compare_values};

// Re-export store types for convenience
pub use syncstore::{Filter, FilterOp, IndexValue, Record, Store, now_ms};
