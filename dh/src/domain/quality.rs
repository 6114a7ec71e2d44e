//! Quality domain types
//!
//! Rule templates, bound rules, standalone quality tasks, their
//! executions, and the issue records every failed check produces.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use syncstore::{IndexValue, Record, now_ms};

use super::execution::ExecutionStatus;
use super::id::new_id;
use super::rules::{ValidationCheck, ValidationSeverity};
use super::task::TriggerType;
use crate::error::SyncError;

/// The six quality dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityDimension {
    Completeness,
    Accuracy,
    Consistency,
    Validity,
    Uniqueness,
    Timeliness,
}

impl std::fmt::Display for QualityDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityDimension::Completeness => write!(f, "completeness"),
            QualityDimension::Accuracy => write!(f, "accuracy"),
            QualityDimension::Consistency => write!(f, "consistency"),
            QualityDimension::Validity => write!(f, "validity"),
            QualityDimension::Uniqueness => write!(f, "uniqueness"),
            QualityDimension::Timeliness => write!(f, "timeliness"),
        }
    }
}

/// Comparison operator for cross-field consistency predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// Declarative rule logic, one variant per dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dimension", rename_all = "snake_case", deny_unknown_fields)]
pub enum QualityRuleSpec {
    /// 1 − null_count/total over the target columns
    Completeness { fields: Vec<String> },
    /// 1 − duplicate_count/total grouped by the key tuple
    Uniqueness { key_fields: Vec<String> },
    /// Fraction of rows passing the declared predicate
    Validity { field: String, check: ValidationCheck },
    /// Fraction of rows whose value appears in the reference set
    Accuracy { field: String, reference: Vec<Value> },
    /// Fraction of rows satisfying a cross-field predicate
    Consistency {
        left_field: String,
        op: CompareOp,
        right_field: String,
    },
    /// Fraction of rows whose timestamp is within the window from now
    Timeliness { field: String, max_age_secs: u64 },
}

impl QualityRuleSpec {
    pub fn dimension(&self) -> QualityDimension {
        match self {
            QualityRuleSpec::Completeness { .. } => QualityDimension::Completeness,
            QualityRuleSpec::Uniqueness { .. } => QualityDimension::Uniqueness,
            QualityRuleSpec::Validity { .. } => QualityDimension::Validity,
            QualityRuleSpec::Accuracy { .. } => QualityDimension::Accuracy,
            QualityRuleSpec::Consistency { .. } => QualityDimension::Consistency,
            QualityRuleSpec::Timeliness { .. } => QualityDimension::Timeliness,
        }
    }
}

/// Reusable rule template with defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRuleTemplate {
    pub id: String,
    pub name: String,
    pub dimension: QualityDimension,
    /// Grouping label for the template catalog
    #[serde(default)]
    pub category: Option<String>,
    pub default_threshold: f64,
    pub default_weight: f64,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Record for QualityRuleTemplate {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "quality_rule_templates"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("dimension".to_string(), IndexValue::String(self.dimension.to_string()));
        fields
    }
}

/// A rule bound to concrete fields, thresholds, and weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub template_id: Option<String>,
    pub spec: QualityRuleSpec,
    /// Minimum passing score for this dimension, in [0, 1]
    pub threshold: f64,
    /// Relative weight in the overall score
    pub weight: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl QualityRuleTemplate {
    pub fn new(name: impl Into<String>, dimension: QualityDimension, default_threshold: f64, default_weight: f64) -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            name: name.into(),
            dimension,
            category: None,
            default_threshold,
            default_weight,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl QualityRule {
    pub fn new(name: impl Into<String>, spec: QualityRuleSpec, threshold: f64, weight: f64) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            template_id: None,
            spec,
            threshold,
            weight,
            enabled: true,
        }
    }

    /// Bind a template to concrete fields, inheriting its defaults
    ///
    /// The spec's dimension must match the template's; a mismatch is a
    /// configuration error.
    pub fn from_template(template: &QualityRuleTemplate, spec: QualityRuleSpec) -> Result<Self, SyncError> {
        if spec.dimension() != template.dimension {
            return Err(SyncError::Config(format!(
                "template {} is a {} rule, got a {} spec",
                template.name,
                template.dimension,
                spec.dimension()
            )));
        }
        let mut rule = Self::new(template.name.clone(), spec, template.default_threshold, template.default_weight);
        rule.template_id = Some(template.id.clone());
        Ok(rule)
    }

    pub fn dimension(&self) -> QualityDimension {
        self.spec.dimension()
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(SyncError::Config(format!(
                "quality rule {}: threshold must be in [0, 1]",
                self.name
            )));
        }
        if self.weight <= 0.0 {
            return Err(SyncError::Config(format!("quality rule {}: weight must be > 0", self.name)));
        }
        match &self.spec {
            QualityRuleSpec::Completeness { fields } if fields.is_empty() => Err(SyncError::Config(format!(
                "quality rule {}: completeness needs target fields",
                self.name
            ))),
            QualityRuleSpec::Uniqueness { key_fields } if key_fields.is_empty() => Err(SyncError::Config(
                format!("quality rule {}: uniqueness needs key fields", self.name),
            )),
            QualityRuleSpec::Accuracy { reference, .. } if reference.is_empty() => Err(SyncError::Config(
                format!("quality rule {}: accuracy needs a reference set", self.name),
            )),
            QualityRuleSpec::Timeliness { max_age_secs: 0, .. } => Err(SyncError::Config(format!(
                "quality rule {}: timeliness window must be > 0",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

/// Result status of one dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionStatus {
    Pass,
    Warning,
    Fail,
}

/// Scored outcome for one dimension over one batch or run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionResult {
    pub dimension: QualityDimension,
    pub rule_id: String,
    pub rule_name: String,
    /// In [0, 1]
    pub score: f64,
    pub status: DimensionStatus,
    pub issue_count: u64,
    pub record_count: u64,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Standalone quality check task against a library interface
///
/// Schedule fields live directly on the task (cron + interval + once +
/// manual), matching the sync-task trigger model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityTask {
    pub id: String,
    pub name: String,
    pub library_id: String,
    pub interface_id: String,
    pub rules: Vec<QualityRule>,
    /// Overall passing threshold in [0, 1]
    pub threshold: f64,

    pub trigger: TriggerType,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub scheduled_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default = "default_tz")]
    pub timezone: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Rows sampled from the sink per run
    #[serde(default = "default_sample")]
    pub sample_size: usize,
    #[serde(default)]
    pub next_run_time: Option<i64>,
    #[serde(default)]
    pub last_run_time: Option<i64>,

    pub created_at: i64,
    pub updated_at: i64,
}

fn default_tz() -> String {
    "UTC".to_string()
}

fn default_sample() -> usize {
    1000
}

impl QualityTask {
    pub fn new(
        name: impl Into<String>,
        library_id: impl Into<String>,
        interface_id: impl Into<String>,
        trigger: TriggerType,
    ) -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            name: name.into(),
            library_id: library_id.into(),
            interface_id: interface_id.into(),
            rules: Vec::new(),
            threshold: 0.8,
            trigger,
            cron: None,
            interval_seconds: None,
            scheduled_time: None,
            timezone: default_tz(),
            enabled: true,
            sample_size: default_sample(),
            next_run_time: Some(now),
            last_run_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Next due time after `now`, mirroring the sync-task trigger model
    pub fn compute_next_run(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Option<i64>, SyncError> {
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
                let tz = crate::trigger::parse_tz(&self.timezone)?;
                Ok(crate::trigger::next_cron_after(expr, tz, now)?.map(|dt| dt.timestamp_millis()))
            }
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.rules.is_empty() {
            return Err(SyncError::Config(format!("quality task {} has no rules", self.name)));
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        match self.trigger {
            TriggerType::Cron => {
                let expr = self
                    .cron
                    .as_deref()
                    .ok_or_else(|| SyncError::Config("cron trigger requires a cron expression".into()))?;
                crate::trigger::validate_cron(expr)?;
                crate::trigger::parse_tz(&self.timezone)?;
            }
            TriggerType::Interval if self.interval_seconds.unwrap_or(0) == 0 => {
                return Err(SyncError::Config("interval trigger requires interval_seconds > 0".into()));
            }
            TriggerType::Once if self.scheduled_time.is_none() => {
                return Err(SyncError::Config("once trigger requires scheduled_time".into()));
            }
            _ => {}
        }
        Ok(())
    }
}

impl Record for QualityTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "quality_tasks"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("library_id".to_string(), IndexValue::String(self.library_id.clone()));
        fields.insert("interface_id".to_string(), IndexValue::String(self.interface_id.clone()));
        fields.insert("enabled".to_string(), IndexValue::Bool(self.enabled));
        if let Some(next) = self.next_run_time {
            fields.insert("next_run_time".to_string(), IndexValue::Int(next));
        }
        fields
    }
}

/// One run of a quality task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityExecution {
    pub id: String,
    pub quality_task_id: String,
    pub status: ExecutionStatus,
    /// Weight-normalized mean of enabled dimensions, in [0, 1]
    pub overall_score: f64,
    pub passed: bool,
    pub dimension_results: Vec<DimensionResult>,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl QualityExecution {
    pub fn new(quality_task_id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            quality_task_id: quality_task_id.into(),
            status: ExecutionStatus::Pending,
            overall_score: 0.0,
            passed: false,
            dimension_results: Vec::new(),
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for QualityExecution {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "quality_executions"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert(
            "quality_task_id".to_string(),
            IndexValue::String(self.quality_task_id.clone()),
        );
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields
    }
}

/// Severity of a recorded issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueSeverity::Low => write!(f, "low"),
            IssueSeverity::Medium => write!(f, "medium"),
            IssueSeverity::High => write!(f, "high"),
            IssueSeverity::Critical => write!(f, "critical"),
        }
    }
}

impl From<ValidationSeverity> for IssueSeverity {
    fn from(s: ValidationSeverity) -> Self {
        match s {
            ValidationSeverity::Low => IssueSeverity::Low,
            ValidationSeverity::Medium => IssueSeverity::Medium,
            ValidationSeverity::High => IssueSeverity::High,
            ValidationSeverity::Critical => IssueSeverity::Critical,
        }
    }
}

/// One offending row/field observation, shared with reports, never mutated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRecord {
    pub id: String,
    pub execution_id: String,
    #[serde(default)]
    pub task_id: Option<String>,
    pub interface_id: String,
    pub rule_id: String,
    pub rule_name: String,
    #[serde(default)]
    pub dimension: Option<QualityDimension>,
    /// Identifier of the offending row, when one could be derived
    #[serde(default)]
    pub row_id: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub actual: Option<Value>,
    #[serde(default)]
    pub expected: Option<String>,
    pub severity: IssueSeverity,
    pub message: String,
    pub created_at: i64,
}

impl IssueRecord {
    pub fn new(
        execution_id: impl Into<String>,
        interface_id: impl Into<String>,
        rule_id: impl Into<String>,
        rule_name: impl Into<String>,
        severity: IssueSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            execution_id: execution_id.into(),
            task_id: None,
            interface_id: interface_id.into(),
            rule_id: rule_id.into(),
            rule_name: rule_name.into(),
            dimension: None,
            row_id: None,
            field: None,
            actual: None,
            expected: None,
            severity,
            message: message.into(),
            created_at: now_ms(),
        }
    }

    pub fn with_row(mut self, row_id: impl Into<String>) -> Self {
        self.row_id = Some(row_id.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_values(mut self, actual: Value, expected: impl Into<String>) -> Self {
        self.actual = Some(actual);
        self.expected = Some(expected.into());
        self
    }

    pub fn with_dimension(mut self, dimension: QualityDimension) -> Self {
        self.dimension = Some(dimension);
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

impl Record for IssueRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.created_at
    }

    fn collection_name() -> &'static str {
        "issue_records"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("execution_id".to_string(), IndexValue::String(self.execution_id.clone()));
        fields.insert("interface_id".to_string(), IndexValue::String(self.interface_id.clone()));
        fields.insert("rule_id".to_string(), IndexValue::String(self.rule_id.clone()));
        fields.insert("severity".to_string(), IndexValue::String(self.severity.to_string()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_dimension_derivation() {
        let spec = QualityRuleSpec::Completeness {
            fields: vec!["email".to_string()],
        };
        assert_eq!(spec.dimension(), QualityDimension::Completeness);
    }

    #[test]
    fn test_rule_spec_tagged_serde() {
        let spec = QualityRuleSpec::Timeliness {
            field: "updated_at".to_string(),
            max_age_secs: 3600,
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"dimension\":\"timeliness\""));
        let back: QualityRuleSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_rule_validate_bounds() {
        let rule = QualityRule::new(
            "complete",
            QualityRuleSpec::Completeness {
                fields: vec!["a".to_string()],
            },
            1.5,
            1.0,
        );
        assert!(rule.validate().is_err());

        let rule = QualityRule::new(
            "complete",
            QualityRuleSpec::Completeness { fields: vec![] },
            0.9,
            1.0,
        );
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_rule_from_template() {
        let template = QualityRuleTemplate::new("non-null-email", QualityDimension::Completeness, 0.95, 2.0);
        let rule = QualityRule::from_template(
            &template,
            QualityRuleSpec::Completeness {
                fields: vec!["email".to_string()],
            },
        )
        .unwrap();
        assert_eq!(rule.threshold, 0.95);
        assert_eq!(rule.weight, 2.0);
        assert_eq!(rule.template_id.as_deref(), Some(template.id.as_str()));

        // Dimension mismatch is rejected
        let err = QualityRule::from_template(
            &template,
            QualityRuleSpec::Uniqueness {
                key_fields: vec!["id".to_string()],
            },
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_quality_task_validate() {
        let mut task = QualityTask::new("orders-quality", "lib-1", "if-1", TriggerType::Interval);
        assert!(task.validate().is_err());

        task.rules.push(QualityRule::new(
            "complete",
            QualityRuleSpec::Completeness {
                fields: vec!["id".to_string()],
            },
            0.9,
            1.0,
        ));
        assert!(task.validate().is_err());

        task.interval_seconds = Some(300);
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_issue_record_builders() {
        let issue = IssueRecord::new("e-1", "if-1", "r-1", "not-null", IssueSeverity::High, "null email")
            .with_row("row-9")
            .with_field("email")
            .with_values(Value::Null, "non-null")
            .with_dimension(QualityDimension::Completeness);
        assert_eq!(issue.row_id.as_deref(), Some("row-9"));
        assert_eq!(issue.dimension, Some(QualityDimension::Completeness));
    }

    #[test]
    fn test_severity_conversion() {
        assert_eq!(IssueSeverity::from(ValidationSeverity::Critical), IssueSeverity::Critical);
    }
}
