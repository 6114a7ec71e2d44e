//! Quality rule engine
//!
//! Evaluates dimension rules over a record batch, producing per-dimension
//! scores, an overall weight-normalized score, and issue records for
//! offending rows. Stateless across batches except for the bounded
//! duplicate-tracking bloom filters behind uniqueness rules; when a
//! filter saturates, uniqueness degrades to per-batch scope and every
//! subsequent evaluation carries an approximation warning.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use super::bloom::BloomFilter;
use crate::domain::{
    CompareOp, DimensionResult, DimensionStatus, IssueSeverity, QualityRule, QualityRuleSpec, compare_values,
};
use crate::pipeline::{RecordBatch, RowIssue, validate_value, value_to_string};

/// Default memory budget for duplicate tracking, per rule
pub const DEFAULT_UNIQUENESS_BUDGET_BYTES: usize = 1 << 20;

/// Outcome of evaluating a rule set over one batch
#[derive(Debug)]
pub struct EvaluationOutcome {
    pub results: Vec<DimensionResult>,
    /// Weight-normalized mean of enabled rule scores, in [0, 1]
    pub overall_score: f64,
    pub issues: Vec<RowIssue>,
    /// Uniqueness degraded to per-batch scope this evaluation
    pub approximated: bool,
}

impl EvaluationOutcome {
    /// `pass` iff overall ≥ threshold and no dimension failed
    pub fn passes(&self, threshold: f64) -> bool {
        self.overall_score >= threshold && !self.results.iter().any(|r| r.status == DimensionStatus::Fail)
    }
}

/// Rule engine instance, one per sync-config or quality run
pub struct QualityEngine {
    trackers: HashMap<String, BloomFilter>,
    uniqueness_budget_bytes: usize,
    degraded: bool,
}

impl Default for QualityEngine {
    fn default() -> Self {
        Self::new(DEFAULT_UNIQUENESS_BUDGET_BYTES)
    }
}

impl QualityEngine {
    pub fn new(uniqueness_budget_bytes: usize) -> Self {
        Self {
            trackers: HashMap::new(),
            uniqueness_budget_bytes,
            degraded: false,
        }
    }

    /// Whether cross-batch uniqueness has degraded to per-batch scope
    pub fn is_approximating(&self) -> bool {
        self.degraded
    }

    /// Evaluate enabled rules over a batch
    pub fn evaluate(&mut self, batch: &RecordBatch, rules: &[QualityRule], pk_cols: &[String]) -> EvaluationOutcome {
        self.evaluate_at(batch, rules, pk_cols, Utc::now())
    }

    /// Evaluation with an injected clock, for timeliness rules
    pub fn evaluate_at(
        &mut self,
        batch: &RecordBatch,
        rules: &[QualityRule],
        pk_cols: &[String],
        now: DateTime<Utc>,
    ) -> EvaluationOutcome {
        let mut results = Vec::new();
        let mut issues = Vec::new();

        for rule in rules.iter().filter(|r| r.enabled) {
            let result = self.evaluate_rule(batch, rule, pk_cols, now, &mut issues);
            results.push(result);
        }

        let total_weight: f64 = rules.iter().filter(|r| r.enabled).map(|r| r.weight).sum();
        let overall_score = if total_weight > 0.0 {
            results
                .iter()
                .zip(rules.iter().filter(|r| r.enabled))
                .map(|(res, rule)| res.score * rule.weight)
                .sum::<f64>()
                / total_weight
        } else {
            1.0
        };

        EvaluationOutcome {
            results,
            overall_score,
            issues,
            approximated: self.degraded,
        }
    }

    fn evaluate_rule(
        &mut self,
        batch: &RecordBatch,
        rule: &QualityRule,
        pk_cols: &[String],
        now: DateTime<Utc>,
        issues: &mut Vec<RowIssue>,
    ) -> DimensionResult {
        let record_count = batch.len() as u64;
        let mut issue_count = 0u64;
        let mut details = serde_json::Map::new();

        let mut flag = |row: &crate::pipeline::Row, field: Option<&str>, expected: String, message: String| {
            let row_id = RecordBatch::row_identity(row, pk_cols);
            let mut issue = RowIssue::new(&row_id, &rule.id, &rule.name, IssueSeverity::Medium, message)
                .with_dimension(rule.dimension());
            if let Some(f) = field {
                let actual = row.get(f).cloned().unwrap_or(Value::Null);
                issue = issue.with_field(f).with_values(actual, expected);
            }
            issues.push(issue);
        };

        match &rule.spec {
            QualityRuleSpec::Completeness { fields } => {
                let mut cells = 0u64;
                let mut nulls = 0u64;
                for row in &batch.rows {
                    for field in fields {
                        cells += 1;
                        let missing = row.get(field).is_none_or(Value::is_null);
                        if missing {
                            nulls += 1;
                            flag(row, Some(field), "non-null".to_string(), format!("{field} is null"));
                        }
                    }
                }
                issue_count = nulls;
                details.insert("null_count".to_string(), json!(nulls));
                let score = if cells == 0 { 1.0 } else { 1.0 - (nulls as f64 / cells as f64) };
                return self.finish(rule, score, issue_count, record_count, details);
            }
            QualityRuleSpec::Uniqueness { key_fields } => {
                let mut duplicates = 0u64;
                let mut batch_seen: HashSet<String> = HashSet::new();
                let budget = self.uniqueness_budget_bytes;
                let tracker = self
                    .trackers
                    .entry(rule.id.clone())
                    .or_insert_with(|| BloomFilter::with_budget_bytes(budget));
                let mut saturated = tracker.saturated();

                for row in &batch.rows {
                    let key = key_fields
                        .iter()
                        .map(|f| row.get(f).map(value_to_string).unwrap_or_default())
                        .collect::<Vec<_>>()
                        .join("/");
                    let dup_in_batch = !batch_seen.insert(key.clone());
                    let dup = if saturated {
                        // Budget exhausted: per-batch scope only
                        dup_in_batch
                    } else {
                        let dup_tracked = tracker.check_and_insert(&key);
                        saturated = tracker.saturated();
                        dup_in_batch || dup_tracked
                    };
                    if dup {
                        duplicates += 1;
                        flag(row, None, "unique key".to_string(), format!("duplicate key {key}"));
                    }
                }
                if saturated {
                    self.degraded = true;
                    details.insert("uniqueness_approximated".to_string(), json!(true));
                }
                issue_count = duplicates;
                details.insert("duplicate_count".to_string(), json!(duplicates));
                let score = if record_count == 0 {
                    1.0
                } else {
                    1.0 - (duplicates as f64 / record_count as f64)
                };
                return self.finish(rule, score, issue_count, record_count, details);
            }
            QualityRuleSpec::Validity { field, check } => {
                for row in &batch.rows {
                    let value = row.get(field).cloned().unwrap_or(Value::Null);
                    if !validate_value(check, &value) {
                        issue_count += 1;
                        flag(row, Some(field), "valid value".to_string(), format!("{field} failed validity"));
                    }
                }
            }
            QualityRuleSpec::Accuracy { field, reference } => {
                for row in &batch.rows {
                    let value = row.get(field).cloned().unwrap_or(Value::Null);
                    if !reference.contains(&value) {
                        issue_count += 1;
                        flag(
                            row,
                            Some(field),
                            "reference value".to_string(),
                            format!("{field} not in reference set"),
                        );
                    }
                }
            }
            QualityRuleSpec::Consistency {
                left_field,
                op,
                right_field,
            } => {
                for row in &batch.rows {
                    let left = row.get(left_field).cloned().unwrap_or(Value::Null);
                    let right = row.get(right_field).cloned().unwrap_or(Value::Null);
                    if !consistent(&left, *op, &right) {
                        issue_count += 1;
                        flag(
                            row,
                            Some(left_field),
                            format!("{left_field} {op:?} {right_field}"),
                            format!("cross-field predicate failed: {left} vs {right}"),
                        );
                    }
                }
            }
            QualityRuleSpec::Timeliness { field, max_age_secs } => {
                for row in &batch.rows {
                    let value = row.get(field).cloned().unwrap_or(Value::Null);
                    if !timely(&value, *max_age_secs, now) {
                        issue_count += 1;
                        flag(
                            row,
                            Some(field),
                            format!("within {max_age_secs}s of now"),
                            format!("{field} is stale or unparseable"),
                        );
                    }
                }
            }
        }

        let score = if record_count == 0 {
            1.0
        } else {
            1.0 - (issue_count as f64 / record_count as f64)
        };
        self.finish(rule, score, issue_count, record_count, details)
    }

    fn finish(
        &self,
        rule: &QualityRule,
        score: f64,
        issue_count: u64,
        record_count: u64,
        details: serde_json::Map<String, Value>,
    ) -> DimensionResult {
        let status = if score < rule.threshold {
            DimensionStatus::Fail
        } else if issue_count > 0 {
            DimensionStatus::Warning
        } else {
            DimensionStatus::Pass
        };
        DimensionResult {
            dimension: rule.dimension(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            score,
            status,
            issue_count,
            record_count,
            details,
        }
    }
}

fn consistent(left: &Value, op: CompareOp, right: &Value) -> bool {
    if left.is_null() || right.is_null() {
        return false;
    }
    let ordering = compare_values(&value_to_string(left), &value_to_string(right));
    match op {
        CompareOp::Eq => ordering == std::cmp::Ordering::Equal,
        CompareOp::Ne => ordering != std::cmp::Ordering::Equal,
        CompareOp::Lt => ordering == std::cmp::Ordering::Less,
        CompareOp::Lte => ordering != std::cmp::Ordering::Greater,
        CompareOp::Gt => ordering == std::cmp::Ordering::Greater,
        CompareOp::Gte => ordering != std::cmp::Ordering::Less,
    }
}

fn timely(value: &Value, max_age_secs: u64, now: DateTime<Utc>) -> bool {
    let instant = match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    };
    match instant {
        Some(t) => {
            let age = now.signed_duration_since(t);
            age.num_seconds() >= 0 && age.num_seconds() as u64 <= max_age_secs
        }
        None => false,
    }
}
