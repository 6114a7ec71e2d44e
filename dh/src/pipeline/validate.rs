//! Validate stage
//!
//! Evaluates the interface's validation rules per row. A failed
//! `critical` rule rejects the row; lower severities record an issue and
//! let the row continue. Null values only fail `not_null` checks:
//! nullability is its own rule, not a side effect of every predicate.

use std::net::Ipv4Addr;
use std::str::FromStr;

use serde_json::Value;

use super::batch::{RecordBatch, RowIssue};
use crate::domain::{FormatKind, ValidationCheck, ValidationRule, ValidationSeverity};

/// Outcome of the validate stage
#[derive(Debug)]
pub struct ValidateOutcome {
    /// Batch with critically failed rows removed
    pub batch: RecordBatch,
    pub issues: Vec<RowIssue>,
    pub rejected: u64,
}

/// Run the enabled validation rules over a batch
pub fn apply_rules(batch: &RecordBatch, rules: &[ValidationRule], pk_cols: &[String]) -> ValidateOutcome {
    let enabled: Vec<&ValidationRule> = rules.iter().filter(|r| r.enabled).collect();
    let mut kept = Vec::with_capacity(batch.rows.len());
    let mut issues = Vec::new();
    let mut rejected = 0u64;

    for row in &batch.rows {
        let row_id = RecordBatch::row_identity(row, pk_cols);
        let mut reject = false;

        for rule in &enabled {
            let value = row.get(&rule.field).cloned().unwrap_or(Value::Null);
            if passes(&rule.check, &value) {
                continue;
            }
            issues.push(
                RowIssue::new(&row_id, &rule.id, &rule.name, rule.severity.into(), describe_failure(rule, &value))
                    .with_field(&rule.field)
                    .with_values(value, expectation(&rule.check)),
            );
            if rule.severity == ValidationSeverity::Critical {
                reject = true;
            }
        }

        if reject {
            rejected += 1;
        } else {
            kept.push(row.clone());
        }
    }

    ValidateOutcome {
        batch: batch.with_rows(kept),
        issues,
        rejected,
    }
}

/// Evaluate one check against one value
pub fn passes(check: &ValidationCheck, value: &Value) -> bool {
    if value.is_null() {
        return !matches!(check, ValidationCheck::NotNull);
    }
    match check {
        ValidationCheck::NotNull => true,
        ValidationCheck::Format { format } => value.as_str().is_some_and(|s| passes_format(*format, s)),
        ValidationCheck::Regex { pattern } => match (value.as_str(), regex::Regex::new(pattern)) {
            (Some(s), Ok(re)) => re.is_match(s),
            _ => false,
        },
        ValidationCheck::Range { min, max } => {
            let Some(n) = value.as_f64() else { return false };
            min.is_none_or(|lo| n >= lo) && max.is_none_or(|hi| n <= hi)
        }
        ValidationCheck::OneOf { allowed } | ValidationCheck::Reference { values: allowed } => {
            allowed.contains(value)
        }
    }
}

fn passes_format(format: FormatKind, s: &str) -> bool {
    match format {
        FormatKind::Email => {
            let Some((local, domain)) = s.split_once('@') else { return false };
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        FormatKind::Url => s.starts_with("http://") || s.starts_with("https://"),
        FormatKind::Uuid => uuid::Uuid::parse_str(s).is_ok(),
        FormatKind::Ipv4 => Ipv4Addr::from_str(s).is_ok(),
        FormatKind::Date => chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
    }
}

fn expectation(check: &ValidationCheck) -> String {
    match check {
        ValidationCheck::NotNull => "non-null".to_string(),
        ValidationCheck::Format { format } => format!("{format:?} format").to_lowercase(),
        ValidationCheck::Regex { pattern } => format!("match /{pattern}/"),
        ValidationCheck::Range { min, max } => format!("in [{min:?}, {max:?}]"),
        ValidationCheck::OneOf { allowed } => format!("one of {} values", allowed.len()),
        ValidationCheck::Reference { values } => format!("in reference set of {}", values.len()),
    }
}

fn describe_failure(rule: &ValidationRule, value: &Value) -> String {
    format!("{} failed on {}: {value}", rule.name, rule.field)
}
