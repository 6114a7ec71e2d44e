//! Cleanse stage
//!
//! Runs the interface's enabled cleansing rules in chain order. Rules
//! fail open: a failed rule records an issue and leaves the value alone.
//! A rule marked `stop_on_failure` aborts the whole batch instead;
//! already-committed batches are unaffected.

use serde_json::Value;

use super::batch::{RecordBatch, RowIssue};
use crate::domain::{CleanseAction, CleansingRule, IssueSeverity};

/// Outcome of the cleanse stage
#[derive(Debug)]
pub struct CleanseOutcome {
    pub batch: RecordBatch,
    pub issues: Vec<RowIssue>,
    /// A `stop_on_failure` rule failed; the caller must fail this batch
    pub aborted: bool,
}

/// Apply the cleansing chain to a batch
pub fn apply_chain(batch: &RecordBatch, rules: &[&CleansingRule], pk_cols: &[String]) -> CleanseOutcome {
    let mut rows = batch.rows.clone();
    let mut issues = Vec::new();

    for rule in rules {
        for row in rows.iter_mut() {
            let row_id = RecordBatch::row_identity(row, pk_cols);
            for field in &rule.target_fields {
                let original = row.get(field).cloned().unwrap_or(Value::Null);
                match apply_action(&rule.action, &original) {
                    Ok(Some(new_value)) => {
                        if rule.backup_original && new_value != original {
                            row.insert(format!("{field}__orig"), original);
                        }
                        row.insert(field.clone(), new_value);
                    }
                    Ok(None) => {}
                    Err(reason) => {
                        let severity = if rule.stop_on_failure {
                            IssueSeverity::High
                        } else {
                            IssueSeverity::Medium
                        };
                        issues.push(
                            RowIssue::new(&row_id, &rule.id, &rule.name, severity, &reason)
                                .with_field(field)
                                .with_values(original, rule.name.clone()),
                        );
                        if rule.stop_on_failure {
                            return CleanseOutcome {
                                batch: batch.with_rows(Vec::new()),
                                issues,
                                aborted: true,
                            };
                        }
                    }
                }
            }
        }
    }

    CleanseOutcome {
        batch: batch.with_rows(rows),
        issues,
        aborted: false,
    }
}

/// Apply one action to one value
///
/// `Ok(None)` means no change (action does not apply to this value's
/// type); `Err` is a rule failure for this row/field.
fn apply_action(action: &CleanseAction, value: &Value) -> Result<Option<Value>, String> {
    match action {
        CleanseAction::Trim => Ok(as_str(value).map(|s| Value::String(s.trim().to_string()))),
        CleanseAction::Uppercase => Ok(as_str(value).map(|s| Value::String(s.to_uppercase()))),
        CleanseAction::Lowercase => Ok(as_str(value).map(|s| Value::String(s.to_lowercase()))),
        CleanseAction::Truncate { max_len } => Ok(as_str(value).map(|s| {
            let mut cut = s.to_string();
            if cut.len() > *max_len {
                let mut end = *max_len;
                while !cut.is_char_boundary(end) {
                    end -= 1;
                }
                cut.truncate(end);
            }
            Value::String(cut)
        })),
        CleanseAction::Replace { pattern, replacement } => {
            let Some(s) = as_str(value) else { return Ok(None) };
            let re = regex::Regex::new(pattern).map_err(|e| format!("invalid pattern: {e}"))?;
            Ok(Some(Value::String(re.replace_all(s, replacement.as_str()).into_owned())))
        }
        CleanseAction::DefaultIfNull { value: default } => {
            if value.is_null() {
                Ok(Some(default.clone()))
            } else {
                Ok(None)
            }
        }
        CleanseAction::Lookup { table } => {
            let Some(s) = as_str(value) else {
                return Err(format!("lookup expects a string value, got {value}"));
            };
            match table.get(s) {
                Some(mapped) => Ok(Some(mapped.clone())),
                None => Err(format!("no lookup mapping for '{s}'")),
            }
        }
    }
}

fn as_str(value: &Value) -> Option<&str> {
    value.as_str()
}
