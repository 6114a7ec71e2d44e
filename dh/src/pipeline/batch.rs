//! Record batches flowing through the pipeline
//!
//! A batch is an immutable set of row maps plus a batch id. Stages take a
//! batch and produce a new one; they never mutate earlier batches.

use serde_json::{Map, Value};

use crate::domain::{IssueSeverity, QualityDimension, compare_values, fingerprint, new_id};

/// One record: field name → value
pub type Row = Map<String, Value>;

/// An immutable set of rows with an identity
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub id: String,
    pub interface_id: String,
    pub rows: Vec<Row>,
}

impl RecordBatch {
    pub fn new(interface_id: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            id: new_id(),
            interface_id: interface_id.into(),
            rows,
        }
    }

    /// Same identity, different rows (stage output)
    pub fn with_rows(&self, rows: Vec<Row>) -> Self {
        Self {
            id: self.id.clone(),
            interface_id: self.interface_id.clone(),
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Identity of a row: primary-key tuple when available, content
    /// fingerprint otherwise
    pub fn row_identity(row: &Row, pk_cols: &[String]) -> String {
        if !pk_cols.is_empty() && pk_cols.iter().all(|c| row.contains_key(c)) {
            pk_cols
                .iter()
                .map(|c| value_to_string(&row[c]))
                .collect::<Vec<_>>()
                .join("/")
        } else {
            fingerprint(&Value::Object(row.clone()))
        }
    }

    /// Largest value of the increment field across the batch
    pub fn max_increment_value(&self, field: &str) -> Option<String> {
        self.rows
            .iter()
            .filter_map(|row| row.get(field))
            .filter(|v| !v.is_null())
            .map(value_to_string)
            .max_by(|a, b| compare_values(a, b))
    }
}

/// Scalar-friendly string form: strings unquoted, everything else JSON
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A problem a stage found with one row
///
/// Stages produce these; the executor stamps execution context onto them
/// and hands them to the issue repository. A rejected row's identity and
/// reason are always preserved here.
#[derive(Debug, Clone)]
pub struct RowIssue {
    pub row_id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub field: Option<String>,
    pub actual: Option<Value>,
    pub expected: Option<String>,
    pub severity: IssueSeverity,
    pub dimension: Option<QualityDimension>,
    pub message: String,
}

impl RowIssue {
    pub fn new(
        row_id: impl Into<String>,
        rule_id: impl Into<String>,
        rule_name: impl Into<String>,
        severity: IssueSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            row_id: row_id.into(),
            rule_id: rule_id.into(),
            rule_name: rule_name.into(),
            field: None,
            actual: None,
            expected: None,
            severity,
            dimension: None,
            message: message.into(),
        }
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_row_identity_by_pk() {
        let r = row(&[("id", json!(7)), ("region", json!("eu")), ("x", json!(1))]);
        let identity = RecordBatch::row_identity(&r, &["id".to_string(), "region".to_string()]);
        assert_eq!(identity, "7/eu");
    }

    #[test]
    fn test_row_identity_fingerprint_fallback() {
        let r = row(&[("x", json!(1))]);
        let identity = RecordBatch::row_identity(&r, &["id".to_string()]);
        assert_eq!(identity.len(), 64);
    }

    #[test]
    fn test_max_increment_numeric() {
        let batch = RecordBatch::new(
            "if-1",
            vec![
                row(&[("seq", json!(9))]),
                row(&[("seq", json!(10))]),
                row(&[("seq", json!(2))]),
            ],
        );
        // Numeric comparison: 10 > 9, not lexical
        assert_eq!(batch.max_increment_value("seq").as_deref(), Some("10"));
    }

    #[test]
    fn test_max_increment_timestamps() {
        let batch = RecordBatch::new(
            "if-1",
            vec![
                row(&[("updated_at", json!("2025-06-02T00:00:00Z"))]),
                row(&[("updated_at", json!("2025-06-01T00:00:00Z"))]),
            ],
        );
        assert_eq!(
            batch.max_increment_value("updated_at").as_deref(),
            Some("2025-06-02T00:00:00Z")
        );
    }

    #[test]
    fn test_max_increment_ignores_nulls_and_missing() {
        let batch = RecordBatch::new("if-1", vec![row(&[("seq", Value::Null)]), row(&[("other", json!(1))])]);
        assert_eq!(batch.max_increment_value("seq"), None);
    }

    #[test]
    fn test_with_rows_keeps_identity() {
        let batch = RecordBatch::new("if-1", vec![]);
        let out = batch.with_rows(vec![row(&[("a", json!(1))])]);
        assert_eq!(out.id, batch.id);
        assert_eq!(out.len(), 1);
    }
}
