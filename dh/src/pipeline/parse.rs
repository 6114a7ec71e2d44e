//! Parse stage
//!
//! Turns decoded payloads into rows per the interface's parse config:
//! record-path location, array unrolling, field-path extraction, default
//! substitution, and type coercion against the declared fields. A
//! coercion failure is a schema error and fails the whole batch.

use serde_json::{Map, Value};

use super::batch::Row;
use crate::domain::{Field, ParseConfig};
use crate::error::SyncError;

/// Resolve a dot path (`a.b.0.c`) inside a value
pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Parse stage over one interface's config and fields
pub struct Parser<'a> {
    config: &'a ParseConfig,
    fields: &'a [Field],
}

impl<'a> Parser<'a> {
    pub fn new(config: &'a ParseConfig, fields: &'a [Field]) -> Self {
        Self { config, fields }
    }

    /// Extract rows from one decoded payload
    pub fn parse(&self, payload: &Value) -> Result<Vec<Row>, SyncError> {
        let located = match &self.config.record_path {
            Some(path) => resolve_path(payload, path)
                .ok_or_else(|| SyncError::Schema(format!("record path '{path}' not found in payload")))?,
            None => payload,
        };

        let raw_records: Vec<&Value> = match located {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };

        let mut rows = Vec::with_capacity(raw_records.len());
        for record in raw_records {
            rows.push(self.parse_record(record)?);
        }
        Ok(rows)
    }

    fn parse_record(&self, record: &Value) -> Result<Row, SyncError> {
        let mut row: Row = if self.config.field_paths.is_empty() {
            match record {
                Value::Object(map) => map.clone(),
                other => {
                    return Err(SyncError::Schema(format!(
                        "record is not an object and no field paths are declared: {other}"
                    )));
                }
            }
        } else {
            let mut row = Map::new();
            for (target, path) in &self.config.field_paths {
                let value = resolve_path(record, path).cloned().unwrap_or(Value::Null);
                row.insert(target.clone(), value);
            }
            row
        };

        for field in self.fields {
            let missing = !row.contains_key(&field.name) || row[&field.name].is_null();
            if missing {
                if let Some(default) = &field.default {
                    row.insert(field.name.clone(), default.clone());
                }
            }
        }

        if self.config.coerce_types {
            for field in self.fields {
                if let Some(value) = row.get(&field.name) {
                    let coerced = field
                        .data_type
                        .coerce(value)
                        .map_err(|e| SyncError::Schema(format!("field {}: {e}", field.name)))?;
                    row.insert(field.name.clone(), coerced);
                }
            }
        }

        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DataType;
    use serde_json::json;
    use std::collections::HashMap;

    fn fields() -> Vec<Field> {
        vec![
            Field::new("id", DataType::Integer),
            Field::new("name", DataType::String),
            Field::new("amount", DataType::Float),
        ]
    }

    #[test]
    fn test_resolve_path_nested() {
        let v = json!({"a": {"b": [{"c": 42}]}});
        assert_eq!(resolve_path(&v, "a.b.0.c"), Some(&json!(42)));
        assert_eq!(resolve_path(&v, "a.x"), None);
    }

    #[test]
    fn test_parse_array_unrolls() {
        let config = ParseConfig::default();
        let fields = fields();
        let parser = Parser::new(&config, &fields);
        let rows = parser
            .parse(&json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["id"], json!(2));
    }

    #[test]
    fn test_parse_record_path() {
        let config = ParseConfig {
            record_path: Some("data.items".to_string()),
            ..ParseConfig::default()
        };
        let fields = fields();
        let parser = Parser::new(&config, &fields);
        let rows = parser
            .parse(&json!({"data": {"items": [{"id": 1}]}, "meta": {}}))
            .unwrap();
        assert_eq!(rows.len(), 1);

        assert!(parser.parse(&json!({"data": {}})).is_err());
    }

    #[test]
    fn test_parse_field_paths() {
        let mut field_paths = HashMap::new();
        field_paths.insert("id".to_string(), "key.id".to_string());
        field_paths.insert("name".to_string(), "attrs.label".to_string());
        let config = ParseConfig {
            field_paths,
            ..ParseConfig::default()
        };
        let fields = fields();
        let parser = Parser::new(&config, &fields);
        let rows = parser
            .parse(&json!({"key": {"id": "7"}, "attrs": {"label": "x"}}))
            .unwrap();
        // "7" coerces to the declared integer type
        assert_eq!(rows[0]["id"], json!(7));
        assert_eq!(rows[0]["name"], json!("x"));
    }

    #[test]
    fn test_parse_applies_defaults() {
        let config = ParseConfig::default();
        let mut fs = fields();
        fs[2].default = Some(json!(0.0));
        let parser = Parser::new(&config, &fs);
        let rows = parser.parse(&json!({"id": 1, "name": "a"})).unwrap();
        assert_eq!(rows[0]["amount"], json!(0.0));
    }

    #[test]
    fn test_parse_coercion_failure_is_schema_error() {
        let config = ParseConfig::default();
        let fields = fields();
        let parser = Parser::new(&config, &fields);
        let err = parser.parse(&json!({"id": "not-a-number"})).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);
    }

    #[test]
    fn test_parse_scalar_without_paths_rejected() {
        let config = ParseConfig::default();
        let fields = fields();
        let parser = Parser::new(&config, &fields);
        assert!(parser.parse(&json!("just a string")).is_err());
    }
}
