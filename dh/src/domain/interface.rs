//! Interface domain type
//!
//! An interface is a typed ingress/egress channel declared under a
//! library: transport, parse settings, target fields, and the declarative
//! cleanse/validate/mask rules the pipeline applies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use syncstore::{IndexValue, Record, now_ms};

use super::id::new_id;
use super::rules::{CleansingRule, FieldMapping, MaskingRule, ValidationRule};
use crate::error::SyncError;

/// How records arrive on this interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    Realtime,
    Batch,
    Http,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Realtime => write!(f, "realtime"),
            TransportType::Batch => write!(f, "batch"),
            TransportType::Http => write!(f, "http"),
        }
    }
}

/// Declared data type of a target field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Json,
}

impl DataType {
    /// Coerce a JSON value into this type
    ///
    /// Lossless where possible (numeric strings parse, integers widen to
    /// float); anything else is a schema error. Null passes through for
    /// the caller's nullability check.
    pub fn coerce(&self, value: &Value) -> Result<Value, SyncError> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let coerced = match self {
            DataType::String => match value {
                Value::String(_) => Some(value.clone()),
                Value::Number(n) => Some(Value::String(n.to_string())),
                Value::Bool(b) => Some(Value::String(b.to_string())),
                _ => None,
            },
            DataType::Integer => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Some(value.clone()),
                Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
                _ => None,
            },
            DataType::Float => match value {
                Value::Number(n) => n.as_f64().and_then(|f| serde_json::Number::from_f64(f)).map(Value::Number),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number),
                _ => None,
            },
            DataType::Boolean => match value {
                Value::Bool(_) => Some(value.clone()),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => Some(Value::Bool(true)),
                    "false" | "0" | "no" => Some(Value::Bool(false)),
                    _ => None,
                },
                _ => None,
            },
            DataType::Timestamp => match value {
                // Stored canonically as RFC 3339 strings
                Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|_| value.clone()),
                Value::Number(n) => n
                    .as_i64()
                    .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms))
                    .map(|dt| Value::String(dt.to_rfc3339())),
                _ => None,
            },
            DataType::Json => Some(value.clone()),
        };
        coerced.ok_or_else(|| SyncError::Schema(format!("cannot coerce {value} to {self:?}")))
    }
}

/// A declared target field on an interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// English column name
    pub name: String,
    /// Human-readable display name
    #[serde(default)]
    pub display_name: Option<String>,
    pub data_type: DataType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub primary_key: bool,
    /// Default applied when the source omits the field
    #[serde(default)]
    pub default: Option<Value>,
    /// Optional SQL check constraint fragment for the sink DDL
    #[serde(default)]
    pub check: Option<String>,
    /// Column ordering in the sink table
    #[serde(default)]
    pub order_num: u32,
    /// Drives incremental sync watermarking
    #[serde(default)]
    pub is_increment_field: bool,
}

fn default_true() -> bool {
    true
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            data_type,
            nullable: true,
            unique: false,
            primary_key: false,
            default: None,
            check: None,
            order_num: 0,
            is_increment_field: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn increment(mut self) -> Self {
        self.is_increment_field = true;
        self
    }
}

/// How raw payloads become rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParseConfig {
    /// Dot path to the record array inside the payload (None = the payload
    /// itself is the record, or an array of records to unroll)
    #[serde(default)]
    pub record_path: Option<String>,
    /// Target field name → dot path in the raw record; empty = take the
    /// raw record's keys as-is
    #[serde(default)]
    pub field_paths: HashMap<String, String>,
    /// Coerce extracted values to the declared field types
    #[serde(default = "default_true")]
    pub coerce_types: bool,
}

/// A typed ingress/egress channel under a library
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub id: String,

    /// Owning library
    pub library_id: String,

    pub name: String,

    #[serde(default)]
    pub display_name: Option<String>,

    pub transport: TransportType,

    #[serde(default)]
    pub parse: ParseConfig,

    pub fields: Vec<Field>,

    /// Ordered cleansing chain (run in `order_num` order when enabled)
    #[serde(default)]
    pub cleansing_rules: Vec<CleansingRule>,

    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,

    #[serde(default)]
    pub masking_rules: Vec<MaskingRule>,

    /// Thematic only: rename/project mappings applied before the merge
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,

    /// Basic only: the data source feeding this interface
    #[serde(default)]
    pub source_id: Option<String>,

    /// Sink table is materialized lazily on first write
    #[serde(default)]
    pub is_table_created: bool,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Interface {
    pub fn new(library_id: impl Into<String>, name: impl Into<String>, transport: TransportType) -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            library_id: library_id.into(),
            name: name.into(),
            display_name: None,
            transport,
            parse: ParseConfig::default(),
            fields: Vec::new(),
            cleansing_rules: Vec::new(),
            validation_rules: Vec::new(),
            masking_rules: Vec::new(),
            field_mappings: Vec::new(),
            source_id: None,
            is_table_created: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Primary key column names, in declaration order
    pub fn primary_key_columns(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.primary_key)
            .map(|f| f.name.clone())
            .collect()
    }

    /// The field driving incremental sync, if declared
    pub fn increment_field(&self) -> Option<&Field> {
        self.fields.iter().find(|f| f.is_increment_field)
    }

    /// Enabled cleansing rules in execution order
    pub fn cleansing_chain(&self) -> Vec<&CleansingRule> {
        let mut rules: Vec<&CleansingRule> = self.cleansing_rules.iter().filter(|r| r.enabled).collect();
        rules.sort_by_key(|r| r.order_num);
        rules
    }

    /// Structural validation at create/update
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.fields.is_empty() {
            return Err(SyncError::Config(format!("interface {} declares no fields", self.name)));
        }
        let mut seen = std::collections::HashSet::new();
        for f in &self.fields {
            if !seen.insert(&f.name) {
                return Err(SyncError::Config(format!("duplicate field {} on {}", f.name, self.name)));
            }
        }
        if self.fields.iter().filter(|f| f.is_increment_field).count() > 1 {
            return Err(SyncError::Config(format!(
                "interface {} declares more than one increment field",
                self.name
            )));
        }
        for rule in &self.validation_rules {
            rule.validate(&self.fields)?;
        }
        Ok(())
    }

    pub fn mark_table_created(&mut self) {
        self.is_table_created = true;
        self.updated_at = now_ms();
    }

    /// Rules the inline quality gate evaluates when the task binds none:
    /// completeness over non-nullable columns, uniqueness over the
    /// primary key tuple
    pub fn default_quality_rules(&self) -> Vec<super::quality::QualityRule> {
        use super::quality::{QualityRule, QualityRuleSpec};
        let mut rules = Vec::new();
        let required: Vec<String> = self
            .fields
            .iter()
            .filter(|f| !f.nullable)
            .map(|f| f.name.clone())
            .collect();
        if !required.is_empty() {
            rules.push(QualityRule::new(
                "required_fields_present",
                QualityRuleSpec::Completeness { fields: required },
                0.95,
                1.0,
            ));
        }
        let pk = self.primary_key_columns();
        if !pk.is_empty() {
            rules.push(QualityRule::new(
                "primary_key_unique",
                QualityRuleSpec::Uniqueness { key_fields: pk },
                0.99,
                1.0,
            ));
        }
        rules
    }
}

impl Record for Interface {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "interfaces"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("library_id".to_string(), IndexValue::String(self.library_id.clone()));
        fields.insert("name".to_string(), IndexValue::String(self.name.clone()));
        fields.insert(
            "transport".to_string(),
            IndexValue::String(self.transport.to_string()),
        );
        fields
    }
}
