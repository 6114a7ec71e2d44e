//! Declarative pipeline rules
//!
//! Cleansing, validation, and masking rules are data: tagged enums parsed
//! and validated at interface create/update. The pipeline stages interpret
//! them; nothing here executes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::id::new_id;
use super::interface::Field;
use crate::error::SyncError;

/// What a cleansing rule does to its target fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum CleanseAction {
    Trim,
    Uppercase,
    Lowercase,
    /// Regex find/replace on string values
    Replace { pattern: String, replacement: String },
    /// Substitute a default when the value is null or missing
    DefaultIfNull { value: Value },
    /// Map values through a lookup table; a miss fails the rule
    Lookup { table: HashMap<String, Value> },
    /// Clip string values to a maximum length
    Truncate { max_len: usize },
}

/// One step in an interface's cleansing chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleansingRule {
    pub id: String,
    pub name: String,
    pub action: CleanseAction,
    /// Field names the action applies to
    pub target_fields: Vec<String>,
    /// Chain position; lower runs first
    #[serde(default)]
    pub order_num: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Keep a copy of the pre-cleanse value alongside the row
    #[serde(default)]
    pub backup_original: bool,
    /// Abort the whole batch when this rule fails (default: fail open)
    #[serde(default)]
    pub stop_on_failure: bool,
}

fn default_true() -> bool {
    true
}

impl CleansingRule {
    pub fn new(name: impl Into<String>, action: CleanseAction, target_fields: Vec<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            action,
            target_fields,
            order_num: 0,
            enabled: true,
            backup_original: false,
            stop_on_failure: false,
        }
    }

    pub fn with_order(mut self, order_num: u32) -> Self {
        self.order_num = order_num;
        self
    }

    pub fn with_stop_on_failure(mut self) -> Self {
        self.stop_on_failure = true;
        self
    }

    pub fn with_backup(mut self) -> Self {
        self.backup_original = true;
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.target_fields.is_empty() {
            return Err(SyncError::Config(format!("cleansing rule {} has no target fields", self.name)));
        }
        if let CleanseAction::Replace { pattern, .. } = &self.action {
            regex::Regex::new(pattern)
                .map_err(|e| SyncError::Config(format!("cleansing rule {}: bad pattern: {e}", self.name)))?;
        }
        Ok(())
    }
}

/// Well-known formats a value can be checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    Email,
    Url,
    Uuid,
    Ipv4,
    Date,
}

/// The predicate a validation rule applies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case", deny_unknown_fields)]
pub enum ValidationCheck {
    NotNull,
    Format { format: FormatKind },
    Regex { pattern: String },
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    OneOf { allowed: Vec<Value> },
    /// Membership in an externally sourced reference snapshot
    Reference { values: Vec<Value> },
}

/// How hard a validation failure hits the row
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationSeverity {
    Low,
    Medium,
    High,
    /// Rejects the row outright
    Critical,
}

impl std::fmt::Display for ValidationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationSeverity::Low => write!(f, "low"),
            ValidationSeverity::Medium => write!(f, "medium"),
            ValidationSeverity::High => write!(f, "high"),
            ValidationSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// A single validation predicate over one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub id: String,
    pub name: String,
    pub field: String,
    pub check: ValidationCheck,
    pub severity: ValidationSeverity,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ValidationRule {
    pub fn new(
        name: impl Into<String>,
        field: impl Into<String>,
        check: ValidationCheck,
        severity: ValidationSeverity,
    ) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            field: field.into(),
            check,
            severity,
            enabled: true,
        }
    }

    /// Check the rule against the declared interface fields
    pub fn validate(&self, fields: &[Field]) -> Result<(), SyncError> {
        if !fields.iter().any(|f| f.name == self.field) {
            return Err(SyncError::Config(format!(
                "validation rule {} targets undeclared field {}",
                self.name, self.field
            )));
        }
        match &self.check {
            ValidationCheck::Regex { pattern } => {
                regex::Regex::new(pattern)
                    .map_err(|e| SyncError::Config(format!("validation rule {}: bad pattern: {e}", self.name)))?;
            }
            ValidationCheck::Range { min, max } => {
                if min.is_none() && max.is_none() {
                    return Err(SyncError::Config(format!(
                        "validation rule {} declares an empty range",
                        self.name
                    )));
                }
                if let (Some(lo), Some(hi)) = (min, max) {
                    if lo > hi {
                        return Err(SyncError::Config(format!(
                            "validation rule {}: min {lo} exceeds max {hi}",
                            self.name
                        )));
                    }
                }
            }
            ValidationCheck::OneOf { allowed } | ValidationCheck::Reference { values: allowed } => {
                if allowed.is_empty() {
                    return Err(SyncError::Config(format!(
                        "validation rule {} declares an empty value set",
                        self.name
                    )));
                }
            }
            ValidationCheck::NotNull | ValidationCheck::Format { .. } => {}
        }
        Ok(())
    }
}

/// What a masking rule does to its field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum MaskAction {
    /// Keep a prefix/suffix, overwrite the middle
    Mask {
        #[serde(default)]
        keep_prefix: usize,
        #[serde(default)]
        keep_suffix: usize,
        #[serde(default = "default_mask_char")]
        mask_char: char,
    },
    /// Replace with a fixed value of the same declared type
    Replace { value: Value },
    /// One-way digest of the value (hex)
    Encrypt,
    /// Deterministic stand-in derived from the value and the task salt
    Pseudonymize,
}

fn default_mask_char() -> char {
    '*'
}

/// A masking template binding on one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskingRule {
    pub id: String,
    pub field: String,
    pub action: MaskAction,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl MaskingRule {
    pub fn new(field: impl Into<String>, action: MaskAction) -> Self {
        Self {
            id: new_id(),
            field: field.into(),
            action,
            enabled: true,
        }
    }
}

/// Rename/project one source field into a target field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_field: String,
    pub target_field: String,
}

/// How thematic merges resolve two values for the same key tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    PreferLatest,
    PreferSourceRank,
    Error,
}
