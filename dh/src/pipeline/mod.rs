//! The sync pipeline
//!
//! An ordered, restartable sequence over immutable record batches:
//! parse → field-map → cleanse → validate → mask → quality gate. The
//! write stage lives with the executor, which owns the repositories and
//! the commit/watermark atomicity.

mod batch;
mod cleanse;
mod fieldmap;
mod gate;
mod mask;
mod parse;
mod validate;

pub use batch::{RecordBatch, Row, RowIssue, value_to_string};
pub use cleanse::{CleanseOutcome, apply_chain};
pub use fieldmap::{merge, project};
pub use gate::{GateDecision, decide};
pub use mask::apply_rules as apply_mask_rules;
pub use parse::{Parser, resolve_path};
pub use validate::{ValidateOutcome, apply_rules as apply_validation_rules};
/// Evaluate one validation check against one value (shared with the
/// quality engine's validity dimension)
pub use validate::passes as validate_value;

use serde_json::Value;

use crate::domain::{DimensionResult, GatePolicy, Interface, IssueSeverity, QualityRule};
use crate::error::SyncError;
use crate::quality::QualityEngine;

/// A stage failure that still carries the issues found before the abort
#[derive(Debug)]
pub struct StageFailure {
    pub error: SyncError,
    pub issues: Vec<RowIssue>,
}

impl StageFailure {
    fn new(error: SyncError) -> Self {
        Self {
            error,
            issues: Vec::new(),
        }
    }
}

impl From<SyncError> for StageFailure {
    fn from(error: SyncError) -> Self {
        Self::new(error)
    }
}

/// Everything the executor needs to commit one processed batch
#[derive(Debug)]
pub struct ProcessedBatch {
    /// Rows that survived all stages (empty when gated out)
    pub batch: RecordBatch,
    pub issues: Vec<RowIssue>,
    pub quality: Vec<DimensionResult>,
    pub quality_score: f64,
    pub gate: GateDecision,
    /// Rows rejected by critical validation
    pub rejected: u64,
    /// Rows withheld by the gate (dropped or quarantined)
    pub skipped: u64,
    /// Uniqueness tracking degraded to per-batch scope
    pub approximated: bool,
}

/// Per-interface pipeline instance for one execution
///
/// Holds the interface's rule set and the quality engine state (duplicate
/// trackers survive across batches within the execution).
pub struct Pipeline {
    interface: Interface,
    quality_rules: Vec<QualityRule>,
    engine: QualityEngine,
    salt: String,
    quality_threshold: f64,
    gate_policy: GatePolicy,
    pk_cols: Vec<String>,
}

impl Pipeline {
    pub fn new(
        interface: Interface,
        quality_rules: Vec<QualityRule>,
        salt: impl Into<String>,
        quality_threshold: f64,
        gate_policy: GatePolicy,
    ) -> Self {
        let pk_cols = interface.primary_key_columns();
        Self {
            interface,
            quality_rules,
            engine: QualityEngine::default(),
            salt: salt.into(),
            quality_threshold,
            gate_policy,
            pk_cols,
        }
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    pub fn pk_cols(&self) -> &[String] {
        &self.pk_cols
    }

    /// Names of the transform stages applied, for lineage records
    pub fn transform_names(&self) -> Vec<String> {
        let mut names = vec!["parse".to_string()];
        if !self.interface.field_mappings.is_empty() {
            names.push("field_map".to_string());
        }
        names.extend(self.interface.cleansing_chain().iter().map(|r| r.name.clone()));
        if self.interface.validation_rules.iter().any(|r| r.enabled) {
            names.push("validate".to_string());
        }
        if self.interface.masking_rules.iter().any(|r| r.enabled) {
            names.push("mask".to_string());
        }
        names
    }

    /// Parse raw decoded payloads into a batch, then run the stages
    pub fn process_payloads(&mut self, payloads: &[Value]) -> Result<ProcessedBatch, StageFailure> {
        let parser = Parser::new(&self.interface.parse, &self.interface.fields);
        let mut rows = Vec::new();
        for payload in payloads {
            let batch_rows = parser.parse(payload).map_err(|e| {
                StageFailure::new(e.in_stage("parse", "unparsed"))
            })?;
            rows.extend(batch_rows);
        }
        let batch = RecordBatch::new(&self.interface.id, rows);
        self.process_batch(batch)
    }

    /// Run stages 2-6 over an already-parsed batch
    pub fn process_batch(&mut self, batch: RecordBatch) -> Result<ProcessedBatch, StageFailure> {
        let batch_id = batch.id.clone();
        let mut issues = Vec::new();

        // Field-map
        let mapped = project(&batch, &self.interface.field_mappings);

        // Cleanse
        let chain = self.interface.cleansing_chain();
        let cleansed = apply_chain(&mapped, &chain, &self.pk_cols);
        issues.extend(cleansed.issues);
        if cleansed.aborted {
            let failed_rule = issues.last().map(|i| i.rule_name.clone()).unwrap_or_default();
            return Err(StageFailure {
                error: SyncError::ValidationLogic(format!("cleansing rule {failed_rule} aborted the batch"))
                    .in_stage("cleanse", batch_id),
                issues,
            });
        }

        // Validate
        let validated = apply_validation_rules(&cleansed.batch, &self.interface.validation_rules, &self.pk_cols);
        issues.extend(validated.issues);
        let rejected = validated.rejected;

        // Mask
        let masked = apply_mask_rules(
            &validated.batch,
            &self.interface.masking_rules,
            &self.interface.fields,
            &self.salt,
        )
        .map_err(|e| StageFailure {
            error: e.in_stage("mask", batch_id.clone()),
            issues: issues.clone(),
        })?;

        // Quality gate
        let evaluation = self.engine.evaluate(&masked, &self.quality_rules, &self.pk_cols);
        let gate = decide(&evaluation, self.quality_threshold, self.gate_policy);
        issues.extend(evaluation.issues);

        let mut skipped = 0u64;
        let out_batch = if gate.writes() {
            masked
        } else {
            skipped = masked.len() as u64;
            if gate == GateDecision::Quarantine {
                for row in &masked.rows {
                    let row_id = RecordBatch::row_identity(row, &self.pk_cols);
                    issues.push(RowIssue::new(
                        row_id,
                        "quality-gate",
                        "quality_gate",
                        IssueSeverity::Low,
                        format!("row quarantined: batch quality {:.3} below threshold", evaluation.overall_score),
                    ));
                }
            }
            masked.with_rows(Vec::new())
        };

        Ok(ProcessedBatch {
            batch: out_batch,
            issues,
            quality: evaluation.results,
            quality_score: evaluation.overall_score,
            gate,
            rejected,
            skipped,
            approximated: evaluation.approximated,
        })
    }
}
