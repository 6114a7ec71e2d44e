//! Data lineage records
//!
//! One record per upsert linking a target (thematic) record back to the
//! source record and the transforms that produced it. Written once, read
//! by reports, never mutated.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use syncstore::{IndexValue, Record, now_ms};

use super::id::new_id;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageRecord {
    pub id: String,
    pub source_library_id: String,
    pub source_interface_id: String,
    /// Fingerprint or primary-key identity of the source record
    pub source_record_id: String,
    pub target_interface_id: String,
    pub target_record_id: String,
    /// Names of the transforms applied, in order
    #[serde(default)]
    pub transforms: Vec<String>,
    #[serde(default)]
    pub quality_score: Option<f64>,
    pub execution_id: String,
    pub created_at: i64,
}

impl LineageRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_library_id: impl Into<String>,
        source_interface_id: impl Into<String>,
        source_record_id: impl Into<String>,
        target_interface_id: impl Into<String>,
        target_record_id: impl Into<String>,
        execution_id: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            source_library_id: source_library_id.into(),
            source_interface_id: source_interface_id.into(),
            source_record_id: source_record_id.into(),
            target_interface_id: target_interface_id.into(),
            target_record_id: target_record_id.into(),
            transforms: Vec::new(),
            quality_score: None,
            execution_id: execution_id.into(),
            created_at: now_ms(),
        }
    }

    pub fn with_transforms(mut self, transforms: Vec<String>) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }
}

impl Record for LineageRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.created_at
    }

    fn collection_name() -> &'static str {
        "lineage"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert(
            "target_interface_id".to_string(),
            IndexValue::String(self.target_interface_id.clone()),
        );
        fields.insert(
            "target_record_id".to_string(),
            IndexValue::String(self.target_record_id.clone()),
        );
        fields.insert("execution_id".to_string(), IndexValue::String(self.execution_id.clone()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lineage_roundtrip() {
        let rec = LineageRecord::new("lib-1", "if-src", "row-1", "if-dst", "row-1", "e-1")
            .with_transforms(vec!["trim".to_string(), "mask".to_string()])
            .with_quality_score(0.97);
        let json = serde_json::to_string(&rec).unwrap();
        let back: LineageRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.transforms.len(), 2);
        assert_eq!(back.quality_score, Some(0.97));
    }
}
