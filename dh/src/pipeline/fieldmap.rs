//! Field-map stage
//!
//! Renames and projects rows per the interface's mapping rules, and for
//! thematic sync merges rows from several interfaces into one output
//! record keyed by the task's merge keys.

use std::collections::HashMap;

use serde_json::Value;

use super::batch::{RecordBatch, Row, value_to_string};
use crate::domain::{ConflictPolicy, FieldMapping, MergeConfig};
use crate::error::SyncError;

/// Apply rename/project mappings; an empty mapping set is the identity
pub fn project(batch: &RecordBatch, mappings: &[FieldMapping]) -> RecordBatch {
    if mappings.is_empty() {
        return batch.clone();
    }
    let rows = batch
        .rows
        .iter()
        .map(|row| {
            let mut out = Row::new();
            for mapping in mappings {
                let value = row.get(&mapping.source_field).cloned().unwrap_or(Value::Null);
                out.insert(mapping.target_field.clone(), value);
            }
            out
        })
        .collect();
    batch.with_rows(rows)
}

/// Merge rows from multiple interfaces into one batch keyed by the merge
/// key tuple
///
/// Input batches are visited in the given order; `prefer_latest` lets a
/// later value win, `prefer_source_rank` resolves by the declared
/// interface precedence, `error` rejects the merge on the first
/// conflicting non-key value.
pub fn merge(
    target_interface_id: &str,
    inputs: &[(String, RecordBatch)],
    config: &MergeConfig,
) -> Result<RecordBatch, SyncError> {
    let rank = |interface_id: &str| -> usize {
        config
            .source_rank
            .iter()
            .position(|id| id == interface_id)
            .unwrap_or(usize::MAX)
    };

    let mut merged: HashMap<String, Row> = HashMap::new();
    let mut origin: HashMap<(String, String), String> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for (interface_id, batch) in inputs {
        for row in &batch.rows {
            let Some(key) = merge_key(row, &config.keys) else {
                return Err(SyncError::Schema(format!(
                    "row on {interface_id} is missing merge key fields {:?}",
                    config.keys
                )));
            };
            let entry = merged.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                Row::new()
            });
            for (field, value) in row {
                let slot = (key.clone(), field.clone());
                match entry.get(field) {
                    None => {
                        entry.insert(field.clone(), value.clone());
                        origin.insert(slot, interface_id.clone());
                    }
                    Some(existing) if existing == value => {}
                    Some(existing) => match config.conflict_policy {
                        ConflictPolicy::PreferLatest => {
                            entry.insert(field.clone(), value.clone());
                            origin.insert(slot, interface_id.clone());
                        }
                        ConflictPolicy::PreferSourceRank => {
                            let holder = origin.get(&slot).map(String::as_str).unwrap_or("");
                            if rank(interface_id) < rank(holder) {
                                entry.insert(field.clone(), value.clone());
                                origin.insert(slot, interface_id.clone());
                            }
                        }
                        ConflictPolicy::Error => {
                            return Err(SyncError::ValidationLogic(format!(
                                "merge conflict on key {key} field {field}: {existing} vs {value}"
                            )));
                        }
                    },
                }
            }
        }
    }

    let rows = order.into_iter().filter_map(|key| merged.remove(&key)).collect();
    Ok(RecordBatch::new(target_interface_id, rows))
}

fn merge_key(row: &Row, keys: &[String]) -> Option<String> {
    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        let value = row.get(key)?;
        if value.is_null() {
            return None;
        }
        parts.push(value_to_string(value));
    }
    Some(parts.join("/"))
}
