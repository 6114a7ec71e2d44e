//! Query filters over indexed fields

use crate::record::IndexValue;
use std::collections::HashMap;

/// Comparison operator for a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

/// A single predicate against an indexed field
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Shorthand for the common equality filter
    pub fn eq(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// Evaluate this filter against a record's indexed fields
    ///
    /// A missing field never matches. Mixed-variant comparisons never match
    /// (other than Ne, which treats a type mismatch as "not equal").
    pub fn matches(&self, fields: &HashMap<String, IndexValue>) -> bool {
        let Some(actual) = fields.get(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Ne => actual != &self.value,
            FilterOp::Gt => matches!(
                actual.partial_cmp(&self.value),
                Some(std::cmp::Ordering::Greater)
            ),
            FilterOp::Gte => matches!(
                actual.partial_cmp(&self.value),
                Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
            ),
            FilterOp::Lt => matches!(actual.partial_cmp(&self.value), Some(std::cmp::Ordering::Less)),
            FilterOp::Lte => matches!(
                actual.partial_cmp(&self.value),
                Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
            ),
            FilterOp::Contains => match (actual, &self.value) {
                (IndexValue::String(haystack), IndexValue::String(needle)) => haystack.contains(needle),
                _ => false,
            },
        }
    }
}

/// Evaluate a conjunction of filters
pub(crate) fn matches_all(filters: &[Filter], fields: &HashMap<String, IndexValue>) -> bool {
    filters.iter().all(|f| f.matches(fields))
}
