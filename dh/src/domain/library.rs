//! Library domain type
//!
//! A library is a downstream store: `basic` lands records near-verbatim
//! from one or more sources, `thematic` aggregates across interfaces.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use syncstore::{IndexValue, Record, now_ms};

use super::id::new_id;

/// Which downstream store a library is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryKind {
    Basic,
    Thematic,
}

impl std::fmt::Display for LibraryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryKind::Basic => write!(f, "basic"),
            LibraryKind::Thematic => write!(f, "thematic"),
        }
    }
}

/// Library lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LibraryStatus {
    #[default]
    Draft,
    Active,
    Inactive,
    Archived,
}

impl std::fmt::Display for LibraryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryStatus::Draft => write!(f, "draft"),
            LibraryStatus::Active => write!(f, "active"),
            LibraryStatus::Inactive => write!(f, "inactive"),
            LibraryStatus::Archived => write!(f, "archived"),
        }
    }
}

/// A basic or thematic library definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Library {
    /// Unique identifier
    pub id: String,

    /// Basic (landing) or thematic (aggregated)
    pub kind: LibraryKind,

    /// English name, globally unique within the kind
    pub name: String,

    /// Human-readable display name
    pub display_name: String,

    pub status: LibraryStatus,

    /// Owning user id
    pub owner: String,

    /// Thematic only: category label
    #[serde(default)]
    pub category: Option<String>,

    /// Thematic only: business domain
    #[serde(default)]
    pub domain: Option<String>,

    /// Thematic only: whether published for consumers
    #[serde(default)]
    pub published: bool,

    /// Thematic only: access level label
    #[serde(default)]
    pub access_level: Option<String>,

    /// Thematic only: retention in days (None = keep forever)
    #[serde(default)]
    pub retention_days: Option<u32>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Library {
    pub fn new(kind: LibraryKind, name: impl Into<String>, owner: impl Into<String>) -> Self {
        let now = now_ms();
        let name = name.into();
        Self {
            id: new_id(),
            kind,
            display_name: name.clone(),
            name,
            status: LibraryStatus::Draft,
            owner: owner.into(),
            category: None,
            domain: None,
            published: false,
            access_level: None,
            retention_days: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: LibraryStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    /// Whether sync tasks against this library may run
    pub fn is_syncable(&self) -> bool {
        self.status == LibraryStatus::Active
    }
}

impl Record for Library {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "libraries"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("kind".to_string(), IndexValue::String(self.kind.to_string()));
        fields.insert("name".to_string(), IndexValue::String(self.name.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("owner".to_string(), IndexValue::String(self.owner.clone()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_library_defaults() {
        let lib = Library::new(LibraryKind::Basic, "ingest_raw", "u-1");
        assert_eq!(lib.status, LibraryStatus::Draft);
        assert_eq!(lib.id.len(), 36);
        assert!(!lib.is_syncable());
    }

    #[test]
    fn test_activation_enables_sync() {
        let mut lib = Library::new(LibraryKind::Thematic, "customer_360", "u-1");
        lib.set_status(LibraryStatus::Active);
        assert!(lib.is_syncable());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let lib = Library::new(LibraryKind::Basic, "x", "u");
        let json = serde_json::to_string(&lib).unwrap();
        assert!(json.contains("\"kind\":\"basic\""));
        assert!(json.contains("\"status\":\"draft\""));
    }

    #[test]
    fn test_indexed_fields() {
        let lib = Library::new(LibraryKind::Basic, "ingest_raw", "u-1");
        let fields = lib.indexed_fields();
        assert_eq!(fields.get("kind"), Some(&IndexValue::String("basic".to_string())));
        assert_eq!(
            fields.get("name"),
            Some(&IndexValue::String("ingest_raw".to_string()))
        );
    }
}
