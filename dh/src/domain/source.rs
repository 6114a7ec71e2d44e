//! Data source domain type
//!
//! A data source belongs to a basic library and declares how to reach an
//! external system. Connection settings are a tagged enum validated at
//! create/update time; the engine never passes opaque maps around.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use syncstore::{IndexValue, Record, now_ms};

use super::id::new_id;
use crate::error::SyncError;

/// Coarse source family, derived from the connection config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    Stream,
    Http,
    Db,
    File,
}

impl std::fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceCategory::Stream => write!(f, "stream"),
            SourceCategory::Http => write!(f, "http"),
            SourceCategory::Db => write!(f, "db"),
            SourceCategory::File => write!(f, "file"),
        }
    }
}

/// One QoS-tagged MQTT topic subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttTopic {
    pub topic: String,
    /// 0, 1, or 2
    #[serde(default)]
    pub qos: u8,
}

/// Token acquisition settings for authenticated HTTP sources
///
/// The token itself comes from an external auth client (script host);
/// the engine only consumes the resulting bearer token and its TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpAuthConfig {
    /// TTL the issued tokens carry, in seconds
    pub token_ttl_secs: u64,
    /// Fraction of the TTL at which to refresh proactively (min 0.1)
    #[serde(default = "default_refresh_window")]
    pub refresh_window: f64,
}

fn default_refresh_window() -> f64 {
    0.1
}

/// Typed connection settings, one variant per concrete source kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ConnectionConfig {
    HttpNoAuth {
        base_url: String,
        /// Query parameter carrying the page number (None = single page)
        #[serde(default)]
        page_param: Option<String>,
        #[serde(default)]
        page_size_param: Option<String>,
        /// Dot path to the row array within the response body
        #[serde(default)]
        data_path: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    HttpWithAuth {
        base_url: String,
        #[serde(default)]
        page_param: Option<String>,
        #[serde(default)]
        page_size_param: Option<String>,
        #[serde(default)]
        data_path: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        auth: HttpAuthConfig,
    },
    Database {
        /// Connection URL (postgres://, mysql://, sqlite://)
        url: String,
        table: String,
    },
    File {
        /// Directory scanned for input files
        dir: String,
        /// Filename suffix filter, e.g. ".jsonl"
        #[serde(default)]
        suffix: Option<String>,
        /// Read newest files first unless declared otherwise
        #[serde(default = "default_true")]
        newest_first: bool,
    },
    Kafka {
        brokers: String,
        group_id: String,
        topics: Vec<String>,
    },
    Mqtt {
        host: String,
        port: u16,
        client_id: String,
        topics: Vec<MqttTopic>,
    },
    RedisPubsub {
        url: String,
        #[serde(default)]
        channels: Vec<String>,
        #[serde(default)]
        patterns: Vec<String>,
    },
}

fn default_true() -> bool {
    true
}

impl ConnectionConfig {
    /// The source family this connection belongs to
    pub fn category(&self) -> SourceCategory {
        match self {
            ConnectionConfig::HttpNoAuth { .. } | ConnectionConfig::HttpWithAuth { .. } => SourceCategory::Http,
            ConnectionConfig::Database { .. } => SourceCategory::Db,
            ConnectionConfig::File { .. } => SourceCategory::File,
            ConnectionConfig::Kafka { .. } | ConnectionConfig::Mqtt { .. } | ConnectionConfig::RedisPubsub { .. } => {
                SourceCategory::Stream
            }
        }
    }

    /// Short kind tag matching the serialized form
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionConfig::HttpNoAuth { .. } => "http_no_auth",
            ConnectionConfig::HttpWithAuth { .. } => "http_with_auth",
            ConnectionConfig::Database { .. } => "database",
            ConnectionConfig::File { .. } => "file",
            ConnectionConfig::Kafka { .. } => "kafka",
            ConnectionConfig::Mqtt { .. } => "mqtt",
            ConnectionConfig::RedisPubsub { .. } => "redis_pubsub",
        }
    }

    /// Structural validation beyond what serde enforces
    pub fn validate(&self) -> Result<(), SyncError> {
        match self {
            ConnectionConfig::HttpNoAuth { base_url, .. } | ConnectionConfig::HttpWithAuth { base_url, .. } => {
                if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                    return Err(SyncError::Config(format!("invalid base_url: {base_url}")));
                }
                if let ConnectionConfig::HttpWithAuth { auth, .. } = self {
                    if auth.token_ttl_secs == 0 {
                        return Err(SyncError::Config("token_ttl_secs must be > 0".into()));
                    }
                    if auth.refresh_window < 0.1 || auth.refresh_window >= 1.0 {
                        return Err(SyncError::Config(
                            "refresh_window must be in [0.1, 1.0)".into(),
                        ));
                    }
                }
                Ok(())
            }
            ConnectionConfig::Database { url, table } => {
                if url.is_empty() || table.is_empty() {
                    return Err(SyncError::Config("database url and table are required".into()));
                }
                Ok(())
            }
            ConnectionConfig::File { dir, .. } => {
                if dir.is_empty() {
                    return Err(SyncError::Config("file dir is required".into()));
                }
                Ok(())
            }
            ConnectionConfig::Kafka { brokers, topics, .. } => {
                if brokers.is_empty() || topics.is_empty() {
                    return Err(SyncError::Config("kafka brokers and topics are required".into()));
                }
                Ok(())
            }
            ConnectionConfig::Mqtt { topics, .. } => {
                if topics.is_empty() {
                    return Err(SyncError::Config("mqtt topics are required".into()));
                }
                if let Some(t) = topics.iter().find(|t| t.qos > 2) {
                    return Err(SyncError::Config(format!("invalid qos {} for topic {}", t.qos, t.topic)));
                }
                Ok(())
            }
            ConnectionConfig::RedisPubsub { channels, patterns, .. } => {
                if channels.is_empty() && patterns.is_empty() {
                    return Err(SyncError::Config(
                        "redis_pubsub needs at least one channel or pattern".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Per-source I/O tuning knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceParams {
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Cap on the reconnect backoff for streaming sources
    #[serde(default = "default_max_reconnect")]
    pub max_reconnect_interval_secs: u64,
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    30
}

fn default_max_reconnect() -> u64 {
    60
}

impl Default for SourceParams {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_reconnect_interval_secs: default_max_reconnect(),
        }
    }
}

/// An external system records are pulled or received from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,

    /// Owning basic library
    pub library_id: String,

    pub name: String,

    pub connection: ConnectionConfig,

    #[serde(default)]
    pub params: SourceParams,

    /// Opaque auth preflight script, executed by an external script host.
    /// The engine only consumes the token that host produces.
    #[serde(default)]
    pub preflight_script: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl DataSource {
    pub fn new(library_id: impl Into<String>, name: impl Into<String>, connection: ConnectionConfig) -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            library_id: library_id.into(),
            name: name.into(),
            connection,
            params: SourceParams::default(),
            preflight_script: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn category(&self) -> SourceCategory {
        self.connection.category()
    }
}

impl Record for DataSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "data_sources"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("library_id".to_string(), IndexValue::String(self.library_id.clone()));
        fields.insert(
            "category".to_string(),
            IndexValue::String(self.category().to_string()),
        );
        fields.insert("kind".to_string(), IndexValue::String(self.connection.kind().to_string()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kafka() -> ConnectionConfig {
        ConnectionConfig::Kafka {
            brokers: "localhost:9092".to_string(),
            group_id: "hub".to_string(),
            topics: vec!["events".to_string()],
        }
    }

    #[test]
    fn test_category_derivation() {
        assert_eq!(kafka().category(), SourceCategory::Stream);
        let http = ConnectionConfig::HttpNoAuth {
            base_url: "https://api.example.com/rows".to_string(),
            page_param: None,
            page_size_param: None,
            data_path: None,
            headers: HashMap::new(),
        };
        assert_eq!(http.category(), SourceCategory::Http);
    }

    #[test]
    fn test_tagged_serialization() {
        let json = serde_json::to_string(&kafka()).unwrap();
        assert!(json.contains("\"type\":\"kafka\""));
        let back: ConnectionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kafka());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let raw = r#"{"type":"kafka","brokers":"b","group_id":"g","topics":["t"],"bogus":1}"#;
        assert!(serde_json::from_str::<ConnectionConfig>(raw).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let http = ConnectionConfig::HttpNoAuth {
            base_url: "ftp://nope".to_string(),
            page_param: None,
            page_size_param: None,
            data_path: None,
            headers: HashMap::new(),
        };
        assert!(http.validate().is_err());
    }

    #[test]
    fn test_validate_qos_bounds() {
        let mqtt = ConnectionConfig::Mqtt {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "hub".to_string(),
            topics: vec![MqttTopic {
                topic: "sensors/#".to_string(),
                qos: 3,
            }],
        };
        assert!(mqtt.validate().is_err());
    }

    #[test]
    fn test_validate_redis_needs_target() {
        let redis = ConnectionConfig::RedisPubsub {
            url: "redis://localhost".to_string(),
            channels: vec![],
            patterns: vec![],
        };
        assert!(redis.validate().is_err());
    }

    #[test]
    fn test_source_indexed_fields() {
        let src = DataSource::new("lib-1", "events", kafka());
        let fields = src.indexed_fields();
        assert_eq!(fields.get("category"), Some(&IndexValue::String("stream".to_string())));
        assert_eq!(fields.get("kind"), Some(&IndexValue::String("kafka".to_string())));
    }
}
