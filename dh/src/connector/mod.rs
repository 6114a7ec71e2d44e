//! Connector registry and source adapters
//!
//! One uniform capability set over every source kind: open, batched
//! pulls with an opaque resumable cursor, subscription delivery for
//! stream kinds, health probes, counters, and idempotent close.
//! Connectors are per-execution resources; the executor owns acquisition
//! and releases them on every exit path.

mod file;
mod http;
mod kafka;
mod mqtt;
mod payload;
mod redis_pubsub;
mod scripted;
mod sql;

pub use file::FileConnector;
pub use http::{AuthToken, AuthTokenProvider, HttpConnector, StaticTokenProvider};
pub use kafka::KafkaConnector;
pub use mqtt::MqttConnector;
pub use payload::decode;
pub use redis_pubsub::RedisPubsubConnector;
pub use scripted::{ScriptedConnector, ScriptedFailure, ScriptedPage, StreamStep};
pub use sql::SqlConnector;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{DataSource, Interface};
use crate::error::SyncError;

/// One page of records pulled from a batch source
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Decoded payloads, at most the requested batch size
    pub records: Vec<Value>,
    /// Cursor to resume from; None when exhausted
    pub next_cursor: Option<String>,
    pub eof: bool,
}

impl FetchResult {
    pub fn eof() -> Self {
        Self {
            records: Vec::new(),
            next_cursor: None,
            eof: true,
        }
    }
}

/// What a streaming connector delivers on its channel
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Record {
        payload: Value,
        /// Partition/channel/topic the record arrived on
        channel: String,
        /// Broker-assigned position within the channel, when one exists
        sequence: Option<i64>,
    },
    ConnectionLost {
        source: String,
    },
    ConnectionRestored {
        source: String,
        reconnect_count: u32,
    },
}

/// Counter snapshot for one connector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectorStats {
    pub records_out: u64,
    pub batches: u64,
    pub errors: u64,
    pub reconnects: u32,
    /// Records dropped because the ingest buffer was full (non-pausing
    /// stream kinds only)
    pub overflow: u64,
}

/// Shared counters the adapters update while streaming
#[derive(Default)]
pub(crate) struct SharedStats {
    records_out: AtomicU64,
    batches: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU32,
    overflow: AtomicU64,
}

impl SharedStats {
    pub fn record(&self, n: u64) {
        self.records_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect(&self) -> u32 {
        self.reconnects.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn overflowed(&self) {
        self.overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectorStats {
        ConnectorStats {
            records_out: self.records_out.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            overflow: self.overflow.load(Ordering::Relaxed),
        }
    }
}

/// Uniform source adapter interface
///
/// Batch kinds implement `fetch_batch`; stream kinds implement
/// `subscribe`; calling the wrong one is a `Config` error. `close` is
/// idempotent and releases every task and socket the adapter opened.
#[async_trait]
pub trait Connector: Send {
    /// Establish the transport and authenticate
    async fn open(&mut self) -> Result<(), SyncError>;

    /// Pull the next page of at most `max` records
    ///
    /// Idempotent for the same cursor: re-fetching a page after a failed
    /// commit yields the same records.
    async fn fetch_batch(&mut self, _cursor: Option<&str>, _max: usize) -> Result<FetchResult, SyncError> {
        Err(SyncError::Config(format!("{} is not a batch source", self.kind())))
    }

    /// Deliver records until cancelled; ordering is per channel only
    async fn subscribe(
        &mut self,
        _cancel: CancellationToken,
        _tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), SyncError> {
        Err(SyncError::Config(format!("{} is not a streaming source", self.kind())))
    }

    /// Probe the source without side effects
    async fn health(&self) -> Result<(), SyncError>;

    fn stats(&self) -> ConnectorStats;

    /// Release all resources; safe to call more than once
    async fn close(&mut self) -> Result<(), SyncError>;

    fn kind(&self) -> &'static str;

    /// Whether `subscribe` pauses on a full buffer instead of dropping
    fn supports_pause(&self) -> bool {
        false
    }

    /// Translate an incremental watermark into this connector's cursor
    /// format; None starts from the source's beginning
    fn initial_cursor(&self, _last_sync_value: Option<&str>) -> Option<String> {
        None
    }

    /// Refresh credentials after an `Auth` failure; default is a no-op
    async fn refresh_auth(&mut self) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Bounded backoff for stream reconnect loops
pub(crate) struct ReconnectBackoff {
    current: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    pub fn new(max: Duration) -> Self {
        Self {
            current: Duration::from_millis(500),
            max,
        }
    }

    /// Next delay, doubling up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = Duration::from_millis(500);
    }
}

/// Custom adapter factory: return `Some` to take over construction for
/// a source, `None` to fall through to the built-in adapters
pub type ConnectorFactory =
    dyn Fn(&DataSource, &Interface) -> Option<Box<dyn Connector>> + Send + Sync;

/// Build connectors from source definitions
///
/// The only place adapters are constructed. `http_with_auth` sources
/// need a token provider (the bridge to the external auth script host);
/// building one without it is a configuration error.
pub struct ConnectorRegistry {
    auth: Option<Arc<dyn AuthTokenProvider>>,
    custom: Option<Box<ConnectorFactory>>,
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self { auth: None, custom: None }
    }

    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthTokenProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    /// Register a custom factory consulted before the built-in adapters
    /// (embedded sources, test doubles)
    pub fn with_custom_factory(
        mut self,
        factory: impl Fn(&DataSource, &Interface) -> Option<Box<dyn Connector>> + Send + Sync + 'static,
    ) -> Self {
        self.custom = Some(Box::new(factory));
        self
    }

    /// Instantiate the adapter for a source feeding an interface
    pub fn build(&self, source: &DataSource, interface: &Interface) -> Result<Box<dyn Connector>, SyncError> {
        if let Some(factory) = &self.custom {
            if let Some(connector) = factory(source, interface) {
                return Ok(connector);
            }
        }
        source.connection.validate()?;
        use crate::domain::ConnectionConfig::*;
        let connector: Box<dyn Connector> = match &source.connection {
            HttpNoAuth { .. } => Box::new(HttpConnector::plain(source)?),
            HttpWithAuth { .. } => {
                let provider = self
                    .auth
                    .clone()
                    .ok_or_else(|| SyncError::Config("no auth token provider configured".into()))?;
                Box::new(HttpConnector::with_auth(source, provider)?)
            }
            Database { .. } => Box::new(SqlConnector::new(source, interface)?),
            File { .. } => Box::new(FileConnector::new(source)?),
            Kafka { .. } => Box::new(KafkaConnector::new(source)?),
            Mqtt { .. } => Box::new(MqttConnector::new(source)?),
            RedisPubsub { .. } => Box::new(RedisPubsubConnector::new(source)?),
        };
        Ok(connector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConnectionConfig, TransportType};
    use std::collections::HashMap;

    fn interface() -> Interface {
        Interface::new("lib-1", "if", TransportType::Batch)
    }

    #[test]
    fn test_registry_builds_each_kind() {
        let registry = ConnectorRegistry::new();
        let iface = interface();

        let cases: Vec<(ConnectionConfig, &str)> = vec![
            (
                ConnectionConfig::HttpNoAuth {
                    base_url: "https://api.example.com/rows".into(),
                    page_param: None,
                    page_size_param: None,
                    data_path: None,
                    headers: HashMap::new(),
                },
                "http",
            ),
            (
                ConnectionConfig::Kafka {
                    brokers: "localhost:9092".into(),
                    group_id: "g".into(),
                    topics: vec!["t".into()],
                },
                "kafka",
            ),
            (
                ConnectionConfig::File {
                    dir: "/tmp/in".into(),
                    suffix: None,
                    newest_first: true,
                },
                "file",
            ),
        ];
        for (connection, kind) in cases {
            let source = DataSource::new("lib-1", "s", connection);
            let connector = registry.build(&source, &iface).unwrap();
            assert_eq!(connector.kind(), kind);
        }
    }

    #[test]
    fn test_http_auth_requires_provider() {
        let registry = ConnectorRegistry::new();
        let source = DataSource::new(
            "lib-1",
            "s",
            ConnectionConfig::HttpWithAuth {
                base_url: "https://api.example.com".into(),
                page_param: None,
                page_size_param: None,
                data_path: None,
                headers: HashMap::new(),
                auth: crate::domain::HttpAuthConfig {
                    token_ttl_secs: 3600,
                    refresh_window: 0.2,
                },
            },
        );
        assert!(registry.build(&source, &interface()).is_err());
    }

    #[test]
    fn test_reconnect_backoff_caps() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }
}
