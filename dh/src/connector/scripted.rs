//! Scripted connector
//!
//! A deterministic in-memory source for tests: replays declared pages or
//! stream events, injects classified failures at chosen points, and
//! tracks open/close balance so resource-leak assertions are cheap.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Connector, ConnectorStats, FetchResult, SharedStats, StreamEvent};
use crate::error::SyncError;

/// Failure kinds a script can inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Unavailable,
    Auth,
    Schema,
    Fatal,
    Timeout,
    WriteConflict,
}

impl ScriptedFailure {
    fn to_error(self) -> SyncError {
        match self {
            ScriptedFailure::Unavailable => SyncError::Unavailable("scripted outage".into()),
            ScriptedFailure::Auth => SyncError::Auth("scripted credential expiry".into()),
            ScriptedFailure::Schema => SyncError::Schema("scripted shape mismatch".into()),
            ScriptedFailure::Fatal => SyncError::Fatal("scripted invariant violation".into()),
            ScriptedFailure::Timeout => SyncError::Timeout(Duration::from_secs(1)),
            ScriptedFailure::WriteConflict => SyncError::WriteConflict("scripted contention".into()),
        }
    }
}

/// One page of a scripted batch source
#[derive(Debug, Clone, Default)]
pub struct ScriptedPage {
    pub records: Vec<Value>,
    /// Fail this many fetches of the page before succeeding
    pub fail_times: u32,
    pub failure: Option<ScriptedFailure>,
}

impl ScriptedPage {
    pub fn of(records: Vec<Value>) -> Self {
        Self {
            records,
            fail_times: 0,
            failure: None,
        }
    }

    pub fn failing(mut self, failure: ScriptedFailure, times: u32) -> Self {
        self.failure = Some(failure);
        self.fail_times = times;
        self
    }
}

/// One step of a scripted stream source
#[derive(Debug, Clone)]
pub enum StreamStep {
    Record { payload: Value, channel: String },
    /// Simulated broker loss followed by a successful reconnect
    Disconnect,
}

pub struct ScriptedConnector {
    pages: Vec<ScriptedPage>,
    stream: Vec<StreamStep>,
    pause_capable: bool,
    /// Auth failures persist until refresh_auth() is called
    auth_broken: bool,
    /// Artificial latency per fetch/record, for concurrency tests
    delay: Option<Duration>,
    open_count: u32,
    close_count: u32,
    stats: SharedStats,
}

impl ScriptedConnector {
    pub fn batches(pages: Vec<ScriptedPage>) -> Self {
        Self {
            pages,
            stream: Vec::new(),
            pause_capable: false,
            auth_broken: false,
            delay: None,
            open_count: 0,
            close_count: 0,
            stats: SharedStats::default(),
        }
    }

    pub fn streaming(steps: Vec<StreamStep>, pause_capable: bool) -> Self {
        Self {
            pages: Vec::new(),
            stream: steps,
            pause_capable,
            auth_broken: false,
            delay: None,
            open_count: 0,
            close_count: 0,
            stats: SharedStats::default(),
        }
    }

    /// Make every fetch fail with `Auth` until credentials are refreshed
    pub fn with_broken_auth(mut self) -> Self {
        self.auth_broken = true;
        self
    }

    /// Add artificial latency to each fetch and stream record
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    pub fn close_count(&self) -> u32 {
        self.close_count
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&mut self) -> Result<(), SyncError> {
        self.open_count += 1;
        Ok(())
    }

    async fn fetch_batch(&mut self, cursor: Option<&str>, max: usize) -> Result<FetchResult, SyncError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.auth_broken {
            self.stats.error();
            return Err(SyncError::Auth("scripted credential expiry".into()));
        }
        let page: usize = match cursor {
            Some(raw) => raw
                .parse()
                .map_err(|_| SyncError::Fatal(format!("malformed scripted cursor '{raw}'")))?,
            None => 0,
        };
        let Some(scripted) = self.pages.get_mut(page) else {
            return Ok(FetchResult::eof());
        };
        if scripted.fail_times > 0 {
            scripted.fail_times -= 1;
            self.stats.error();
            return Err(scripted.failure.unwrap_or(ScriptedFailure::Unavailable).to_error());
        }

        let records: Vec<Value> = scripted.records.iter().take(max).cloned().collect();
        self.stats.batch();
        self.stats.record(records.len() as u64);
        let eof = page + 1 >= self.pages.len();
        Ok(FetchResult {
            records,
            next_cursor: if eof { None } else { Some((page + 1).to_string()) },
            eof,
        })
    }

    async fn subscribe(
        &mut self,
        cancel: CancellationToken,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), SyncError> {
        let steps = self.stream.clone();
        for step in steps {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match step {
                StreamStep::Record { payload, channel } => {
                    if let Some(delay) = self.delay {
                        tokio::time::sleep(delay).await;
                    }
                    let event = StreamEvent::Record {
                        payload,
                        channel,
                        sequence: None,
                    };
                    if self.pause_capable {
                        if tx.send(event).await.is_err() {
                            return Ok(());
                        }
                        self.stats.record(1);
                    } else {
                        match tx.try_send(event) {
                            Ok(()) => self.stats.record(1),
                            Err(mpsc::error::TrySendError::Full(_)) => self.stats.overflowed(),
                            Err(mpsc::error::TrySendError::Closed(_)) => return Ok(()),
                        }
                    }
                }
                StreamStep::Disconnect => {
                    let _ = tx
                        .send(StreamEvent::ConnectionLost {
                            source: "scripted".to_string(),
                        })
                        .await;
                    let count = self.stats.reconnect();
                    let _ = tx
                        .send(StreamEvent::ConnectionRestored {
                            source: "scripted".to_string(),
                            reconnect_count: count,
                        })
                        .await;
                }
            }
        }
        // Script exhausted: a realtime source stays up until cancelled
        cancel.cancelled().await;
        Ok(())
    }

    async fn health(&self) -> Result<(), SyncError> {
        Ok(())
    }

    fn stats(&self) -> ConnectorStats {
        self.stats.snapshot()
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.close_count += 1;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }

    fn supports_pause(&self) -> bool {
        self.pause_capable
    }

    async fn refresh_auth(&mut self) -> Result<(), SyncError> {
        self.auth_broken = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pages_and_eof() {
        let mut c = ScriptedConnector::batches(vec![
            ScriptedPage::of(vec![json!({"n": 1}), json!({"n": 2})]),
            ScriptedPage::of(vec![json!({"n": 3})]),
        ]);
        c.open().await.unwrap();

        let p0 = c.fetch_batch(None, 10).await.unwrap();
        assert_eq!(p0.records.len(), 2);
        assert!(!p0.eof);

        let p1 = c.fetch_batch(p0.next_cursor.as_deref(), 10).await.unwrap();
        assert_eq!(p1.records.len(), 1);
        assert!(p1.eof);
    }

    #[tokio::test]
    async fn test_fetch_idempotent_per_cursor() {
        let mut c = ScriptedConnector::batches(vec![ScriptedPage::of(vec![json!({"n": 1})])]);
        let a = c.fetch_batch(None, 10).await.unwrap();
        let b = c.fetch_batch(None, 10).await.unwrap();
        assert_eq!(a.records, b.records);
    }

    #[tokio::test]
    async fn test_injected_failure_then_success() {
        let mut c = ScriptedConnector::batches(vec![
            ScriptedPage::of(vec![json!({"n": 1})]).failing(ScriptedFailure::Unavailable, 2),
        ]);
        assert!(c.fetch_batch(None, 10).await.is_err());
        assert!(c.fetch_batch(None, 10).await.is_err());
        assert!(c.fetch_batch(None, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_auth_heals_on_refresh() {
        let mut c = ScriptedConnector::batches(vec![ScriptedPage::of(vec![json!({"n": 1})])]).with_broken_auth();
        let err = c.fetch_batch(None, 10).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Auth);
        c.refresh_auth().await.unwrap();
        assert!(c.fetch_batch(None, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_stream_script_with_reconnect() {
        let mut c = ScriptedConnector::streaming(
            vec![
                StreamStep::Record {
                    payload: json!({"n": 1}),
                    channel: "x:0".to_string(),
                },
                StreamStep::Disconnect,
                StreamStep::Record {
                    payload: json!({"n": 2}),
                    channel: "x:0".to_string(),
                },
            ],
            true,
        );
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        let handle = tokio::spawn(async move { c.subscribe(cancel, tx).await });

        assert!(matches!(rx.recv().await.unwrap(), StreamEvent::Record { .. }));
        assert!(matches!(rx.recv().await.unwrap(), StreamEvent::ConnectionLost { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            StreamEvent::ConnectionRestored { reconnect_count: 1, .. }
        ));
        assert!(matches!(rx.recv().await.unwrap(), StreamEvent::Record { .. }));

        canceller.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_open_close_balance() {
        let mut c = ScriptedConnector::batches(vec![]);
        c.open().await.unwrap();
        c.close().await.unwrap();
        c.close().await.unwrap();
        assert_eq!(c.open_count(), 1);
        assert_eq!(c.close_count(), 2);
    }
}
