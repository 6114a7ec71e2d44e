//! Redis pub/sub source adapter
//!
//! Subscribes to channels and/or patterns. Pub/sub delivery is
//! fire-and-forget on the broker side, so this adapter cannot pause:
//! buffer overflow drops records into the overflow counter. On a dropped
//! connection the adapter rebuilds the subscriber, replays every channel
//! and pattern subscription, and emits the lost/restored pair.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{Connector, ConnectorStats, ReconnectBackoff, SharedStats, StreamEvent, payload};
use crate::domain::{ConnectionConfig, DataSource};
use crate::error::SyncError;

pub struct RedisPubsubConnector {
    url: String,
    channels: Vec<String>,
    patterns: Vec<String>,
    max_reconnect: Duration,
    client: Option<redis::Client>,
    stats: SharedStats,
}

impl RedisPubsubConnector {
    pub fn new(source: &DataSource) -> Result<Self, SyncError> {
        let ConnectionConfig::RedisPubsub { url, channels, patterns } = &source.connection else {
            return Err(SyncError::Config("source is not redis_pubsub".into()));
        };
        Ok(Self {
            url: url.clone(),
            channels: channels.clone(),
            patterns: patterns.clone(),
            max_reconnect: Duration::from_secs(source.params.max_reconnect_interval_secs),
            client: None,
            stats: SharedStats::default(),
        })
    }

    async fn build_subscriber(&self) -> Result<redis::aio::PubSub, SyncError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| SyncError::Fatal("redis connector used before open()".into()))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| SyncError::Unavailable(format!("redis connect failed: {e}")))?;
        for channel in &self.channels {
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| SyncError::Unavailable(format!("redis subscribe {channel} failed: {e}")))?;
        }
        for pattern in &self.patterns {
            pubsub
                .psubscribe(pattern)
                .await
                .map_err(|e| SyncError::Unavailable(format!("redis psubscribe {pattern} failed: {e}")))?;
        }
        Ok(pubsub)
    }
}

#[async_trait]
impl Connector for RedisPubsubConnector {
    async fn open(&mut self) -> Result<(), SyncError> {
        let client =
            redis::Client::open(self.url.as_str()).map_err(|e| SyncError::Config(format!("bad redis url: {e}")))?;
        self.client = Some(client);
        Ok(())
    }

    async fn subscribe(
        &mut self,
        cancel: CancellationToken,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), SyncError> {
        let mut backoff = ReconnectBackoff::new(self.max_reconnect);
        let mut lost = false;
        let mut first_attempt = true;

        loop {
            let mut pubsub = match self.build_subscriber().await {
                Ok(pubsub) => pubsub,
                Err(e) if first_attempt => return Err(e),
                Err(e) => {
                    self.stats.error();
                    warn!(error = %e, "redis reconnect attempt failed");
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };
            first_attempt = false;
            if lost {
                lost = false;
                backoff.reset();
                let count = self.stats.reconnect();
                let _ = tx
                    .send(StreamEvent::ConnectionRestored {
                        source: "redis_pubsub".to_string(),
                        reconnect_count: count,
                    })
                    .await;
            }

            let mut stream = pubsub.on_message();
            let disconnected = loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    next = stream.next() => match next {
                        Some(message) => {
                            let channel = message.get_channel_name().to_string();
                            let bytes: Vec<u8> = match message.get_payload() {
                                Ok(bytes) => bytes,
                                Err(e) => {
                                    self.stats.error();
                                    warn!(channel, error = %e, "unreadable redis payload skipped");
                                    continue;
                                }
                            };
                            match payload::decode(&bytes) {
                                Ok(value) => {
                                    let event = StreamEvent::Record {
                                        payload: value,
                                        channel,
                                        sequence: None,
                                    };
                                    match tx.try_send(event) {
                                        Ok(()) => self.stats.record(1),
                                        Err(mpsc::error::TrySendError::Full(_)) => self.stats.overflowed(),
                                        Err(mpsc::error::TrySendError::Closed(_)) => return Ok(()),
                                    }
                                }
                                Err(e) => {
                                    self.stats.error();
                                    warn!(channel, error = %e, "undecodable redis payload skipped");
                                }
                            }
                        }
                        None => break true,
                    }
                }
            };

            if disconnected {
                self.stats.error();
                if !lost {
                    lost = true;
                    let _ = tx
                        .send(StreamEvent::ConnectionLost {
                            source: "redis_pubsub".to_string(),
                        })
                        .await;
                }
                drop(stream);
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    async fn health(&self) -> Result<(), SyncError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| SyncError::Fatal("redis connector used before open()".into()))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SyncError::Unavailable(format!("redis ping failed: {e}")))?;
        let _: () = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| SyncError::Unavailable(format!("redis ping failed: {e}")))?;
        Ok(())
    }

    fn stats(&self) -> ConnectorStats {
        self.stats.snapshot()
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.client = None;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "redis_pubsub"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> DataSource {
        DataSource::new(
            "lib-1",
            "bus",
            ConnectionConfig::RedisPubsub {
                url: "redis://localhost:6379".to_string(),
                channels: vec!["updates".to_string()],
                patterns: vec!["events.*".to_string()],
            },
        )
    }

    #[test]
    fn test_construction() {
        let c = RedisPubsubConnector::new(&source()).unwrap();
        assert_eq!(c.kind(), "redis_pubsub");
        assert!(!c.supports_pause());
    }

    #[tokio::test]
    async fn test_open_rejects_bad_url() {
        let src = DataSource::new(
            "lib-1",
            "bus",
            ConnectionConfig::RedisPubsub {
                url: "not-a-url".to_string(),
                channels: vec!["c".to_string()],
                patterns: vec![],
            },
        );
        let mut c = RedisPubsubConnector::new(&src).unwrap();
        assert!(c.open().await.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_before_open_is_fatal() {
        let mut c = RedisPubsubConnector::new(&source()).unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let err = c.subscribe(CancellationToken::new(), tx).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
    }
}
