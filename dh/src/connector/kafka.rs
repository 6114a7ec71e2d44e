//! Kafka source adapter
//!
//! Subscription-only stream source. Delivery preserves broker order per
//! partition and makes no cross-partition promise. On broker loss the
//! adapter emits `ConnectionLost`, backs off (bounded), rebuilds the
//! consumer with the same subscriptions, and emits `ConnectionRestored`
//! once messages flow again. Backpressure pauses consumption: the
//! adapter blocks on the bounded ingest channel instead of dropping.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::ClientConfig;
use rdkafka::Message;
use rdkafka::consumer::{Consumer, StreamConsumer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Connector, ConnectorStats, FetchResult, ReconnectBackoff, SharedStats, StreamEvent, payload};
use crate::domain::{ConnectionConfig, DataSource};
use crate::error::SyncError;

pub struct KafkaConnector {
    brokers: String,
    group_id: String,
    topics: Vec<String>,
    max_reconnect: Duration,
    consumer: Option<StreamConsumer>,
    stats: SharedStats,
}

impl KafkaConnector {
    pub fn new(source: &DataSource) -> Result<Self, SyncError> {
        let ConnectionConfig::Kafka {
            brokers,
            group_id,
            topics,
        } = &source.connection
        else {
            return Err(SyncError::Config("source is not kafka".into()));
        };
        Ok(Self {
            brokers: brokers.clone(),
            group_id: group_id.clone(),
            topics: topics.clone(),
            max_reconnect: Duration::from_secs(source.params.max_reconnect_interval_secs),
            consumer: None,
            stats: SharedStats::default(),
        })
    }

    fn create_consumer(&self) -> Result<StreamConsumer, SyncError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| SyncError::Unavailable(format!("kafka consumer create failed: {e}")))?;
        let topic_refs: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| SyncError::Unavailable(format!("kafka subscribe failed: {e}")))?;
        debug!(brokers = %self.brokers, topics = ?self.topics, "kafka consumer subscribed");
        Ok(consumer)
    }
}

#[async_trait]
impl Connector for KafkaConnector {
    async fn open(&mut self) -> Result<(), SyncError> {
        self.consumer = Some(self.create_consumer()?);
        Ok(())
    }

    async fn fetch_batch(&mut self, _cursor: Option<&str>, _max: usize) -> Result<FetchResult, SyncError> {
        Err(SyncError::Config("kafka is a streaming source; use subscribe".into()))
    }

    async fn subscribe(
        &mut self,
        cancel: CancellationToken,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), SyncError> {
        let mut consumer = match self.consumer.take() {
            Some(consumer) => consumer,
            None => return Err(SyncError::Fatal("kafka connector used before open()".into())),
        };
        let mut backoff = ReconnectBackoff::new(self.max_reconnect);
        let mut lost = false;

        loop {
            let mut stream = consumer.stream();
            let disconnect = loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    next = stream.next() => match next {
                        Some(Ok(message)) => {
                            if lost {
                                lost = false;
                                backoff.reset();
                                let count = self.stats.reconnect();
                                let _ = tx.send(StreamEvent::ConnectionRestored {
                                    source: "kafka".to_string(),
                                    reconnect_count: count,
                                }).await;
                            }
                            let raw = message.payload().unwrap_or_default();
                            match payload::decode(raw) {
                                Ok(value) => {
                                    let event = StreamEvent::Record {
                                        payload: value,
                                        channel: format!("{}:{}", message.topic(), message.partition()),
                                        sequence: Some(message.offset()),
                                    };
                                    // Blocking send: a full buffer pauses the consumer
                                    if tx.send(event).await.is_err() {
                                        return Ok(());
                                    }
                                    self.stats.record(1);
                                }
                                Err(e) => {
                                    self.stats.error();
                                    warn!(topic = message.topic(), error = %e, "undecodable kafka payload skipped");
                                }
                            }
                        }
                        Some(Err(e)) => {
                            self.stats.error();
                            warn!(error = %e, "kafka stream error");
                            break true;
                        }
                        None => break true,
                    }
                }
            };

            if disconnect {
                if !lost {
                    lost = true;
                    let _ = tx
                        .send(StreamEvent::ConnectionLost {
                            source: "kafka".to_string(),
                        })
                        .await;
                }
                drop(stream);
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
                // Re-subscribe everything that was active before the drop
                consumer = self.create_consumer()?;
            }
        }
    }

    async fn health(&self) -> Result<(), SyncError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| SyncError::Fatal("kafka connector used before open()".into()))?;
        consumer
            .fetch_metadata(None, Duration::from_secs(5))
            .map_err(|e| SyncError::Unavailable(format!("kafka metadata probe failed: {e}")))?;
        Ok(())
    }

    fn stats(&self) -> ConnectorStats {
        self.stats.snapshot()
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.consumer = None;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "kafka"
    }

    fn supports_pause(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> DataSource {
        DataSource::new(
            "lib-1",
            "events",
            ConnectionConfig::Kafka {
                brokers: "localhost:9092".to_string(),
                group_id: "hub".to_string(),
                topics: vec!["events".to_string(), "audit".to_string()],
            },
        )
    }

    #[test]
    fn test_construction() {
        let c = KafkaConnector::new(&source()).unwrap();
        assert_eq!(c.kind(), "kafka");
        assert!(c.supports_pause());
        assert_eq!(c.topics.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_batch_rejected() {
        let mut c = KafkaConnector::new(&source()).unwrap();
        let err = c.fetch_batch(None, 10).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_subscribe_before_open_is_fatal() {
        let mut c = KafkaConnector::new(&source()).unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let err = c.subscribe(CancellationToken::new(), tx).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let mut c = KafkaConnector::new(&source()).unwrap();
        c.close().await.unwrap();
        c.close().await.unwrap();
    }
}
