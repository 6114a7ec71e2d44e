//! MQTT source adapter
//!
//! Subscribes with per-topic QoS from the source config. The broker
//! session cannot be paused: when the ingest buffer is full, records are
//! counted as overflow and dropped (the executor routes the loss to the
//! issue stream and marks the task degraded). Subscriptions are replayed
//! on every connection acknowledgment, so they survive reconnects.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Connector, ConnectorStats, ReconnectBackoff, SharedStats, StreamEvent, payload};
use crate::domain::{ConnectionConfig, DataSource, MqttTopic};
use crate::error::SyncError;

fn qos_level(qos: u8) -> Result<QoS, SyncError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(SyncError::Config(format!("invalid mqtt qos {other}"))),
    }
}

pub struct MqttConnector {
    host: String,
    port: u16,
    client_id: String,
    topics: Vec<MqttTopic>,
    max_reconnect: Duration,
    client: Option<AsyncClient>,
    eventloop: Option<rumqttc::EventLoop>,
    stats: SharedStats,
}

impl MqttConnector {
    pub fn new(source: &DataSource) -> Result<Self, SyncError> {
        let ConnectionConfig::Mqtt {
            host,
            port,
            client_id,
            topics,
        } = &source.connection
        else {
            return Err(SyncError::Config("source is not mqtt".into()));
        };
        for topic in topics {
            qos_level(topic.qos)?;
        }
        Ok(Self {
            host: host.clone(),
            port: *port,
            client_id: client_id.clone(),
            topics: topics.clone(),
            max_reconnect: Duration::from_secs(source.params.max_reconnect_interval_secs),
            client: None,
            eventloop: None,
            stats: SharedStats::default(),
        })
    }

    async fn subscribe_all(&self, client: &AsyncClient) -> Result<(), SyncError> {
        for topic in &self.topics {
            client
                .subscribe(topic.topic.clone(), qos_level(topic.qos)?)
                .await
                .map_err(|e| SyncError::Unavailable(format!("mqtt subscribe {} failed: {e}", topic.topic)))?;
        }
        debug!(count = self.topics.len(), "mqtt subscriptions requested");
        Ok(())
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn open(&mut self) -> Result<(), SyncError> {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(15));
        let (client, eventloop) = AsyncClient::new(options, 256);
        self.client = Some(client);
        self.eventloop = Some(eventloop);
        Ok(())
    }

    async fn subscribe(
        &mut self,
        cancel: CancellationToken,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), SyncError> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| SyncError::Fatal("mqtt connector used before open()".into()))?;
        let mut eventloop = self
            .eventloop
            .take()
            .ok_or_else(|| SyncError::Fatal("mqtt subscribe called twice".into()))?;

        let mut backoff = ReconnectBackoff::new(self.max_reconnect);
        let mut lost = false;
        let mut ever_connected = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                polled = eventloop.poll() => match polled {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        // Handler registrations survive reconnects: replay
                        // every subscription on each session start
                        self.subscribe_all(&client).await?;
                        if lost {
                            lost = false;
                            backoff.reset();
                            let count = self.stats.reconnect();
                            let _ = tx.send(StreamEvent::ConnectionRestored {
                                source: "mqtt".to_string(),
                                reconnect_count: count,
                            }).await;
                        }
                        ever_connected = true;
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        match payload::decode(&publish.payload) {
                            Ok(value) => {
                                let event = StreamEvent::Record {
                                    payload: value,
                                    channel: publish.topic.clone(),
                                    sequence: Some(publish.pkid as i64),
                                };
                                // No pausing here: a full buffer drops the
                                // record and counts the overflow
                                match tx.try_send(event) {
                                    Ok(()) => self.stats.record(1),
                                    Err(mpsc::error::TrySendError::Full(_)) => self.stats.overflowed(),
                                    Err(mpsc::error::TrySendError::Closed(_)) => return Ok(()),
                                }
                            }
                            Err(e) => {
                                self.stats.error();
                                warn!(topic = %publish.topic, error = %e, "undecodable mqtt payload skipped");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.stats.error();
                        warn!(error = %e, "mqtt connection error");
                        if ever_connected && !lost {
                            lost = true;
                            let _ = tx.send(StreamEvent::ConnectionLost {
                                source: "mqtt".to_string(),
                            }).await;
                        }
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    async fn health(&self) -> Result<(), SyncError> {
        if self.client.is_some() {
            Ok(())
        } else {
            Err(SyncError::Fatal("mqtt connector used before open()".into()))
        }
    }

    fn stats(&self) -> ConnectorStats {
        self.stats.snapshot()
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        self.eventloop = None;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "mqtt"
    }
}
