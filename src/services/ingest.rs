//! Inbound message handling
//!
//! One consumer drains the MQTT queue in arrival order: topic parsing,
//! gateway registration and heartbeat, payload decoding, sample recording,
//! then rule evaluation for every known tag.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::domain::mac;
use crate::domain::types::{Device, DeviceId, NewSample};
use crate::infra::metrics::Metrics;
use crate::io::payload::{decode_payload, DecodedPayload, Detection};
use crate::io::topic::TopicParser;
use crate::services::alert_engine::AlertEngine;
use crate::services::registry::GatewayRegistry;
use crate::store::{Store, StoreResult};

/// One message handed over by the MQTT client
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
    pub received_instant: Instant,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
            received_instant: Instant::now(),
        }
    }

    pub fn at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }
}

/// What happened to one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Not a gateway topic
    Ignored,
    Processed { device_id: DeviceId, detections: usize, recorded: usize },
}

pub struct Ingestor {
    parser: TopicParser,
    registry: GatewayRegistry,
    engine: Arc<AlertEngine>,
    store: Arc<dyn Store>,
    metrics: Arc<Metrics>,
}

impl Ingestor {
    pub fn new(
        topic_filter: &str,
        store: Arc<dyn Store>,
        registry: GatewayRegistry,
        engine: Arc<AlertEngine>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { parser: TopicParser::from_filter(topic_filter), registry, engine, store, metrics }
    }

    /// Process one message. Only registry failures surface as errors; a
    /// failing detection is logged and the rest of the batch still runs.
    pub async fn handle_message(&self, msg: &InboundMessage) -> StoreResult<IngestOutcome> {
        let Some(topic) = self.parser.parse(&msg.topic) else {
            self.metrics.record_topic_ignored();
            debug!(topic = %msg.topic, "topic_ignored");
            return Ok(IngestOutcome::Ignored);
        };

        let decoded = if topic.may_carry_detections() {
            match decode_payload(&msg.payload) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.metrics.record_payload_decode_failure();
                    warn!(topic = %msg.topic, error = %e, "payload_decode_failed");
                    DecodedPayload::default()
                }
            }
        } else {
            DecodedPayload::default()
        };

        // a payload MAC without hex digits cannot name a gateway
        let gateway_mac = decoded
            .gateway_mac
            .as_deref()
            .filter(|raw| mac::normalize(raw).is_some())
            .unwrap_or(&topic.gateway_id);
        let device = self
            .registry
            .resolve_or_create(gateway_mac, topic.building.as_deref(), topic.floor.as_deref())
            .await?;
        self.registry.touch_last_seen(device.id, msg.received_at).await?;

        let detections = decoded.detections.len();
        self.metrics.record_detections(detections as u64);

        let mut recorded = 0;
        for detection in decoded.detections {
            let tag_mac = detection.tag_mac.clone();
            match self.record_detection(&device, detection, msg.received_at).await {
                Ok(true) => recorded += 1,
                Ok(false) => {}
                Err(e) => {
                    self.metrics.record_engine_error();
                    warn!(device_id = %device.id, tag_mac = %tag_mac, error = %e, "detection_failed");
                }
            }
        }

        Ok(IngestOutcome::Processed { device_id: device.id, detections, recorded })
    }

    /// Store the sample and evaluate rules. `false` when the tag is unknown
    /// or inactive.
    async fn record_detection(
        &self,
        device: &Device,
        detection: Detection,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let candidates = mac::candidates(&detection.tag_mac);
        let tag = match self.store.find_tag_by_mac(&candidates).await? {
            Some(tag) if tag.active => tag,
            Some(tag) => {
                self.metrics.record_unknown_tag();
                debug!(tag_id = %tag.id, device_id = %device.id, "inactive_tag_dropped");
                return Ok(false);
            }
            None => {
                self.metrics.record_unknown_tag();
                debug!(tag_mac = %detection.tag_mac, device_id = %device.id, "unknown_tag_dropped");
                return Ok(false);
            }
        };

        let sample_id = self
            .store
            .insert_sample(NewSample {
                device_id: device.id,
                tag_id: tag.id,
                rssi: detection.rssi,
                captured_at: now,
                raw: detection.raw,
            })
            .await?;
        self.metrics.record_sample();

        // the sample stays committed whatever the engine does
        if let Err(e) = self.engine.on_detection(device, &tag, Some(sample_id), now).await {
            self.metrics.record_engine_error();
            error!(
                tag_id = %tag.id,
                device_id = %device.id,
                sample_id = %sample_id,
                error = %e,
                "alert_engine_failed"
            );
        }
        Ok(true)
    }

    /// Drain the inbound queue until it closes or shutdown is signalled
    pub async fn run(self, mut rx: mpsc::Receiver<InboundMessage>, mut shutdown: watch::Receiver<bool>) {
        info!(prefix = %self.parser.prefix(), "ingest_started");
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.metrics.set_inbound_queue_depth(rx.len() as u64);
                    if let Err(e) = self.handle_message(&msg).await {
                        warn!(topic = %msg.topic, error = %e, "message_failed");
                    }
                    let latency_us = msg.received_instant.elapsed().as_micros() as u64;
                    self.metrics.record_message_processed(latency_us);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("ingest_shutdown");
                        return;
                    }
                }
            }
        }
        info!("ingest_queue_closed");
    }
}
