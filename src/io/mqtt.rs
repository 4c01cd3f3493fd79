//! MQTT client for receiving gateway traffic
//!
//! Publishes are handed to the ingest queue with `try_send`; a full queue
//! drops the message rather than stalling the event loop. Connection errors
//! are retried with exponential backoff, and the subscription is renewed on
//! every ConnAck.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::ingest::InboundMessage;

/// Exponential reconnect delay: `min`, doubling, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, current: min }
    }

    /// Delay to wait now; doubles the next one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Run the MQTT client until shutdown or until the ingest queue closes
pub async fn start_mqtt_client(
    config: &Config,
    inbound_tx: mpsc::Sender<InboundMessage>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut mqttoptions =
        MqttOptions::new(config.mqtt_client_id(), config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(config.mqtt_keep_alive_secs()));

    // Set credentials if configured
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let topic = config.mqtt_topic().to_string();
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    let mut backoff = Backoff::new(config.mqtt_backoff_min(), config.mqtt_backoff_max());

    info!(
        topic = %topic,
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        client_id = %config.mqtt_client_id(),
        "mqtt_client_started"
    );

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    if let Err(e) = client.try_disconnect() {
                        debug!(error = %e, "mqtt_disconnect_failed");
                    }
                    return;
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        metrics.record_message_received();
                        let msg = InboundMessage::new(publish.topic, publish.payload);
                        match inbound_tx.try_send(msg) {
                            Ok(()) => {}
                            Err(TrySendError::Full(msg)) => {
                                metrics.record_message_dropped();
                                if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                    warn!(topic = %msg.topic, "mqtt_message_dropped_queue_full");
                                    last_drop_warn = Instant::now();
                                }
                            }
                            Err(TrySendError::Closed(_)) => {
                                warn!("ingest_queue_closed");
                                return;
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        backoff.reset();
                        info!("mqtt_connected");
                        if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                            error!(topic = %topic, error = %e, "mqtt_subscribe_failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        info!(topic = %topic, "mqtt_subscribed");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let delay = backoff.next_delay();
                        error!(error = %e, retry_in_secs = %delay.as_secs(), "mqtt_connection_error");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    info!("mqtt_shutdown");
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
