//! IO modules - external system interfaces
//!
//! - `mqtt` - MQTT client feeding gateway publishes into the ingest queue
//! - `topic` - gateway topic parsing
//! - `payload` - gateway payload decoding (arrays, envelopes, single readings)
//! - `webhook` - signed webhook delivery and its dispatch queue
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod mqtt;
pub mod payload;
pub mod prometheus;
pub mod topic;
pub mod webhook;

// Re-export commonly used types
pub use mqtt::{start_mqtt_client, Backoff};
pub use payload::{decode_payload, DecodedPayload, Detection};
pub use topic::{GatewayTopic, TopicParser};
pub use webhook::{webhook_channel, WebhookDispatcher, WebhookJob, WebhookSender, WebhookWorker};
