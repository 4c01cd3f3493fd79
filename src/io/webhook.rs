//! Outbound webhook delivery
//!
//! Producers (alert engine, registry) never wait on HTTP: they push a job
//! through a bounded channel with `try_send` and a single worker performs
//! the deliveries, up to `MAX_CONCURRENT_DELIVERIES` subscribers at a time
//! for each job. Delivery is fire-and-forget: failures are logged and
//! counted, never retried.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::stream::{self, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::alert::AlertEvent;
use crate::domain::types::WebhookSubscription;
use crate::infra::metrics::Metrics;
use crate::store::Store;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_WEBHOOK_ID: &str = "X-Webhook-Id";
pub const HEADER_EVENT_TYPE: &str = "X-Event-Type";
pub const HEADER_SIGNATURE: &str = "X-Signature";
pub const HEADER_DELIVERY: &str = "X-Webhook-Delivery";

/// Deliveries in flight per dispatched event
pub const MAX_CONCURRENT_DELIVERIES: usize = 4;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("receiver answered {0}")]
    Status(u16),
}

#[derive(Serialize)]
struct Envelope<'a> {
    event_type: &'a str,
    timestamp: String,
    payload: &'a Value,
}

/// Serialized `{event_type, timestamp, payload}` body
pub fn build_body(
    event_type: &str,
    payload: &Value,
    at: DateTime<Utc>,
) -> Result<String, WebhookError> {
    let envelope = Envelope {
        event_type,
        timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        payload,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// `sha256=<hex>` HMAC of the exact body bytes
pub fn sign_payload(secret: &str, body: &str) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::Signing(e.to_string()))?;
    mac.update(body.as_bytes());
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Per-dispatch delivery tally
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub matched: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Delivers envelopes to every matching subscription
pub struct WebhookDispatcher {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl WebhookDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { store, client, metrics })
    }

    /// Deliver `payload` to every active subscription whose filter is null
    /// or equal to `event_type`. Never fails; see the returned tally.
    pub async fn dispatch(&self, event_type: &str, payload: &Value) -> DispatchReport {
        let mut report = DispatchReport::default();

        let subscriptions = match self.store.subscriptions_for(event_type).await {
            Ok(subs) => subs,
            Err(e) => {
                warn!(event_type = %event_type, error = %e, "webhook_subscriptions_load_failed");
                return report;
            }
        };
        if subscriptions.is_empty() {
            return report;
        }
        report.matched = subscriptions.len();

        let body = match build_body(event_type, payload, Utc::now()) {
            Ok(body) => body,
            Err(e) => {
                error!(event_type = %event_type, error = %e, "webhook_body_failed");
                report.failed = report.matched;
                return report;
            }
        };

        let deliveries: Vec<_> = subscriptions
            .iter()
            .map(|sub| {
                let body = body.as_str();
                async move {
                    let started = Instant::now();
                    let result = self.deliver(sub, event_type, body).await;
                    (sub, result, started.elapsed().as_millis() as u64)
                }
            })
            .collect();
        let results: Vec<(&WebhookSubscription, Result<(), WebhookError>, u64)> =
            stream::iter(deliveries)
                .buffer_unordered(MAX_CONCURRENT_DELIVERIES)
                .collect()
                .await;

        for (sub, result, latency_ms) in results {
            self.metrics.record_webhook(result.is_ok(), latency_ms);

            match result {
                Ok(()) => {
                    report.delivered += 1;
                    debug!(
                        subscription_id = %sub.id,
                        event_type = %event_type,
                        latency_ms = %latency_ms,
                        "webhook_delivered"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        subscription_id = %sub.id,
                        url = %sub.url,
                        event_type = %event_type,
                        error = %e,
                        "webhook_delivery_failed"
                    );
                }
            }
        }
        report
    }

    async fn deliver(
        &self,
        sub: &WebhookSubscription,
        event_type: &str,
        body: &str,
    ) -> Result<(), WebhookError> {
        let mut request = self
            .client
            .post(&sub.url)
            .header(CONTENT_TYPE, "application/json")
            .header(HEADER_WEBHOOK_ID, sub.id.to_string())
            .header(HEADER_EVENT_TYPE, event_type)
            .header(HEADER_DELIVERY, Uuid::now_v7().to_string());

        if let Some(secret) = sub.secret_token.as_deref().filter(|s| !s.is_empty()) {
            request = request.header(HEADER_SIGNATURE, sign_payload(secret, body)?);
        }

        let response = request.body(body.to_owned()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// One queued delivery
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookJob {
    pub event_type: String,
    pub payload: Value,
}

/// Sender handle for webhook jobs
///
/// Clone this to share across producers.
/// Non-blocking - if the channel is full, jobs are dropped and counted.
#[derive(Clone)]
pub struct WebhookSender {
    tx: mpsc::Sender<WebhookJob>,
    metrics: Arc<Metrics>,
}

impl WebhookSender {
    /// Queue a delivery; returns false when it was dropped
    pub fn dispatch(&self, event_type: &str, payload: Value) -> bool {
        let job = WebhookJob { event_type: event_type.to_string(), payload };
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                self.metrics.record_webhook_dropped();
                warn!(event_type = %job.event_type, "webhook_dropped_queue_full");
                false
            }
            Err(TrySendError::Closed(job)) => {
                self.metrics.record_webhook_dropped();
                debug!(event_type = %job.event_type, "webhook_dropped_worker_stopped");
                false
            }
        }
    }

    /// Queue an alert event with its enriched payload
    pub fn dispatch_alert(&self, event: &AlertEvent) -> bool {
        self.dispatch(event.kind.as_str(), event.webhook_payload())
    }
}

/// Create a webhook channel pair
///
/// The receiver is normally handed to a [`WebhookWorker`]; tests read it
/// directly to observe what producers queued.
pub fn webhook_channel(
    buffer_size: usize,
    metrics: Arc<Metrics>,
) -> (WebhookSender, mpsc::Receiver<WebhookJob>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (WebhookSender { tx, metrics }, rx)
}

/// Drains the webhook queue through a dispatcher
pub struct WebhookWorker {
    dispatcher: Arc<WebhookDispatcher>,
    rx: mpsc::Receiver<WebhookJob>,
}

impl WebhookWorker {
    pub fn new(dispatcher: Arc<WebhookDispatcher>, rx: mpsc::Receiver<WebhookJob>) -> Self {
        Self { dispatcher, rx }
    }

    /// Run until every sender is gone or shutdown is signalled. On shutdown
    /// the jobs already queued are still delivered.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("webhook_worker_started");
        loop {
            tokio::select! {
                job = self.rx.recv() => {
                    let Some(job) = job else { break };
                    self.dispatcher.dispatch(&job.event_type, &job.payload).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let mut drained = 0usize;
                        while let Ok(job) = self.rx.try_recv() {
                            self.dispatcher.dispatch(&job.event_type, &job.payload).await;
                            drained += 1;
                        }
                        info!(drained = %drained, "webhook_worker_shutdown");
                        return;
                    }
                }
            }
        }
        info!("webhook_worker_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::SubscriptionId;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn subscription(id: i64, url: String, filter: Option<&str>, secret: Option<&str>) -> WebhookSubscription {
        WebhookSubscription {
            id: SubscriptionId(id),
            url,
            secret_token: secret.map(str::to_string),
            event_type_filter: filter.map(str::to_string),
            is_active: true,
        }
    }

    fn dispatcher(store: Arc<MemoryStore>) -> (WebhookDispatcher, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let d = WebhookDispatcher::new(store, Duration::from_secs(2), metrics.clone()).unwrap();
        (d, metrics)
    }

    #[test]
    fn test_sign_payload_known_vector() {
        // RFC 4231 test case 2
        let sig = sign_payload("Jefe", "what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_envelope_shape() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let body = build_body("DWELL_TIME", &json!({"tag_id": 3}), at).unwrap();
        let parsed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["event_type"], "DWELL_TIME");
        assert_eq!(parsed["timestamp"], "2024-05-01T08:00:00.000Z");
        assert_eq!(parsed["payload"]["tag_id"], 3);
    }

    #[tokio::test]
    async fn test_dispatch_filters_and_signs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/all"))
            .and(header("X-Event-Type", "FORBIDDEN_SECTOR"))
            .and(header("X-Webhook-Id", "1"))
            .and(header_exists("X-Signature"))
            .and(header_exists("X-Webhook-Delivery"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/dwell"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        store.add_subscription(subscription(1, format!("{}/all", server.uri()), None, Some("s3cret")));
        store.add_subscription(subscription(
            2,
            format!("{}/dwell", server.uri()),
            Some("DWELL_TIME"),
            None,
        ));
        let (dispatcher, metrics) = dispatcher(store);

        let report = dispatcher.dispatch("FORBIDDEN_SECTOR", &json!({"tag_id": 1})).await;
        assert_eq!(report, DispatchReport { matched: 1, delivered: 1, failed: 0 });
        assert_eq!(metrics.webhooks_delivered(), 1);

        let received = server.received_requests().await.unwrap();
        let request = &received[0];
        let body = String::from_utf8(request.body.clone()).unwrap();
        let expected = sign_payload("s3cret", &body).unwrap();
        let signature = request.headers.get("X-Signature").unwrap().to_str().unwrap();
        assert_eq!(signature, expected);
    }

    #[tokio::test]
    async fn test_slow_subscribers_are_delivered_concurrently() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .expect(3)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        for id in 1..=3 {
            store.add_subscription(subscription(id, format!("{}/hook/{id}", server.uri()), None, None));
        }
        let (dispatcher, metrics) = dispatcher(store);

        let started = Instant::now();
        let report = dispatcher.dispatch("GATEWAY_OFFLINE", &json!({})).await;
        assert_eq!(report, DispatchReport { matched: 3, delivered: 3, failed: 0 });
        assert_eq!(metrics.webhooks_delivered(), 3);
        // one delay per batch, not one per subscriber
        assert!(started.elapsed() < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        store.add_subscription(subscription(1, format!("{}/hook", server.uri()), None, None));
        // nothing listens on port 9 of the loopback
        store.add_subscription(subscription(2, "http://127.0.0.1:9/hook".to_string(), None, None));
        let (dispatcher, metrics) = dispatcher(store);

        let report = dispatcher.dispatch("GATEWAY_OFFLINE", &json!({})).await;
        assert_eq!(report, DispatchReport { matched: 2, delivered: 0, failed: 2 });
        assert_eq!(metrics.webhooks_failed(), 2);
    }

    #[tokio::test]
    async fn test_no_subscriptions_no_requests() {
        let (dispatcher, metrics) = dispatcher(Arc::new(MemoryStore::new()));
        let report = dispatcher.dispatch("GATEWAY_ONLINE", &json!({})).await;
        assert_eq!(report, DispatchReport::default());
        assert_eq!(metrics.webhooks_delivered() + metrics.webhooks_failed(), 0);
    }

    #[tokio::test]
    async fn test_sender_drops_when_full() {
        let metrics = Arc::new(Metrics::new());
        let (sender, mut rx) = webhook_channel(1, metrics.clone());
        assert!(sender.dispatch("GATEWAY_ONLINE", json!({"n": 1})));
        assert!(!sender.dispatch("GATEWAY_ONLINE", json!({"n": 2})));
        assert_eq!(metrics.webhooks_dropped(), 1);
        assert_eq!(rx.recv().await.unwrap().payload["n"], 1);
    }

    #[tokio::test]
    async fn test_worker_drains_on_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .expect(3)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        store.add_subscription(subscription(1, format!("{}/hook", server.uri()), None, None));
        let (dispatcher, metrics) = dispatcher(store);

        let (sender, rx) = webhook_channel(16, metrics.clone());
        for n in 0..3 {
            sender.dispatch("GATEWAY_OFFLINE", json!({ "n": n }));
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        WebhookWorker::new(Arc::new(dispatcher), rx).run(shutdown_rx).await;
        assert_eq!(metrics.webhooks_delivered(), 3);
    }
}
