//! Prometheus metrics HTTP endpoint
//!
//! Exposes engine metrics in Prometheus text format at /metrics and a
//! health check at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS, METRICS_WEBHOOK_BOUNDS,
};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

fn write_counter(output: &mut String, name: &str, help: &str, site: &str, val: u64) {
    write_metric(output, name, help, MetricType::Counter, site, val);
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(8192);

    write_ingest_metrics(&mut output, site_id, &summary);
    write_latency_metrics(&mut output, site_id, &summary);
    write_alert_metrics(&mut output, site_id, &summary);
    write_webhook_metrics(&mut output, site_id, &summary);
    write_rollup_metrics(&mut output, site_id, &summary);

    output
}

fn write_ingest_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_counter(
        output,
        "presence_mqtt_messages_received_total",
        "MQTT publishes received (before try_send)",
        site,
        summary.messages_received,
    );
    write_counter(
        output,
        "presence_mqtt_messages_dropped_total",
        "MQTT publishes dropped due to ingest queue full",
        site,
        summary.messages_dropped,
    );
    let _ = writeln!(output, "# HELP presence_messages_per_sec Messages handled per second");
    let _ = writeln!(output, "# TYPE presence_messages_per_sec gauge");
    let _ = writeln!(
        output,
        "presence_messages_per_sec{{site=\"{site}\"}} {:.2}",
        summary.messages_per_sec
    );
    write_counter(
        output,
        "presence_topics_ignored_total",
        "Messages on topics without a gateway id",
        site,
        summary.topics_ignored,
    );
    write_counter(
        output,
        "presence_payload_decode_failures_total",
        "Gateway payloads that were not valid JSON",
        site,
        summary.payload_decode_failures,
    );
    write_counter(
        output,
        "presence_gateways_registered_total",
        "Gateways created on first sight",
        site,
        summary.gateways_registered,
    );
    write_counter(
        output,
        "presence_detections_total",
        "Tag detections decoded from payloads",
        site,
        summary.detections_total,
    );
    write_counter(
        output,
        "presence_samples_recorded_total",
        "Detection samples stored",
        site,
        summary.samples_recorded,
    );
    write_counter(
        output,
        "presence_unknown_tags_total",
        "Detections of unknown or inactive tags",
        site,
        summary.unknown_tags_dropped,
    );
    write_metric(
        output,
        "presence_inbound_queue_depth",
        "Current ingest queue depth",
        MetricType::Gauge,
        site,
        summary.inbound_queue_depth,
    );
}

fn write_latency_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let count: u64 = summary.lat_buckets.iter().sum();
    write_histogram(
        output,
        "presence_message_latency_us",
        "Message handling latency in microseconds",
        site,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.avg_process_latency_us * count,
    );
    write_metric(
        output,
        "presence_message_latency_p99_us",
        "99th percentile message handling latency",
        MetricType::Gauge,
        site,
        summary.lat_p99_us,
    );
    write_metric(
        output,
        "presence_message_latency_max_us",
        "Maximum message handling latency",
        MetricType::Gauge,
        site,
        summary.max_process_latency_us,
    );
}

fn write_alert_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_counter(
        output,
        "presence_alerts_opened_total",
        "Alert sessions opened",
        site,
        summary.alerts_opened,
    );
    write_counter(
        output,
        "presence_alerts_updated_total",
        "Alert sessions refreshed",
        site,
        summary.alerts_updated,
    );
    write_counter(
        output,
        "presence_alerts_closed_total",
        "Alert sessions closed",
        site,
        summary.alerts_closed,
    );
    write_counter(
        output,
        "presence_engine_errors_total",
        "Rule evaluation and sweep failures",
        site,
        summary.engine_errors,
    );
    write_counter(
        output,
        "presence_gateway_offline_total",
        "Gateway online to offline transitions",
        site,
        summary.gateway_offline_transitions,
    );
    write_counter(
        output,
        "presence_gateway_online_total",
        "Gateway offline to online transitions",
        site,
        summary.gateway_online_transitions,
    );
}

fn write_webhook_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_counter(
        output,
        "presence_webhooks_delivered_total",
        "Webhook deliveries answered with 2xx",
        site,
        summary.webhooks_delivered,
    );
    write_counter(
        output,
        "presence_webhooks_failed_total",
        "Webhook deliveries that failed",
        site,
        summary.webhooks_failed,
    );
    write_counter(
        output,
        "presence_webhooks_dropped_total",
        "Webhook jobs dropped due to dispatch queue full",
        site,
        summary.webhooks_dropped,
    );
    write_histogram(
        output,
        "presence_webhook_latency_ms",
        "Webhook round-trip time in milliseconds",
        site,
        &summary.webhook_latency_buckets,
        &METRICS_WEBHOOK_BOUNDS,
        summary.webhook_latency_sum_ms,
    );
}

fn write_rollup_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_counter(
        output,
        "presence_rollup_runs_total",
        "Completed rollup passes",
        site,
        summary.rollup_runs,
    );
    write_counter(
        output,
        "presence_samples_purged_total",
        "Samples deleted after rollup",
        site,
        summary.samples_purged,
    );
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &site_id);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
