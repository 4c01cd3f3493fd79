//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Webhook round-trip bucket boundaries (milliseconds)
const WEBHOOK_BOUNDS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn webhook_bucket_index(latency_ms: u64) -> usize {
    WEBHOOK_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps periodic counters to get a
/// consistent snapshot.
pub struct Metrics {
    /// MQTT publishes received (monotonic)
    messages_received: AtomicU64,
    /// Messages handled since last report (reset on report)
    messages_since_report: AtomicU64,
    /// Sum of message handling latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max handling latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Message handling latency histogram (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Inbound messages dropped because the ingest queue was full
    messages_dropped: AtomicU64,
    /// Topics outside the prefix or without a gateway id
    topics_ignored: AtomicU64,
    /// Payloads that were not valid JSON
    payload_decode_failures: AtomicU64,
    /// Gateways created by the registry
    gateways_registered: AtomicU64,
    /// Tag detections decoded from payloads
    detections_total: AtomicU64,
    /// Raw samples appended
    samples_recorded: AtomicU64,
    /// Detections for unknown or inactive tags
    unknown_tags_dropped: AtomicU64,
    alerts_opened: AtomicU64,
    alerts_updated: AtomicU64,
    alerts_closed: AtomicU64,
    /// Persistence failures isolated inside the alert engine
    engine_errors: AtomicU64,
    gateway_offline_transitions: AtomicU64,
    gateway_online_transitions: AtomicU64,
    webhooks_delivered: AtomicU64,
    webhooks_failed: AtomicU64,
    /// Webhook jobs dropped because the dispatch queue was full
    webhooks_dropped: AtomicU64,
    /// Webhook round-trip histogram in milliseconds (cumulative)
    webhook_latency_buckets: [AtomicU64; NUM_BUCKETS],
    webhook_latency_sum_ms: AtomicU64,
    rollup_runs: AtomicU64,
    samples_purged: AtomicU64,
    /// Current ingest queue depth (updated by sampler)
    inbound_queue_depth: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            messages_dropped: AtomicU64::new(0),
            topics_ignored: AtomicU64::new(0),
            payload_decode_failures: AtomicU64::new(0),
            gateways_registered: AtomicU64::new(0),
            detections_total: AtomicU64::new(0),
            samples_recorded: AtomicU64::new(0),
            unknown_tags_dropped: AtomicU64::new(0),
            alerts_opened: AtomicU64::new(0),
            alerts_updated: AtomicU64::new(0),
            alerts_closed: AtomicU64::new(0),
            engine_errors: AtomicU64::new(0),
            gateway_offline_transitions: AtomicU64::new(0),
            gateway_online_transitions: AtomicU64::new(0),
            webhooks_delivered: AtomicU64::new(0),
            webhooks_failed: AtomicU64::new(0),
            webhooks_dropped: AtomicU64::new(0),
            webhook_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            webhook_latency_sum_ms: AtomicU64::new(0),
            rollup_runs: AtomicU64::new(0),
            samples_purged: AtomicU64::new(0),
            inbound_queue_depth: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message was fully handled with given latency (lock-free)
    #[inline]
    pub fn record_message_processed(&self, latency_us: u64) {
        self.messages_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_topic_ignored(&self) {
        self.topics_ignored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_payload_decode_failure(&self) {
        self.payload_decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_gateway_registered(&self) {
        self.gateways_registered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_detections(&self, count: u64) {
        self.detections_total.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sample(&self) {
        self.samples_recorded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unknown_tag(&self) {
        self.unknown_tags_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_opened(&self) {
        self.alerts_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_updated(&self) {
        self.alerts_updated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_closed(&self) {
        self.alerts_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_engine_error(&self) {
        self.engine_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_gateway_transition(&self, online: bool) {
        if online {
            self.gateway_online_transitions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.gateway_offline_transitions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a webhook attempt and its round-trip time
    #[inline]
    pub fn record_webhook(&self, delivered: bool, latency_ms: u64) {
        if delivered {
            self.webhooks_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.webhooks_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.webhook_latency_buckets[webhook_bucket_index(latency_ms)]
            .fetch_add(1, Ordering::Relaxed);
        self.webhook_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_webhook_dropped(&self) {
        self.webhooks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rollup(&self, purged: u64) {
        self.rollup_runs.fetch_add(1, Ordering::Relaxed);
        self.samples_purged.fetch_add(purged, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_inbound_queue_depth(&self, depth: u64) {
        self.inbound_queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn samples_recorded(&self) -> u64 {
        self.samples_recorded.load(Ordering::Relaxed)
    }

    pub fn unknown_tags_dropped(&self) -> u64 {
        self.unknown_tags_dropped.load(Ordering::Relaxed)
    }

    pub fn alerts_opened(&self) -> u64 {
        self.alerts_opened.load(Ordering::Relaxed)
    }

    pub fn alerts_closed(&self) -> u64 {
        self.alerts_closed.load(Ordering::Relaxed)
    }

    pub fn engine_errors(&self) -> u64 {
        self.engine_errors.load(Ordering::Relaxed)
    }

    pub fn webhooks_delivered(&self) -> u64 {
        self.webhooks_delivered.load(Ordering::Relaxed)
    }

    pub fn webhooks_failed(&self) -> u64 {
        self.webhooks_failed.load(Ordering::Relaxed)
    }

    pub fn webhooks_dropped(&self) -> u64 {
        self.webhooks_dropped.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let messages_count = self.messages_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let messages_per_sec = if elapsed.as_secs_f64() > 0.0 {
            messages_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if messages_count > 0 { latency_sum / messages_count } else { 0 };

        let webhook_latency_buckets = load_buckets(&self.webhook_latency_buckets);
        let webhook_count: u64 = webhook_latency_buckets.iter().sum();
        let webhook_latency_sum_ms = self.webhook_latency_sum_ms.load(Ordering::Relaxed);
        let webhook_avg_ms =
            if webhook_count > 0 { webhook_latency_sum_ms / webhook_count } else { 0 };

        MetricsSummary {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_per_sec,
            avg_process_latency_us: avg_latency,
            max_process_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            topics_ignored: self.topics_ignored.load(Ordering::Relaxed),
            payload_decode_failures: self.payload_decode_failures.load(Ordering::Relaxed),
            gateways_registered: self.gateways_registered.load(Ordering::Relaxed),
            detections_total: self.detections_total.load(Ordering::Relaxed),
            samples_recorded: self.samples_recorded.load(Ordering::Relaxed),
            unknown_tags_dropped: self.unknown_tags_dropped.load(Ordering::Relaxed),
            alerts_opened: self.alerts_opened.load(Ordering::Relaxed),
            alerts_updated: self.alerts_updated.load(Ordering::Relaxed),
            alerts_closed: self.alerts_closed.load(Ordering::Relaxed),
            engine_errors: self.engine_errors.load(Ordering::Relaxed),
            gateway_offline_transitions: self.gateway_offline_transitions.load(Ordering::Relaxed),
            gateway_online_transitions: self.gateway_online_transitions.load(Ordering::Relaxed),
            webhooks_delivered: self.webhooks_delivered.load(Ordering::Relaxed),
            webhooks_failed: self.webhooks_failed.load(Ordering::Relaxed),
            webhooks_dropped: self.webhooks_dropped.load(Ordering::Relaxed),
            webhook_latency_buckets,
            webhook_latency_sum_ms,
            webhook_avg_ms,
            rollup_runs: self.rollup_runs.load(Ordering::Relaxed),
            samples_purged: self.samples_purged.load(Ordering::Relaxed),
            inbound_queue_depth: self.inbound_queue_depth.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_WEBHOOK_BOUNDS: [u64; 10] = WEBHOOK_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub messages_received: u64,
    pub messages_per_sec: f64,
    pub avg_process_latency_us: u64,
    pub max_process_latency_us: u64,
    /// Message handling latency histogram buckets (µs)
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub messages_dropped: u64,
    pub topics_ignored: u64,
    pub payload_decode_failures: u64,
    pub gateways_registered: u64,
    pub detections_total: u64,
    pub samples_recorded: u64,
    pub unknown_tags_dropped: u64,
    pub alerts_opened: u64,
    pub alerts_updated: u64,
    pub alerts_closed: u64,
    pub engine_errors: u64,
    pub gateway_offline_transitions: u64,
    pub gateway_online_transitions: u64,
    pub webhooks_delivered: u64,
    pub webhooks_failed: u64,
    pub webhooks_dropped: u64,
    /// Webhook round-trip histogram buckets (ms, cumulative)
    pub webhook_latency_buckets: [u64; NUM_BUCKETS],
    pub webhook_latency_sum_ms: u64,
    pub webhook_avg_ms: u64,
    pub rollup_runs: u64,
    pub samples_purged: u64,
    /// Current ingest queue depth (snapshot)
    pub inbound_queue_depth: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            messages_total = %self.messages_received,
            messages_per_sec = format!("{:.1}", self.messages_per_sec),
            avg_latency_us = %self.avg_process_latency_us,
            p99_us = %self.lat_p99_us,
            samples = %self.samples_recorded,
            unknown_tags = %self.unknown_tags_dropped,
            alerts_opened = %self.alerts_opened,
            alerts_closed = %self.alerts_closed,
            engine_errors = %self.engine_errors,
            webhooks_ok = %self.webhooks_delivered,
            webhooks_failed = %self.webhooks_failed,
            webhooks_dropped = %self.webhooks_dropped,
            queue_depth = %self.inbound_queue_depth,
            "metrics"
        );
    }
}
