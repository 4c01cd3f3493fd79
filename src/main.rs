//! BLE presence engine
//!
//! Consumes BLE gateway traffic from MQTT, registers gateways, records tag
//! detections, runs presence alert rules and delivers signed webhooks.
//!
//! Module structure:
//! - `domain/` - Core types (devices, tags, rules, alert sessions, MACs)
//! - `store/` - Persistence trait and the in-process store
//! - `io/` - External interfaces (MQTT, payload decoding, webhooks, Prometheus)
//! - `services/` - Business logic (ingest, registry, alert engine, rollup)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use presence_engine::infra::{Config, Metrics};
use presence_engine::io::{start_mqtt_client, webhook_channel, WebhookDispatcher, WebhookWorker};
use presence_engine::services::{
    AlertEngine, EngineSettings, GatewayRegistry, Ingestor, Sessionizer,
};
use presence_engine::store::{MemoryStore, Store, TimeoutStore};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// BLE presence ingestion and alerting engine
#[derive(Parser, Debug)]
#[command(name = "presence-engine", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Default: INFO, use RUST_LOG=debug for per-message visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .init();
    }

    info!(git_hash = env!("GIT_HASH"), "presence-engine starting");

    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        mqtt_topic = %config.mqtt_topic(),
        offline_threshold_secs = %config.offline_threshold_secs(),
        stale_session_ttl_secs = %config.stale_session_ttl_secs(),
        rollup_enabled = %config.rollup_enabled(),
        seed_file = ?config.seed_file(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let memory = match config.seed_file() {
        Some(path) => MemoryStore::load_seed_file(path)?,
        None => MemoryStore::new(),
    };
    let store: Arc<dyn Store> =
        Arc::new(TimeoutStore::new(Arc::new(memory), config.storage_timeout()));

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Webhook dispatch worker
    let dispatcher =
        Arc::new(WebhookDispatcher::new(store.clone(), config.webhook_timeout(), metrics.clone())?);
    let (webhooks, webhook_rx) = webhook_channel(config.webhook_queue_size(), metrics.clone());
    let webhook_worker = WebhookWorker::new(dispatcher, webhook_rx);
    let webhook_shutdown = shutdown_rx.clone();
    let webhook_handle = tokio::spawn(async move {
        webhook_worker.run(webhook_shutdown).await;
    });

    let engine = Arc::new(AlertEngine::new(
        store.clone(),
        webhooks.clone(),
        metrics.clone(),
        EngineSettings::from_config(&config),
    ));
    let registry = GatewayRegistry::new(store.clone(), metrics.clone()).with_webhooks(webhooks);

    // Ingest queue (bounded for backpressure)
    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_size());

    // Start MQTT client
    let mqtt_config = config.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        start_mqtt_client(&mqtt_config, inbound_tx, mqtt_metrics, mqtt_shutdown).await;
    });

    // Gateway liveness sweep
    let liveness_engine = engine.clone();
    let liveness_interval = config.liveness_interval();
    let liveness_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        liveness_engine.run_liveness(liveness_interval, liveness_shutdown).await;
    });

    // Presence rollup
    if config.rollup_enabled() {
        let sessionizer = Sessionizer::new(store.clone(), metrics.clone(), &config);
        let rollup_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            sessionizer.run(rollup_shutdown).await;
        });
    }

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = presence_engine::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Run ingest - consumes messages until shutdown or the queue closes
    let ingestor =
        Ingestor::new(config.mqtt_topic(), store.clone(), registry, engine, metrics.clone());
    ingestor.run(inbound_rx, shutdown_rx).await;

    // let queued webhooks go out before exit
    let _ = webhook_handle.await;

    info!("presence-engine shutdown complete");
    Ok(())
}
