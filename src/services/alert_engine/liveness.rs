//! Gateway liveness sweep
//!
//! A gateway is online while its last heartbeat is within the offline
//! threshold. Transitions are detected against a per-process cache, so the
//! first sweep after start only seeds it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{timestamp, AlertEngine};
use crate::domain::alert::{
    location_fields, opt, AlertKind, CloseReason, EventPatch, NewAlertEvent, SessionKey,
};
use crate::domain::types::{AlertEventId, Device, LocationInfo};
use crate::store::{SessionSlot, StoreResult};

/// What one sweep did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub gateways: usize,
    pub went_offline: usize,
    pub came_online: usize,
    pub stale_closed: usize,
    pub failures: usize,
}

impl AlertEngine {
    /// Retire stale presence sessions, then evaluate every gateway.
    ///
    /// Only the gateway listing can fail the sweep; a failing gateway is
    /// logged, its cache entry restored, and the next one evaluated.
    pub async fn on_liveness_sweep(&self, now: DateTime<Utc>) -> StoreResult<SweepReport> {
        let mut report = SweepReport::default();

        match self.close_stale_sessions(now, None, None).await {
            Ok(closed) => report.stale_closed = closed,
            Err(e) => {
                self.metrics.record_engine_error();
                warn!(error = %e, "stale_sweep_failed");
            }
        }

        let gateways = self.store.list_gateways().await?;
        report.gateways = gateways.len();
        let threshold = chrono::Duration::seconds(self.settings.offline_threshold_secs as i64);

        for gateway in &gateways {
            let online = gateway.last_seen_at.is_some_and(|seen| now - seen <= threshold);
            let previous = self.gateway_status.lock().insert(gateway.id, online);

            let result = match (previous, online) {
                (None, _) => {
                    debug!(device_id = %gateway.id, online = %online, "gateway_state_seeded");
                    Ok(())
                }
                (Some(true), false) => self.gateway_went_offline(gateway, now).await.map(|opened| {
                    if opened {
                        report.went_offline += 1;
                    }
                }),
                (Some(false), false) => self.gateway_still_offline(gateway, now).await,
                (Some(false), true) => self.gateway_came_online(gateway, now).await.map(|closed| {
                    if closed {
                        report.came_online += 1;
                    }
                }),
                (Some(true), true) => Ok(()),
            };

            if let Err(e) = result {
                report.failures += 1;
                self.metrics.record_engine_error();
                // retry the transition on the next sweep
                let mut cache = self.gateway_status.lock();
                match previous {
                    Some(state) => cache.insert(gateway.id, state),
                    None => cache.remove(&gateway.id),
                };
                warn!(device_id = %gateway.id, error = %e, "gateway_liveness_failed");
            }
        }
        Ok(report)
    }

    /// Sweep every `interval` until shutdown; an in-flight sweep finishes
    pub async fn run_liveness(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = %interval.as_secs(), "liveness_sweep_started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.on_liveness_sweep(Utc::now()).await {
                        Ok(report) => debug!(
                            gateways = %report.gateways,
                            went_offline = %report.went_offline,
                            came_online = %report.came_online,
                            stale_closed = %report.stale_closed,
                            "liveness_sweep_done"
                        ),
                        Err(e) => {
                            self.metrics.record_engine_error();
                            warn!(error = %e, "liveness_sweep_failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("liveness_sweep_shutdown");
                        break;
                    }
                }
            }
        }
    }

    async fn gateway_went_offline(&self, gateway: &Device, now: DateTime<Utc>) -> StoreResult<bool> {
        let location = self.location_or_default(gateway).await;

        let mut draft = NewAlertEvent::open(AlertKind::GatewayOffline, now).with_location(&location);
        draft.device_id = Some(gateway.id);
        draft.message = Some(format!("Gateway '{}' went OFFLINE.", gateway.label()));
        draft.payload = self.offline_payload(gateway, &location, now);

        match self.store.open_or_get_session(draft).await? {
            SessionSlot::Created(event) => {
                self.metrics.record_gateway_transition(false);
                self.metrics.record_alert_opened();
                warn!(
                    alert_event_id = %event.id,
                    device_id = %gateway.id,
                    last_seen_at = ?gateway.last_seen_at,
                    "gateway_offline"
                );
                self.webhooks.dispatch_alert(&event);
                Ok(true)
            }
            SessionSlot::Existing(events) => {
                // another sweeper got there first
                if let Some(current) = self.settle_duplicates(events, now).await? {
                    self.refresh_offline(&current.payload, current.id, gateway, now).await?;
                }
                Ok(false)
            }
        }
    }

    async fn gateway_still_offline(&self, gateway: &Device, now: DateTime<Utc>) -> StoreResult<()> {
        let open = self.store.open_events(&SessionKey::gateway_offline(gateway.id)).await?;
        if let Some(current) = self.settle_duplicates(open, now).await? {
            self.refresh_offline(&current.payload, current.id, gateway, now).await?;
        }
        Ok(())
    }

    async fn gateway_came_online(&self, gateway: &Device, now: DateTime<Utc>) -> StoreResult<bool> {
        let open = self.store.open_events(&SessionKey::gateway_offline(gateway.id)).await?;
        let Some(offline) = self.settle_duplicates(open, now).await? else {
            debug!(device_id = %gateway.id, "gateway_online_without_offline_session");
            return Ok(false);
        };

        let Some(closed) = self.close_session(&offline, now, CloseReason::GatewayBackOnline).await? else {
            return Ok(false);
        };

        let location = self.location_or_default(gateway).await;
        let mut online = NewAlertEvent::open(AlertKind::GatewayOnline, now).with_location(&location);
        online.device_id = Some(gateway.id);
        online.is_open = false;
        online.ended_at = Some(now);
        online.message = Some(format!("Gateway '{}' is back ONLINE.", gateway.label()));

        let mut payload = device_fields(gateway);
        payload.extend(location_fields(&location));
        payload.insert("offline_alert_event_id".into(), Value::from(closed.id.0));
        payload.insert("offline_started_at".into(), Value::from(timestamp(closed.started_at)));
        payload.insert("offline_seconds".into(), Value::from(closed.elapsed_seconds(now)));
        payload.insert("is_open".into(), Value::Bool(false));
        payload.insert("ended_at".into(), Value::from(timestamp(now)));
        online.payload = payload;

        let event = self.store.insert_event(online).await?;
        self.metrics.record_gateway_transition(true);
        info!(
            alert_event_id = %event.id,
            device_id = %gateway.id,
            offline_seconds = %closed.elapsed_seconds(now),
            "gateway_online"
        );
        self.webhooks.dispatch_alert(&event);
        Ok(true)
    }

    async fn refresh_offline(
        &self,
        current: &Map<String, Value>,
        id: AlertEventId,
        gateway: &Device,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut payload = current.clone();
        payload.insert("offline_seconds".into(), opt(offline_seconds(gateway, now)));
        payload.insert("checked_at".into(), Value::from(timestamp(now)));
        let patch = EventPatch { last_seen_at: Some(now), payload: Some(payload), ..Default::default() };
        if self.store.update_open_event(id, patch).await?.is_some() {
            self.metrics.record_alert_updated();
        }
        Ok(())
    }

    fn offline_payload(
        &self,
        gateway: &Device,
        location: &LocationInfo,
        now: DateTime<Utc>,
    ) -> Map<String, Value> {
        let mut payload = device_fields(gateway);
        payload.extend(location_fields(location));
        payload.insert("offline_seconds".into(), opt(offline_seconds(gateway, now)));
        payload.insert(
            "threshold_seconds".into(),
            Value::from(self.settings.offline_threshold_secs),
        );
        payload.insert("checked_at".into(), Value::from(timestamp(now)));
        payload
    }

    async fn location_or_default(&self, gateway: &Device) -> LocationInfo {
        match self.store.location_info(gateway).await {
            Ok(location) => location,
            Err(e) => {
                warn!(device_id = %gateway.id, error = %e, "location_lookup_failed");
                LocationInfo::default()
            }
        }
    }
}

fn device_fields(gateway: &Device) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("device_id".into(), Value::from(gateway.id.0));
    out.insert("device_mac".into(), Value::from(gateway.mac.clone()));
    out.insert("device_name".into(), Value::from(gateway.label()));
    out.insert("last_seen_at".into(), opt(gateway.last_seen_at.map(timestamp)));
    out
}

/// Seconds since the last heartbeat; `None` for a gateway never heard from
fn offline_seconds(gateway: &Device, now: DateTime<Utc>) -> Option<i64> {
    gateway.last_seen_at.map(|seen| (now - seen).num_seconds().max(0))
}
