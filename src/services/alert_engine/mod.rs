//! Alert evaluation and session lifecycle
//!
//! The AlertEngine turns detections and liveness sweeps into alert sessions:
//! - Forbidden-sector sessions (one open per tag/device/rule, closed on move)
//! - Dwell-time sessions (message set once the configured limit is reached)
//! - Gateway offline/online transitions
//! - Stale session retirement
//!
//! All session state lives in the store; the only in-process state is the
//! per-gateway liveness cache.

mod handlers;
mod liveness;
#[cfg(test)]
mod tests;

pub use liveness::SweepReport;

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::domain::alert::{location_fields, opt, AlertEvent, AlertKind, CloseReason};
use crate::domain::types::{
    AlertRule, Device, DeviceId, LocationInfo, Person, RuleId, RuleType, SampleId, Tag, TagId,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::webhook::WebhookSender;
use crate::store::{Store, StoreResult};

/// Engine thresholds
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub offline_threshold_secs: u64,
    /// 0 disables stale-session retirement
    pub stale_session_ttl_secs: u64,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            offline_threshold_secs: config.offline_threshold_secs(),
            stale_session_ttl_secs: config.stale_session_ttl_secs(),
        }
    }
}

/// Everything a rule handler needs about one detection
pub(crate) struct Detection<'a> {
    pub device: &'a Device,
    pub tag: &'a Tag,
    pub person: Option<&'a Person>,
    pub sample_id: Option<SampleId>,
    pub location: LocationInfo,
    pub now: DateTime<Utc>,
    /// Forbidden-sector rules matched by this detection
    pub forbidden_rules: Vec<RuleId>,
}

impl Detection<'_> {
    /// Person name, else tag code, else tag MAC, else `Tag <id>`
    pub fn subject_label(&self) -> String {
        self.person
            .and_then(|p| p.full_name.clone())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.tag.label())
    }

    /// Denormalized payload shared by presence sessions
    pub fn base_payload(&self, rule: &AlertRule) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("rule_id".into(), Value::from(rule.id.0));
        payload.insert("rule_name".into(), Value::from(rule.name.clone()));
        payload.insert("group_id".into(), opt(rule.group_id.map(|g| g.0)));
        payload.insert("tag_id".into(), Value::from(self.tag.id.0));
        payload.insert("tag_mac".into(), Value::from(self.tag.mac.clone()));
        payload.insert("tag_code".into(), opt(self.tag.code.clone()));
        payload.insert("person_id".into(), opt(self.person.map(|p| p.id.0)));
        payload.insert(
            "person_full_name".into(),
            opt(self.person.and_then(|p| p.full_name.clone())),
        );
        payload.insert("device_id".into(), Value::from(self.device.id.0));
        payload.insert("device_mac".into(), Value::from(self.device.mac.clone()));
        payload.insert("device_name".into(), Value::from(self.device.label()));
        payload.extend(location_fields(&self.location));
        payload.insert("last_seen_at".into(), Value::from(timestamp(self.now)));
        payload.insert("first_sample_id".into(), opt(self.sample_id.map(|s| s.0)));
        payload.insert("last_sample_id".into(), opt(self.sample_id.map(|s| s.0)));
        payload
    }
}

/// Evaluates alert rules and owns the session lifecycle
pub struct AlertEngine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) webhooks: WebhookSender,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) settings: EngineSettings,
    /// Last known online state per gateway
    pub(crate) gateway_status: Mutex<FxHashMap<DeviceId, bool>>,
}

impl AlertEngine {
    pub fn new(
        store: Arc<dyn Store>,
        webhooks: WebhookSender,
        metrics: Arc<Metrics>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            webhooks,
            metrics,
            settings,
            gateway_status: Mutex::new(FxHashMap::default()),
        }
    }

    /// Evaluate every rule that applies to `tag` seen at `device`.
    ///
    /// Only the shared lookups (person, rules) can fail the call. A failing
    /// rule is logged and counted; the remaining rules still run.
    pub async fn on_detection(
        &self,
        device: &Device,
        tag: &Tag,
        sample_id: Option<SampleId>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        if let Err(e) = self.close_stale_sessions(now, Some(tag.id), None).await {
            self.metrics.record_engine_error();
            warn!(tag_id = %tag.id, error = %e, "stale_close_failed");
        }

        let (person, group_ids) = match tag.person_id {
            Some(person_id) => match self.store.person_with_groups(person_id).await? {
                Some(found) => (Some(found.person), found.group_ids),
                None => (None, Vec::new()),
            },
            None => (None, Vec::new()),
        };

        let rules = self.store.rules_for_detection(device.id, &group_ids).await?;
        if rules.is_empty() {
            return Ok(());
        }

        let location = match self.store.location_info(device).await {
            Ok(location) => location,
            Err(e) => {
                warn!(device_id = %device.id, error = %e, "location_lookup_failed");
                LocationInfo::default()
            }
        };

        let detection = Detection {
            device,
            tag,
            person: person.as_ref(),
            sample_id,
            location,
            now,
            forbidden_rules: rules
                .iter()
                .filter(|r| r.rule_type == RuleType::ForbiddenSector)
                .map(|r| r.id)
                .collect(),
        };

        for rule in &rules {
            let result = match rule.rule_type {
                RuleType::ForbiddenSector => self.handle_forbidden_sector(&detection, rule).await,
                RuleType::DwellTime => self.handle_dwell_time(&detection, rule).await,
            };
            if let Err(e) = result {
                self.metrics.record_engine_error();
                error!(
                    rule_id = %rule.id,
                    tag_id = %tag.id,
                    device_id = %device.id,
                    error = %e,
                    "alert_rule_failed"
                );
            }
        }
        Ok(())
    }

    /// Close presence sessions not seen for longer than the stale TTL.
    ///
    /// Sessions end at their own `last_seen_at`. Returns how many were
    /// closed by this call.
    pub async fn close_stale_sessions(
        &self,
        now: DateTime<Utc>,
        tag: Option<TagId>,
        device: Option<DeviceId>,
    ) -> StoreResult<usize> {
        let ttl = self.settings.stale_session_ttl_secs;
        if ttl == 0 {
            return Ok(0);
        }
        let cutoff = now - chrono::Duration::seconds(ttl as i64);
        let stale = self.store.stale_open_events(&AlertKind::PRESENCE, cutoff, tag, device).await?;

        let mut closed = 0;
        for event in stale {
            match self.close_session(&event, event.last_seen_at, CloseReason::StaleTtl(ttl)).await {
                Ok(Some(_)) => closed += 1,
                Ok(None) => {}
                Err(e) => {
                    self.metrics.record_engine_error();
                    warn!(alert_event_id = %event.id, error = %e, "stale_close_failed");
                }
            }
        }
        Ok(closed)
    }

    /// Compare-and-set close with the close fields merged into the payload.
    /// `None` when another writer closed the session first.
    pub(crate) async fn close_session(
        &self,
        event: &AlertEvent,
        ended_at: DateTime<Utc>,
        reason: CloseReason,
    ) -> StoreResult<Option<AlertEvent>> {
        let reason = reason.as_string();
        let mut payload = event.payload.clone();
        payload.insert("is_open".into(), Value::Bool(false));
        payload.insert("ended_at".into(), Value::from(timestamp(ended_at)));
        payload.insert("duration_seconds".into(), Value::from(event.elapsed_seconds(ended_at)));
        payload.insert("close_reason".into(), Value::from(reason.clone()));

        let Some(closed) = self.store.close_event(event.id, ended_at, payload).await? else {
            debug!(alert_event_id = %event.id, "alert_already_closed");
            return Ok(None);
        };

        self.metrics.record_alert_closed();
        info!(
            alert_event_id = %closed.id,
            event_type = %closed.kind,
            tag_id = ?closed.tag_id,
            device_id = ?closed.device_id,
            reason = %reason,
            "alert_closed"
        );
        self.webhooks.dispatch_alert(&closed);
        Ok(Some(closed))
    }

    /// Keep the newest of several open sessions for one key, closing the rest
    pub(crate) async fn settle_duplicates(
        &self,
        mut open: Vec<AlertEvent>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<AlertEvent>> {
        let newest = open.pop();
        for older in &open {
            warn!(
                alert_event_id = %older.id,
                event_type = %older.kind,
                "duplicate_open_session"
            );
            self.close_session(older, now, CloseReason::DuplicateOpenSession).await?;
        }
        Ok(newest)
    }
}

pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
