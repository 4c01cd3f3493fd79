//! Rule handlers for the AlertEngine
//!
//! Each handler owns one rule type's session semantics for a single
//! `(rule, tag, device)` key.

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{timestamp, AlertEngine, Detection};
use crate::domain::alert::{opt, AlertKind, CloseReason, EventPatch, NewAlertEvent};
use crate::domain::types::AlertRule;
use crate::store::{SessionSlot, StoreResult};

impl AlertEngine {
    /// Open (or bump) the forbidden-sector session for this key and close
    /// the tag's sessions left behind at other devices or rules
    pub(crate) async fn handle_forbidden_sector(
        &self,
        detection: &Detection<'_>,
        rule: &AlertRule,
    ) -> StoreResult<()> {
        let Detection { device, tag, now, .. } = *detection;

        let open = self.store.open_events_for_tag(AlertKind::ForbiddenSector, tag.id).await?;
        for other in open {
            let same_device = other.device_id == Some(device.id);
            let still_matched =
                other.rule_id.is_some_and(|id| detection.forbidden_rules.contains(&id));
            if same_device && still_matched {
                continue;
            }
            // the next detection retries the close; the new entry still opens
            if let Err(e) =
                self.close_session(&other, now, CloseReason::MovedToOtherDeviceOrRule).await
            {
                self.metrics.record_engine_error();
                warn!(
                    alert_event_id = %other.id,
                    tag_id = %tag.id,
                    device_id = %device.id,
                    error = %e,
                    "forbidden_sector_close_failed"
                );
            }
        }

        let mut draft = self.presence_draft(AlertKind::ForbiddenSector, detection, rule);
        draft.message = Some(format!(
            "Forbidden sector entry: {} at gateway '{}'.",
            detection.subject_label(),
            device.label()
        ));

        match self.store.open_or_get_session(draft).await? {
            SessionSlot::Created(event) => {
                self.metrics.record_alert_opened();
                info!(
                    alert_event_id = %event.id,
                    rule_id = %rule.id,
                    tag_id = %tag.id,
                    device_id = %device.id,
                    "forbidden_sector_opened"
                );
                self.webhooks.dispatch_alert(&event);
            }
            SessionSlot::Existing(events) => {
                let Some(current) = self.settle_duplicates(events, now).await? else {
                    return Ok(());
                };
                let mut payload = current.payload.clone();
                payload.insert("last_seen_at".into(), Value::from(timestamp(now)));
                payload.insert("last_sample_id".into(), opt(detection.sample_id.map(|s| s.0)));

                let patch = EventPatch {
                    last_seen_at: Some(now),
                    payload: Some(payload),
                    last_sample_id: detection.sample_id,
                    ..Default::default()
                };
                if self.store.update_open_event(current.id, patch).await?.is_some() {
                    self.metrics.record_alert_updated();
                    debug!(alert_event_id = %current.id, tag_id = %tag.id, "forbidden_sector_bumped");
                }
            }
        }
        Ok(())
    }

    /// Track how long the tag has stayed at the device; every update is
    /// dispatched, and the message appears once the limit is reached
    pub(crate) async fn handle_dwell_time(
        &self,
        detection: &Detection<'_>,
        rule: &AlertRule,
    ) -> StoreResult<()> {
        let Detection { device, tag, now, .. } = *detection;

        let mut draft = self.presence_draft(AlertKind::DwellTime, detection, rule);
        draft.payload.insert("dwell_seconds".into(), Value::from(0.0));
        draft.payload.insert("max_dwell_seconds".into(), opt(rule.max_dwell_seconds));

        let current = match self.store.open_or_get_session(draft).await? {
            SessionSlot::Created(event) => {
                self.metrics.record_alert_opened();
                info!(
                    alert_event_id = %event.id,
                    rule_id = %rule.id,
                    tag_id = %tag.id,
                    device_id = %device.id,
                    "dwell_session_opened"
                );
                self.webhooks.dispatch_alert(&event);
                return Ok(());
            }
            SessionSlot::Existing(events) => match self.settle_duplicates(events, now).await? {
                Some(current) => current,
                None => return Ok(()),
            },
        };

        let dwell_seconds = current.elapsed_seconds(now);
        let message = rule
            .max_dwell_seconds
            .filter(|max| dwell_seconds >= *max as f64)
            .map(|max| {
                format!(
                    "Dwell time exceeded: {} at gateway '{}' for {:.0}s (limit {}s).",
                    detection.subject_label(),
                    device.label(),
                    dwell_seconds,
                    max
                )
            });

        let mut payload = current.payload.clone();
        payload.insert("last_seen_at".into(), Value::from(timestamp(now)));
        payload.insert("last_sample_id".into(), opt(detection.sample_id.map(|s| s.0)));
        payload.insert("dwell_seconds".into(), Value::from(dwell_seconds));
        payload.insert("dwell_exceeded".into(), Value::Bool(message.is_some()));

        let patch = EventPatch {
            last_seen_at: Some(now),
            message: Some(message),
            payload: Some(payload),
            last_sample_id: detection.sample_id,
        };
        if let Some(updated) = self.store.update_open_event(current.id, patch).await? {
            self.metrics.record_alert_updated();
            debug!(
                alert_event_id = %updated.id,
                dwell_seconds = %dwell_seconds,
                "dwell_session_updated"
            );
            self.webhooks.dispatch_alert(&updated);
        }
        Ok(())
    }

    fn presence_draft(
        &self,
        kind: AlertKind,
        detection: &Detection<'_>,
        rule: &AlertRule,
    ) -> NewAlertEvent {
        let mut draft = NewAlertEvent::open(kind, detection.now).with_location(&detection.location);
        draft.rule_id = Some(rule.id);
        draft.tag_id = Some(detection.tag.id);
        draft.device_id = Some(detection.device.id);
        draft.person_id = detection.person.map(|p| p.id).or(detection.tag.person_id);
        draft.group_id = rule.group_id;
        draft.payload = detection.base_payload(rule);
        draft.first_sample_id = detection.sample_id;
        draft.last_sample_id = detection.sample_id;
        draft
    }
}
