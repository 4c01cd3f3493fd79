//! Alert event (session) model
//!
//! An alert event is a long-lived session: opened when a condition starts,
//! bumped while it persists, closed when it ends. At most one session per
//! [`SessionKey`] is open at any time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::{
    AlertEventId, BuildingId, DeviceId, FloorId, FloorPlanId, GroupId, LocationInfo, PersonId,
    RuleId, RuleType, SampleId, TagId,
};

/// Alert and domain event classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    ForbiddenSector,
    DwellTime,
    GatewayOffline,
    GatewayOnline,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::ForbiddenSector => "FORBIDDEN_SECTOR",
            AlertKind::DwellTime => "DWELL_TIME",
            AlertKind::GatewayOffline => "GATEWAY_OFFLINE",
            AlertKind::GatewayOnline => "GATEWAY_ONLINE",
        }
    }

    /// Session kinds retired by the stale-session sweep
    pub const PRESENCE: [AlertKind; 2] = [AlertKind::ForbiddenSector, AlertKind::DwellTime];
}

impl From<RuleType> for AlertKind {
    fn from(rule_type: RuleType) -> Self {
        match rule_type {
            RuleType::ForbiddenSector => AlertKind::ForbiddenSector,
            RuleType::DwellTime => AlertKind::DwellTime,
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a session: one open session per key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub kind: AlertKind,
    pub rule_id: Option<RuleId>,
    pub tag_id: Option<TagId>,
    pub device_id: Option<DeviceId>,
}

impl SessionKey {
    pub fn presence(kind: AlertKind, rule_id: RuleId, tag_id: TagId, device_id: DeviceId) -> Self {
        Self { kind, rule_id: Some(rule_id), tag_id: Some(tag_id), device_id: Some(device_id) }
    }

    pub fn gateway_offline(device_id: DeviceId) -> Self {
        Self { kind: AlertKind::GatewayOffline, rule_id: None, tag_id: None, device_id: Some(device_id) }
    }
}

/// Why a session was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    MovedToOtherDeviceOrRule,
    StaleTtl(u64),
    GatewayBackOnline,
    DuplicateOpenSession,
}

impl CloseReason {
    pub fn as_string(&self) -> String {
        match self {
            CloseReason::MovedToOtherDeviceOrRule => "moved_to_other_device_or_rule".to_string(),
            CloseReason::StaleTtl(ttl) => format!("stale_ttl_{ttl}s"),
            CloseReason::GatewayBackOnline => "gateway_back_online".to_string(),
            CloseReason::DuplicateOpenSession => "duplicate_open_session".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub id: AlertEventId,
    pub rule_id: Option<RuleId>,
    pub kind: AlertKind,
    pub person_id: Option<PersonId>,
    pub tag_id: Option<TagId>,
    pub device_id: Option<DeviceId>,
    pub group_id: Option<GroupId>,
    pub building_id: Option<BuildingId>,
    pub floor_id: Option<FloorId>,
    pub floor_plan_id: Option<FloorPlanId>,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_open: bool,
    pub message: Option<String>,
    pub payload: Map<String, Value>,
    pub first_sample_id: Option<SampleId>,
    pub last_sample_id: Option<SampleId>,
}

impl AlertEvent {
    pub fn key(&self) -> SessionKey {
        SessionKey {
            kind: self.kind,
            rule_id: self.rule_id,
            tag_id: self.tag_id,
            device_id: self.device_id,
        }
    }

    /// Seconds between start and `until`, never negative
    pub fn elapsed_seconds(&self, until: DateTime<Utc>) -> f64 {
        ((until - self.started_at).num_milliseconds() as f64 / 1000.0).max(0.0)
    }

    /// Body handed to webhook subscribers: stored payload overlaid with the
    /// event's own columns
    pub fn webhook_payload(&self) -> Value {
        let mut out = self.payload.clone();
        out.insert("alert_event_id".into(), Value::from(self.id.0));
        out.insert("event_type".into(), Value::from(self.kind.as_str()));
        out.insert("message".into(), opt(self.message.clone()));
        out.insert("rule_id".into(), opt(self.rule_id.map(|v| v.0)));
        out.insert("device_id".into(), opt(self.device_id.map(|v| v.0)));
        out.insert("tag_id".into(), opt(self.tag_id.map(|v| v.0)));
        out.insert("person_id".into(), opt(self.person_id.map(|v| v.0)));
        out.insert("group_id".into(), opt(self.group_id.map(|v| v.0)));
        out.insert("building_id".into(), opt(self.building_id.map(|v| v.0)));
        out.insert("floor_id".into(), opt(self.floor_id.map(|v| v.0)));
        out.insert("floor_plan_id".into(), opt(self.floor_plan_id.map(|v| v.0)));
        out.insert("started_at".into(), Value::from(self.started_at.to_rfc3339()));
        out.insert("last_seen_at".into(), Value::from(self.last_seen_at.to_rfc3339()));
        out.insert("ended_at".into(), opt(self.ended_at.map(|t| t.to_rfc3339())));
        out.insert("is_open".into(), Value::from(self.is_open));
        Value::Object(out)
    }
}

/// Insert form of an alert event
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlertEvent {
    pub rule_id: Option<RuleId>,
    pub kind: AlertKind,
    pub person_id: Option<PersonId>,
    pub tag_id: Option<TagId>,
    pub device_id: Option<DeviceId>,
    pub group_id: Option<GroupId>,
    pub building_id: Option<BuildingId>,
    pub floor_id: Option<FloorId>,
    pub floor_plan_id: Option<FloorPlanId>,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_open: bool,
    pub message: Option<String>,
    pub payload: Map<String, Value>,
    pub first_sample_id: Option<SampleId>,
    pub last_sample_id: Option<SampleId>,
}

impl NewAlertEvent {
    /// Open session with no subject columns filled in
    pub fn open(kind: AlertKind, at: DateTime<Utc>) -> Self {
        Self {
            rule_id: None,
            kind,
            person_id: None,
            tag_id: None,
            device_id: None,
            group_id: None,
            building_id: None,
            floor_id: None,
            floor_plan_id: None,
            started_at: at,
            last_seen_at: at,
            ended_at: None,
            is_open: true,
            message: None,
            payload: Map::new(),
            first_sample_id: None,
            last_sample_id: None,
        }
    }

    pub fn with_location(mut self, location: &LocationInfo) -> Self {
        self.building_id = location.building_id;
        self.floor_id = location.floor_id;
        self.floor_plan_id = location.floor_plan_id;
        self
    }

    pub fn key(&self) -> SessionKey {
        SessionKey {
            kind: self.kind,
            rule_id: self.rule_id,
            tag_id: self.tag_id,
            device_id: self.device_id,
        }
    }
}

/// Partial update applied to an open session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPatch {
    pub last_seen_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears the message
    pub message: Option<Option<String>>,
    pub payload: Option<Map<String, Value>>,
    pub last_sample_id: Option<SampleId>,
}

/// Location id/name pairs copied into session payloads
pub fn location_fields(location: &LocationInfo) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("floor_plan_id".into(), opt(location.floor_plan_id.map(|v| v.0)));
    out.insert("floor_plan_name".into(), opt(location.floor_plan_name.clone()));
    out.insert("floor_id".into(), opt(location.floor_id.map(|v| v.0)));
    out.insert("floor_name".into(), opt(location.floor_name.clone()));
    out.insert("building_id".into(), opt(location.building_id.map(|v| v.0)));
    out.insert("building_name".into(), opt(location.building_name.clone()));
    out
}

/// `None` becomes JSON null
pub fn opt<T: Into<Value>>(value: Option<T>) -> Value {
    value.map_or(Value::Null, Into::into)
}
