//! Shared entity types for the presence engine
//!
//! These mirror the rows owned by the CRUD layer. The engine reads most of
//! them and only mutates devices (registry), samples (recorder) and alert
//! events (alert engine).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Declares an integer newtype id with `Display`
macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Device (gateway) primary key
    DeviceId
);
id_type!(
    /// Tag primary key
    TagId
);
id_type!(PersonId);
id_type!(GroupId);
id_type!(RuleId);
id_type!(AlertEventId);
id_type!(
    /// Raw detection sample primary key
    SampleId
);
id_type!(BuildingId);
id_type!(FloorId);
id_type!(FloorPlanId);
id_type!(SubscriptionId);

/// Device classification. The engine only ever creates gateways.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceKind {
    #[default]
    BleGateway,
    Camera,
    #[serde(other)]
    Other,
}

impl DeviceKind {
    pub fn is_gateway(&self) -> bool {
        matches!(self, DeviceKind::BleGateway)
    }
}

/// A fixed receiver (gateway) or other device known to the system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub mac: String,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub kind: DeviceKind,
    #[serde(default)]
    pub building_id: Option<BuildingId>,
    #[serde(default)]
    pub floor_id: Option<FloorId>,
    #[serde(default)]
    pub floor_plan_id: Option<FloorPlanId>,
    #[serde(default)]
    pub pos_x: Option<f64>,
    #[serde(default)]
    pub pos_y: Option<f64>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Device {
    /// Human label used in alert messages
    pub fn label(&self) -> String {
        if !self.name.trim().is_empty() {
            self.name.clone()
        } else if !self.mac.is_empty() {
            self.mac.clone()
        } else {
            format!("Device {}", self.id)
        }
    }
}

/// Insert form for an auto-registered gateway
#[derive(Debug, Clone, PartialEq)]
pub struct NewDevice {
    pub mac: String,
    pub name: String,
    pub code: Option<String>,
    pub kind: DeviceKind,
    pub building_id: Option<BuildingId>,
    pub floor_id: Option<FloorId>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// A wearable or asset beacon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub mac: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub person_id: Option<PersonId>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Tag {
    /// Label used when the tag has no owning person
    pub fn label(&self) -> String {
        self.code
            .clone()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| Some(self.mac.clone()).filter(|m| !m.is_empty()))
            .unwrap_or_else(|| format!("Tag {}", self.id))
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: PersonId,
    #[serde(default)]
    pub full_name: Option<String>,
}

/// Membership row linking a person to a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub person_id: PersonId,
    pub group_id: GroupId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Building {
    pub id: BuildingId,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Floor {
    pub id: FloorId,
    pub building_id: BuildingId,
    pub name: String,
    /// Numeric level (0 = ground, negative = basement)
    #[serde(default)]
    pub level: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloorPlan {
    pub id: FloorPlanId,
    #[serde(default)]
    pub floor_id: Option<FloorId>,
    pub name: String,
}

/// Denormalized location names for a device
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocationInfo {
    pub floor_plan_id: Option<FloorPlanId>,
    pub floor_plan_name: Option<String>,
    pub floor_id: Option<FloorId>,
    pub floor_name: Option<String>,
    pub building_id: Option<BuildingId>,
    pub building_name: Option<String>,
}

/// Rule types evaluated on the detection path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    ForbiddenSector,
    DwellTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: RuleId,
    pub name: String,
    pub rule_type: RuleType,
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub max_dwell_seconds: Option<i64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl AlertRule {
    /// Whether this rule is evaluated for a detection at `device_id` by a
    /// person belonging to `group_ids`.
    ///
    /// Rules without a device are never matched; ungrouped rules match any
    /// person, grouped rules only members of that group.
    pub fn applies_to(&self, device_id: DeviceId, group_ids: &[GroupId]) -> bool {
        self.is_active
            && self.device_id == Some(device_id)
            && self.group_id.map_or(true, |g| group_ids.contains(&g))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: SubscriptionId,
    pub url: String,
    #[serde(default)]
    pub secret_token: Option<String>,
    /// `None` subscribes to every event type
    #[serde(default)]
    pub event_type_filter: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl WebhookSubscription {
    pub fn accepts(&self, event_type: &str) -> bool {
        self.is_active && self.event_type_filter.as_deref().map_or(true, |f| f == event_type)
    }
}

/// Append-only raw detection row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionSample {
    pub id: SampleId,
    pub device_id: DeviceId,
    pub tag_id: TagId,
    pub rssi: Option<i32>,
    pub captured_at: DateTime<Utc>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSample {
    pub device_id: DeviceId,
    pub tag_id: TagId,
    pub rssi: Option<i32>,
    pub captured_at: DateTime<Utc>,
    pub raw: serde_json::Value,
}

/// Contiguous stay of one tag at one device, derived from samples
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceSession {
    pub tag_id: TagId,
    pub device_id: DeviceId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub samples_count: u32,
}

/// Move of a tag between two consecutive sessions on different devices
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceTransition {
    pub tag_id: TagId,
    pub from_device_id: DeviceId,
    pub to_device_id: DeviceId,
    pub transition_start_at: DateTime<Utc>,
    pub transition_end_at: DateTime<Utc>,
    pub transition_seconds: i64,
}

/// Per (tag, device, day) aggregate of presence sessions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyUsage {
    pub tag_id: TagId,
    pub device_id: DeviceId,
    pub day: NaiveDate,
    pub total_dwell_seconds: i64,
    pub sessions_count: u32,
    pub samples_count: u32,
}
