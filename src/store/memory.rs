//! In-process `Store` implementation
//!
//! One `RwLock` guards every table, so each trait call is a single critical
//! section: find-or-create and compare-and-set hold the write lock for the
//! whole check and mutation.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{PersonWithGroups, SessionSlot, Store, StoreError, StoreResult};
use crate::domain::alert::{AlertEvent, AlertKind, EventPatch, NewAlertEvent, SessionKey};
use crate::domain::mac;
use crate::domain::types::{
    AlertEventId, AlertRule, Building, BuildingId, DailyUsage, DetectionSample, Device, DeviceId,
    DeviceKind, Floor, FloorId, FloorPlan, FloorPlanId, GroupId, GroupMembership, LocationInfo,
    NewDevice, NewSample, Person, PersonId, PresenceSession, PresenceTransition, SampleId,
    SubscriptionId, Tag, TagId, WebhookSubscription,
};

/// Catalog rows loaded at startup (JSON)
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub buildings: Vec<Building>,
    pub floors: Vec<Floor>,
    pub floor_plans: Vec<FloorPlan>,
    pub people: Vec<Person>,
    pub group_memberships: Vec<GroupMembership>,
    pub tags: Vec<Tag>,
    pub devices: Vec<Device>,
    pub rules: Vec<AlertRule>,
    pub webhooks: Vec<WebhookSubscription>,
}

#[derive(Default)]
struct Tables {
    devices: BTreeMap<DeviceId, Device>,
    /// canonical MAC -> device, the unique index
    device_macs: FxHashMap<String, DeviceId>,
    buildings: BTreeMap<BuildingId, Building>,
    floors: BTreeMap<FloorId, Floor>,
    floor_plans: BTreeMap<FloorPlanId, FloorPlan>,
    people: BTreeMap<PersonId, Person>,
    memberships: Vec<GroupMembership>,
    tags: BTreeMap<TagId, Tag>,
    rules: Vec<AlertRule>,
    subscriptions: Vec<WebhookSubscription>,
    events: BTreeMap<AlertEventId, AlertEvent>,
    samples: BTreeMap<SampleId, DetectionSample>,
    presence_sessions: BTreeMap<(TagId, DeviceId, DateTime<Utc>), PresenceSession>,
    transitions: BTreeMap<(TagId, DateTime<Utc>, DateTime<Utc>), PresenceTransition>,
    daily_usage: BTreeMap<(TagId, DeviceId, NaiveDate), DailyUsage>,
    next_device_id: i64,
    next_event_id: i64,
    next_sample_id: i64,
}

impl Tables {
    fn put_device(&mut self, device: Device) -> StoreResult<()> {
        if let Some(canonical) = mac::normalize(&device.mac) {
            if self.device_macs.contains_key(&canonical) {
                return Err(StoreError::UniqueViolation(format!("device mac {canonical}")));
            }
            self.device_macs.insert(canonical, device.id);
        }
        self.next_device_id = self.next_device_id.max(device.id.0);
        self.devices.insert(device.id, device);
        Ok(())
    }

    fn insert_event(&mut self, draft: NewAlertEvent) -> AlertEvent {
        self.next_event_id += 1;
        let event = AlertEvent {
            id: AlertEventId(self.next_event_id),
            rule_id: draft.rule_id,
            kind: draft.kind,
            person_id: draft.person_id,
            tag_id: draft.tag_id,
            device_id: draft.device_id,
            group_id: draft.group_id,
            building_id: draft.building_id,
            floor_id: draft.floor_id,
            floor_plan_id: draft.floor_plan_id,
            started_at: draft.started_at,
            last_seen_at: draft.last_seen_at,
            ended_at: draft.ended_at,
            is_open: draft.is_open,
            message: draft.message,
            payload: draft.payload,
            first_sample_id: draft.first_sample_id,
            last_sample_id: draft.last_sample_id,
        };
        self.events.insert(event.id, event.clone());
        event
    }

    fn open_events(&self, key: &SessionKey) -> Vec<AlertEvent> {
        self.events.values().filter(|e| e.is_open && e.key() == *key).cloned().collect()
    }

    fn event_mut(&mut self, id: AlertEventId) -> StoreResult<&mut AlertEvent> {
        self.events.get_mut(&id).ok_or_else(|| StoreError::NotFound(format!("alert event {id}")))
    }
}

/// First row whose stored MAC equals a candidate (in candidate order), else
/// the first row with the same canonical MAC
fn match_mac<'a, T: 'a>(
    rows: impl Iterator<Item = &'a T> + Clone,
    mac_of: impl Fn(&T) -> &str,
    candidates: &[String],
) -> Option<&'a T> {
    for candidate in candidates {
        if let Some(row) = rows.clone().find(|r| mac_of(r) == candidate.as_str()) {
            return Some(row);
        }
    }
    let canonical = candidates.iter().find_map(|c| mac::normalize(c))?;
    rows.clone().find(|r| mac::normalize(mac_of(r)).as_deref() == Some(canonical.as_str()))
}

/// Every table lives in process memory for the life of the store.
///
/// Only raw samples are ever removed (`purge_samples_before`). Alert events,
/// presence sessions, transitions and daily usage rows are never pruned, so
/// memory grows with the number of sessions opened. Long-running
/// deployments need a database-backed `Store`.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: Seed) -> StoreResult<Self> {
        let store = Self::new();
        {
            let mut t = store.tables.write();
            for b in seed.buildings {
                t.buildings.insert(b.id, b);
            }
            for f in seed.floors {
                t.floors.insert(f.id, f);
            }
            for p in seed.floor_plans {
                t.floor_plans.insert(p.id, p);
            }
            for p in seed.people {
                t.people.insert(p.id, p);
            }
            t.memberships = seed.group_memberships;
            for tag in seed.tags {
                t.tags.insert(tag.id, tag);
            }
            for device in seed.devices {
                t.put_device(device)?;
            }
            t.rules = seed.rules;
            t.subscriptions = seed.webhooks;
        }
        Ok(store)
    }

    /// Load a JSON seed file
    pub fn load_seed_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file {}", path.display()))?;
        let seed: Seed = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse seed file {}", path.display()))?;
        Self::from_seed(seed).with_context(|| format!("Invalid seed file {}", path.display()))
    }

    pub fn add_building(&self, building: Building) {
        self.tables.write().buildings.insert(building.id, building);
    }

    pub fn add_floor(&self, floor: Floor) {
        self.tables.write().floors.insert(floor.id, floor);
    }

    pub fn add_floor_plan(&self, plan: FloorPlan) {
        self.tables.write().floor_plans.insert(plan.id, plan);
    }

    pub fn add_person(&self, person: Person, groups: &[GroupId]) {
        let mut t = self.tables.write();
        for &group_id in groups {
            t.memberships.push(GroupMembership { person_id: person.id, group_id });
        }
        t.people.insert(person.id, person);
    }

    pub fn add_tag(&self, tag: Tag) {
        self.tables.write().tags.insert(tag.id, tag);
    }

    pub fn add_device(&self, device: Device) -> StoreResult<()> {
        self.tables.write().put_device(device)
    }

    pub fn add_rule(&self, rule: AlertRule) {
        self.tables.write().rules.push(rule);
    }

    pub fn add_subscription(&self, subscription: WebhookSubscription) {
        self.tables.write().subscriptions.push(subscription);
    }

    /// Overwrite a device's heartbeat time (may move it backwards)
    pub fn set_last_seen(&self, id: DeviceId, seen_at: Option<DateTime<Utc>>) {
        if let Some(device) = self.tables.write().devices.get_mut(&id) {
            device.last_seen_at = seen_at;
        }
    }

    pub fn devices(&self) -> Vec<Device> {
        self.tables.read().devices.values().cloned().collect()
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.tables.read().events.values().cloned().collect()
    }

    pub fn samples(&self) -> Vec<DetectionSample> {
        self.tables.read().samples.values().cloned().collect()
    }

    pub fn presence_sessions(&self) -> Vec<PresenceSession> {
        self.tables.read().presence_sessions.values().cloned().collect()
    }

    pub fn transitions(&self) -> Vec<PresenceTransition> {
        self.tables.read().transitions.values().cloned().collect()
    }

    pub fn daily_usage(&self) -> Vec<DailyUsage> {
        self.tables.read().daily_usage.values().cloned().collect()
    }

    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.tables.read().subscriptions.iter().map(|s| s.id).collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_device_by_mac(&self, candidates: &[String]) -> StoreResult<Option<Device>> {
        let t = self.tables.read();
        Ok(match_mac(t.devices.values(), |d| d.mac.as_str(), candidates).cloned())
    }

    async fn insert_device(&self, device: NewDevice) -> StoreResult<Device> {
        let mut t = self.tables.write();
        let canonical = mac::normalize(&device.mac)
            .ok_or_else(|| StoreError::InvalidInput(format!("device mac {:?}", device.mac)))?;
        if t.device_macs.contains_key(&canonical) {
            return Err(StoreError::UniqueViolation(format!("device mac {canonical}")));
        }
        let row = Device {
            id: DeviceId(t.next_device_id + 1),
            mac: device.mac,
            name: device.name,
            code: device.code,
            kind: device.kind,
            building_id: device.building_id,
            floor_id: device.floor_id,
            floor_plan_id: None,
            pos_x: None,
            pos_y: None,
            last_seen_at: device.last_seen_at,
        };
        t.put_device(row.clone())?;
        Ok(row)
    }

    async fn set_device_kind(&self, id: DeviceId, kind: DeviceKind) -> StoreResult<()> {
        let mut t = self.tables.write();
        let device =
            t.devices.get_mut(&id).ok_or_else(|| StoreError::NotFound(format!("device {id}")))?;
        device.kind = kind;
        Ok(())
    }

    async fn touch_device(&self, id: DeviceId, seen_at: DateTime<Utc>) -> StoreResult<()> {
        let mut t = self.tables.write();
        let device =
            t.devices.get_mut(&id).ok_or_else(|| StoreError::NotFound(format!("device {id}")))?;
        // heartbeats can arrive out of order; last_seen never moves backwards
        if device.last_seen_at.map_or(true, |prev| prev < seen_at) {
            device.last_seen_at = Some(seen_at);
        }
        Ok(())
    }

    async fn list_gateways(&self) -> StoreResult<Vec<Device>> {
        let t = self.tables.read();
        Ok(t.devices.values().filter(|d| d.kind.is_gateway()).cloned().collect())
    }

    async fn location_info(&self, device: &Device) -> StoreResult<LocationInfo> {
        let t = self.tables.read();
        let plan = device.floor_plan_id.and_then(|id| t.floor_plans.get(&id));
        let floor_id = plan.and_then(|p| p.floor_id).or(device.floor_id);
        let floor = floor_id.and_then(|id| t.floors.get(&id));
        let building_id = floor.map(|f| f.building_id).or(device.building_id);
        let building = building_id.and_then(|id| t.buildings.get(&id));

        Ok(LocationInfo {
            floor_plan_id: plan.map(|p| p.id),
            floor_plan_name: plan.map(|p| p.name.clone()),
            floor_id: floor.map(|f| f.id),
            floor_name: floor.map(|f| f.name.clone()),
            building_id: building.map(|b| b.id),
            building_name: building.map(|b| b.name.clone()),
        })
    }

    async fn list_buildings(&self) -> StoreResult<Vec<Building>> {
        Ok(self.tables.read().buildings.values().cloned().collect())
    }

    async fn list_floors(&self, building: BuildingId) -> StoreResult<Vec<Floor>> {
        let t = self.tables.read();
        Ok(t.floors.values().filter(|f| f.building_id == building).cloned().collect())
    }

    async fn find_tag_by_mac(&self, candidates: &[String]) -> StoreResult<Option<Tag>> {
        let t = self.tables.read();
        Ok(match_mac(t.tags.values(), |tag| tag.mac.as_str(), candidates).cloned())
    }

    async fn person_with_groups(&self, id: PersonId) -> StoreResult<Option<PersonWithGroups>> {
        let t = self.tables.read();
        Ok(t.people.get(&id).map(|person| {
            let mut group_ids: Vec<GroupId> =
                t.memberships.iter().filter(|m| m.person_id == id).map(|m| m.group_id).collect();
            group_ids.sort_unstable();
            group_ids.dedup();
            PersonWithGroups { person: person.clone(), group_ids }
        }))
    }

    async fn rules_for_detection(
        &self,
        device: DeviceId,
        group_ids: &[GroupId],
    ) -> StoreResult<Vec<AlertRule>> {
        let t = self.tables.read();
        Ok(t.rules.iter().filter(|r| r.applies_to(device, group_ids)).cloned().collect())
    }

    async fn insert_sample(&self, sample: NewSample) -> StoreResult<SampleId> {
        let mut t = self.tables.write();
        t.next_sample_id += 1;
        let id = SampleId(t.next_sample_id);
        t.samples.insert(
            id,
            DetectionSample {
                id,
                device_id: sample.device_id,
                tag_id: sample.tag_id,
                rssi: sample.rssi,
                captured_at: sample.captured_at,
                raw: sample.raw,
            },
        );
        Ok(id)
    }

    async fn samples_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<DetectionSample>> {
        let t = self.tables.read();
        let mut out: Vec<DetectionSample> =
            t.samples.values().filter(|s| s.captured_at < cutoff).cloned().collect();
        out.sort_by_key(|s| (s.captured_at, s.id));
        Ok(out)
    }

    async fn purge_samples_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut t = self.tables.write();
        let before = t.samples.len();
        t.samples.retain(|_, s| s.captured_at >= cutoff);
        Ok((before - t.samples.len()) as u64)
    }

    async fn open_or_get_session(&self, draft: NewAlertEvent) -> StoreResult<SessionSlot> {
        let mut t = self.tables.write();
        let existing = t.open_events(&draft.key());
        if !existing.is_empty() {
            return Ok(SessionSlot::Existing(existing));
        }
        Ok(SessionSlot::Created(t.insert_event(draft)))
    }

    async fn insert_event(&self, event: NewAlertEvent) -> StoreResult<AlertEvent> {
        Ok(self.tables.write().insert_event(event))
    }

    async fn update_open_event(
        &self,
        id: AlertEventId,
        patch: EventPatch,
    ) -> StoreResult<Option<AlertEvent>> {
        let mut t = self.tables.write();
        let event = t.event_mut(id)?;
        if !event.is_open {
            return Ok(None);
        }
        if let Some(last_seen_at) = patch.last_seen_at {
            event.last_seen_at = last_seen_at;
        }
        if let Some(message) = patch.message {
            event.message = message;
        }
        if let Some(payload) = patch.payload {
            event.payload = payload;
        }
        if let Some(sample_id) = patch.last_sample_id {
            event.last_sample_id = Some(sample_id);
        }
        Ok(Some(event.clone()))
    }

    async fn close_event(
        &self,
        id: AlertEventId,
        ended_at: DateTime<Utc>,
        payload: Map<String, Value>,
    ) -> StoreResult<Option<AlertEvent>> {
        let mut t = self.tables.write();
        let event = t.event_mut(id)?;
        if !event.is_open {
            return Ok(None);
        }
        event.is_open = false;
        event.ended_at = Some(ended_at);
        event.payload = payload;
        Ok(Some(event.clone()))
    }

    async fn open_events(&self, key: &SessionKey) -> StoreResult<Vec<AlertEvent>> {
        Ok(self.tables.read().open_events(key))
    }

    async fn open_events_for_tag(
        &self,
        kind: AlertKind,
        tag: TagId,
    ) -> StoreResult<Vec<AlertEvent>> {
        let t = self.tables.read();
        Ok(t.events
            .values()
            .filter(|e| e.is_open && e.kind == kind && e.tag_id == Some(tag))
            .cloned()
            .collect())
    }

    async fn stale_open_events(
        &self,
        kinds: &[AlertKind],
        cutoff: DateTime<Utc>,
        tag: Option<TagId>,
        device: Option<DeviceId>,
    ) -> StoreResult<Vec<AlertEvent>> {
        let t = self.tables.read();
        Ok(t.events
            .values()
            .filter(|e| e.is_open && kinds.contains(&e.kind) && e.last_seen_at < cutoff)
            .filter(|e| tag.map_or(true, |id| e.tag_id == Some(id)))
            .filter(|e| device.map_or(true, |id| e.device_id == Some(id)))
            .cloned()
            .collect())
    }

    async fn subscriptions_for(&self, event_type: &str) -> StoreResult<Vec<WebhookSubscription>> {
        let t = self.tables.read();
        Ok(t.subscriptions.iter().filter(|s| s.accepts(event_type)).cloned().collect())
    }

    async fn upsert_presence_sessions(&self, sessions: &[PresenceSession]) -> StoreResult<()> {
        let mut t = self.tables.write();
        for s in sessions {
            t.presence_sessions.insert((s.tag_id, s.device_id, s.started_at), s.clone());
        }
        Ok(())
    }

    async fn upsert_transitions(&self, transitions: &[PresenceTransition]) -> StoreResult<()> {
        let mut t = self.tables.write();
        for tr in transitions {
            t.transitions
                .insert((tr.tag_id, tr.transition_start_at, tr.transition_end_at), tr.clone());
        }
        Ok(())
    }

    async fn presence_sessions_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<PresenceSession>> {
        let t = self.tables.read();
        Ok(t.presence_sessions.values().filter(|s| s.started_at >= since).cloned().collect())
    }

    async fn upsert_daily_usage(&self, rows: &[DailyUsage]) -> StoreResult<()> {
        let mut t = self.tables.write();
        for row in rows {
            t.daily_usage.insert((row.tag_id, row.device_id, row.day), row.clone());
        }
        Ok(())
    }
}
