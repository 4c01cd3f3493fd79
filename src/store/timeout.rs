//! Bounded-latency wrapper around any `Store`

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::{PersonWithGroups, SessionSlot, Store, StoreError, StoreResult};
use crate::domain::alert::{AlertEvent, AlertKind, EventPatch, NewAlertEvent, SessionKey};
use crate::domain::types::{
    AlertEventId, AlertRule, Building, BuildingId, DailyUsage, DetectionSample, Device, DeviceId,
    DeviceKind, Floor, GroupId, LocationInfo, NewDevice, NewSample, PersonId, PresenceSession,
    PresenceTransition, SampleId, Tag, TagId, WebhookSubscription,
};

/// Fails any call that exceeds `timeout` with `StoreError::Timeout`
pub struct TimeoutStore {
    inner: Arc<dyn Store>,
    timeout: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn Store>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl Store for TimeoutStore {
    async fn find_device_by_mac(&self, candidates: &[String]) -> StoreResult<Option<Device>> {
        self.bounded(self.inner.find_device_by_mac(candidates)).await
    }

    async fn insert_device(&self, device: NewDevice) -> StoreResult<Device> {
        self.bounded(self.inner.insert_device(device)).await
    }

    async fn set_device_kind(&self, id: DeviceId, kind: DeviceKind) -> StoreResult<()> {
        self.bounded(self.inner.set_device_kind(id, kind)).await
    }

    async fn touch_device(&self, id: DeviceId, seen_at: DateTime<Utc>) -> StoreResult<()> {
        self.bounded(self.inner.touch_device(id, seen_at)).await
    }

    async fn list_gateways(&self) -> StoreResult<Vec<Device>> {
        self.bounded(self.inner.list_gateways()).await
    }

    async fn location_info(&self, device: &Device) -> StoreResult<LocationInfo> {
        self.bounded(self.inner.location_info(device)).await
    }

    async fn list_buildings(&self) -> StoreResult<Vec<Building>> {
        self.bounded(self.inner.list_buildings()).await
    }

    async fn list_floors(&self, building: BuildingId) -> StoreResult<Vec<Floor>> {
        self.bounded(self.inner.list_floors(building)).await
    }

    async fn find_tag_by_mac(&self, candidates: &[String]) -> StoreResult<Option<Tag>> {
        self.bounded(self.inner.find_tag_by_mac(candidates)).await
    }

    async fn person_with_groups(&self, id: PersonId) -> StoreResult<Option<PersonWithGroups>> {
        self.bounded(self.inner.person_with_groups(id)).await
    }

    async fn rules_for_detection(
        &self,
        device: DeviceId,
        group_ids: &[GroupId],
    ) -> StoreResult<Vec<AlertRule>> {
        self.bounded(self.inner.rules_for_detection(device, group_ids)).await
    }

    async fn insert_sample(&self, sample: NewSample) -> StoreResult<SampleId> {
        self.bounded(self.inner.insert_sample(sample)).await
    }

    async fn samples_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<DetectionSample>> {
        self.bounded(self.inner.samples_before(cutoff)).await
    }

    async fn purge_samples_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.bounded(self.inner.purge_samples_before(cutoff)).await
    }

    async fn open_or_get_session(&self, draft: NewAlertEvent) -> StoreResult<SessionSlot> {
        self.bounded(self.inner.open_or_get_session(draft)).await
    }

    async fn insert_event(&self, event: NewAlertEvent) -> StoreResult<AlertEvent> {
        self.bounded(self.inner.insert_event(event)).await
    }

    async fn update_open_event(
        &self,
        id: AlertEventId,
        patch: EventPatch,
    ) -> StoreResult<Option<AlertEvent>> {
        self.bounded(self.inner.update_open_event(id, patch)).await
    }

    async fn close_event(
        &self,
        id: AlertEventId,
        ended_at: DateTime<Utc>,
        payload: Map<String, Value>,
    ) -> StoreResult<Option<AlertEvent>> {
        self.bounded(self.inner.close_event(id, ended_at, payload)).await
    }

    async fn open_events(&self, key: &SessionKey) -> StoreResult<Vec<AlertEvent>> {
        self.bounded(self.inner.open_events(key)).await
    }

    async fn open_events_for_tag(
        &self,
        kind: AlertKind,
        tag: TagId,
    ) -> StoreResult<Vec<AlertEvent>> {
        self.bounded(self.inner.open_events_for_tag(kind, tag)).await
    }

    async fn stale_open_events(
        &self,
        kinds: &[AlertKind],
        cutoff: DateTime<Utc>,
        tag: Option<TagId>,
        device: Option<DeviceId>,
    ) -> StoreResult<Vec<AlertEvent>> {
        self.bounded(self.inner.stale_open_events(kinds, cutoff, tag, device)).await
    }

    async fn subscriptions_for(&self, event_type: &str) -> StoreResult<Vec<WebhookSubscription>> {
        self.bounded(self.inner.subscriptions_for(event_type)).await
    }

    async fn upsert_presence_sessions(&self, sessions: &[PresenceSession]) -> StoreResult<()> {
        self.bounded(self.inner.upsert_presence_sessions(sessions)).await
    }

    async fn upsert_transitions(&self, transitions: &[PresenceTransition]) -> StoreResult<()> {
        self.bounded(self.inner.upsert_transitions(transitions)).await
    }

    async fn presence_sessions_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<PresenceSession>> {
        self.bounded(self.inner.presence_sessions_since(since)).await
    }

    async fn upsert_daily_usage(&self, rows: &[DailyUsage]) -> StoreResult<()> {
        self.bounded(self.inner.upsert_daily_usage(rows)).await
    }
}
