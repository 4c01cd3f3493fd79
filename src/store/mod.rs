//! Storage collaborator interface
//!
//! The engine never reads-then-writes session or registry state in process
//! memory. Every operation that must be atomic (gateway find-or-create,
//! session open-or-get, compare-and-set on `is_open`) is a single `Store`
//! call, so a relational backend can implement it with one statement or
//! transaction.

mod memory;
mod timeout;

pub use memory::{MemoryStore, Seed};
pub use timeout::TimeoutStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::alert::{AlertEvent, AlertKind, EventPatch, NewAlertEvent, SessionKey};
use crate::domain::types::{
    AlertEventId, AlertRule, Building, BuildingId, DailyUsage, DetectionSample, Device, DeviceId,
    DeviceKind, Floor, GroupId, LocationInfo, NewDevice, NewSample, Person, PersonId,
    PresenceSession, PresenceTransition, SampleId, Tag, TagId, WebhookSubscription,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("storage call timed out after {0} ms")]
    Timeout(u64),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of an atomic open-or-get on a session key
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSlot {
    /// No open session existed; the draft was inserted
    Created(AlertEvent),
    /// Open sessions already existed for the key, oldest first (never empty)
    Existing(Vec<AlertEvent>),
}

/// Person plus the ids of every group they belong to
#[derive(Debug, Clone, PartialEq)]
pub struct PersonWithGroups {
    pub person: Person,
    pub group_ids: Vec<GroupId>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // --- devices ---

    /// First device whose stored MAC equals any candidate, in candidate order
    async fn find_device_by_mac(&self, candidates: &[String]) -> StoreResult<Option<Device>>;

    /// Insert a device. Fails with `UniqueViolation` when a device with the
    /// same canonical MAC already exists.
    async fn insert_device(&self, device: NewDevice) -> StoreResult<Device>;

    async fn set_device_kind(&self, id: DeviceId, kind: DeviceKind) -> StoreResult<()>;

    async fn touch_device(&self, id: DeviceId, seen_at: DateTime<Utc>) -> StoreResult<()>;

    async fn list_gateways(&self) -> StoreResult<Vec<Device>>;

    async fn location_info(&self, device: &Device) -> StoreResult<LocationInfo>;

    // --- location catalog ---

    async fn list_buildings(&self) -> StoreResult<Vec<Building>>;

    async fn list_floors(&self, building: BuildingId) -> StoreResult<Vec<Floor>>;

    // --- tags and people ---

    async fn find_tag_by_mac(&self, candidates: &[String]) -> StoreResult<Option<Tag>>;

    /// Person and group ids in one lookup
    async fn person_with_groups(&self, id: PersonId) -> StoreResult<Option<PersonWithGroups>>;

    // --- rules ---

    /// Active rules bound to `device` that apply to a person in `group_ids`
    async fn rules_for_detection(
        &self,
        device: DeviceId,
        group_ids: &[GroupId],
    ) -> StoreResult<Vec<AlertRule>>;

    // --- raw samples ---

    async fn insert_sample(&self, sample: NewSample) -> StoreResult<SampleId>;

    /// Samples captured strictly before `cutoff`, ordered by capture time
    async fn samples_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<DetectionSample>>;

    /// Delete samples captured strictly before `cutoff`; returns the count
    async fn purge_samples_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    // --- alert events ---

    /// Atomically return the open sessions for the draft's key, or insert
    /// the draft when none is open
    async fn open_or_get_session(&self, draft: NewAlertEvent) -> StoreResult<SessionSlot>;

    /// Plain insert, used for events created already closed
    async fn insert_event(&self, event: NewAlertEvent) -> StoreResult<AlertEvent>;

    /// Apply `patch` only while the session is still open. `None` when the
    /// session was closed concurrently.
    async fn update_open_event(
        &self,
        id: AlertEventId,
        patch: EventPatch,
    ) -> StoreResult<Option<AlertEvent>>;

    /// Compare-and-set close: flips `is_open` only if it is still true
    async fn close_event(
        &self,
        id: AlertEventId,
        ended_at: DateTime<Utc>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> StoreResult<Option<AlertEvent>>;

    /// Open sessions matching `key` exactly, oldest first
    async fn open_events(&self, key: &SessionKey) -> StoreResult<Vec<AlertEvent>>;

    /// Open sessions of `kind` for a tag, at any device or rule
    async fn open_events_for_tag(&self, kind: AlertKind, tag: TagId)
        -> StoreResult<Vec<AlertEvent>>;

    /// Open sessions of the given kinds last seen before `cutoff`,
    /// optionally narrowed to one tag and/or device
    async fn stale_open_events(
        &self,
        kinds: &[AlertKind],
        cutoff: DateTime<Utc>,
        tag: Option<TagId>,
        device: Option<DeviceId>,
    ) -> StoreResult<Vec<AlertEvent>>;

    // --- webhooks ---

    async fn subscriptions_for(&self, event_type: &str) -> StoreResult<Vec<WebhookSubscription>>;

    // --- presence aggregates ---

    /// Upsert keyed by (tag, device, started_at)
    async fn upsert_presence_sessions(&self, sessions: &[PresenceSession]) -> StoreResult<()>;

    /// Upsert keyed by (tag, transition_start_at, transition_end_at)
    async fn upsert_transitions(&self, transitions: &[PresenceTransition]) -> StoreResult<()>;

    /// Persisted sessions that started at or after `since`
    async fn presence_sessions_since(&self, since: DateTime<Utc>)
        -> StoreResult<Vec<PresenceSession>>;

    /// Upsert keyed by (tag, device, day)
    async fn upsert_daily_usage(&self, rows: &[DailyUsage]) -> StoreResult<()>;
}
