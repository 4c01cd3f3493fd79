//! Tests for the AlertEngine module

use super::*;
use crate::domain::alert::{EventPatch, NewAlertEvent, SessionKey};
use crate::domain::types::{
    AlertEventId, Building, BuildingId, DailyUsage, DetectionSample, DeviceKind, Floor, GroupId,
    LocationInfo, NewDevice, NewSample, PersonId, PresenceSession, PresenceTransition, SampleId,
    WebhookSubscription,
};
use crate::io::webhook::{webhook_channel, WebhookJob};
use crate::store::{MemoryStore, PersonWithGroups, SessionSlot, StoreError};
use chrono::TimeZone;
use tokio::sync::mpsc;

const D1: DeviceId = DeviceId(1);
const D2: DeviceId = DeviceId(2);
const TAG: TagId = TagId(7);
const STAFF: GroupId = GroupId(3);

/// Test harness that keeps the webhook receiver so dispatches can be observed
struct TestEngine {
    engine: AlertEngine,
    store: Arc<MemoryStore>,
    jobs: mpsc::Receiver<WebhookJob>,
    metrics: Arc<Metrics>,
}

impl TestEngine {
    fn drain(&mut self) -> Vec<WebhookJob> {
        let mut out = Vec::new();
        while let Ok(job) = self.jobs.try_recv() {
            out.push(job);
        }
        out
    }

    fn device(&self, id: DeviceId) -> Device {
        self.store.devices().into_iter().find(|d| d.id == id).unwrap()
    }

    async fn detect(&self, device: DeviceId, at: DateTime<Utc>) {
        let device = self.device(device);
        self.engine.on_detection(&device, &tag(), None, at).await.unwrap();
    }

    fn open_events(&self) -> Vec<AlertEvent> {
        self.store.events().into_iter().filter(|e| e.is_open).collect()
    }
}

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

fn gateway(id: DeviceId, name: &str) -> Device {
    Device {
        id,
        mac: format!("AA:BB:CC:DD:EE:0{}", id.0),
        name: name.to_string(),
        code: None,
        kind: DeviceKind::BleGateway,
        building_id: None,
        floor_id: None,
        floor_plan_id: None,
        pos_x: None,
        pos_y: None,
        last_seen_at: None,
    }
}

fn tag() -> Tag {
    Tag {
        id: TAG,
        mac: "11:22:33:44:55:66".to_string(),
        code: Some("T-007".to_string()),
        person_id: Some(PersonId(5)),
        active: true,
    }
}

fn rule(id: i64, rule_type: RuleType, device: DeviceId, group: Option<GroupId>) -> AlertRule {
    AlertRule {
        id: RuleId(id),
        name: format!("rule {id}"),
        rule_type,
        device_id: Some(device),
        group_id: group,
        max_dwell_seconds: None,
        is_active: true,
    }
}

fn create_test_engine(rules: Vec<AlertRule>) -> TestEngine {
    create_test_engine_with_ttl(rules, 120)
}

fn seeded_store(rules: Vec<AlertRule>) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.add_device(gateway(D1, "Lab door")).unwrap();
    store.add_device(gateway(D2, "Server room")).unwrap();
    store.add_person(Person { id: PersonId(5), full_name: Some("Ana Souza".into()) }, &[STAFF]);
    store.add_tag(tag());
    for rule in rules {
        store.add_rule(rule);
    }
    store
}

fn engine_over(store: Arc<MemoryStore>, backend: Arc<dyn Store>, ttl: u64) -> TestEngine {
    let metrics = Arc::new(Metrics::new());
    let (webhooks, jobs) = webhook_channel(256, metrics.clone());
    let settings = EngineSettings { offline_threshold_secs: 60, stale_session_ttl_secs: ttl };
    let engine = AlertEngine::new(backend, webhooks, metrics.clone(), settings);
    TestEngine { engine, store, jobs, metrics }
}

fn create_test_engine_with_ttl(rules: Vec<AlertRule>, ttl: u64) -> TestEngine {
    let store = seeded_store(rules);
    engine_over(store.clone(), store, ttl)
}

/// Engine whose storage calls can be made to fail per rule or device
fn create_faulty_engine(rules: Vec<AlertRule>) -> (TestEngine, Arc<FaultyStore>) {
    let store = seeded_store(rules);
    let faulty = Arc::new(FaultyStore { inner: store.clone(), faults: Default::default() });
    (engine_over(store, faulty.clone(), 120), faulty)
}

// ============================================================================
// Forbidden sector
// ============================================================================

#[tokio::test]
async fn test_forbidden_sector_open_bump_move() {
    let mut h = create_test_engine(vec![
        rule(10, RuleType::ForbiddenSector, D1, None),
        rule(20, RuleType::ForbiddenSector, D2, None),
    ]);

    // t=0 at D1: session opens and is announced
    h.detect(D1, t(0)).await;
    let open = h.open_events();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].device_id, Some(D1));
    assert_eq!(
        open[0].message.as_deref(),
        Some("Forbidden sector entry: Ana Souza at gateway 'Lab door'.")
    );
    let jobs = h.drain();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].event_type, "FORBIDDEN_SECTOR");
    assert_eq!(jobs[0].payload["is_open"], true);

    // t=5 at D1: same session bumped, nothing dispatched
    h.detect(D1, t(5)).await;
    let open = h.open_events();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].last_seen_at, t(5));
    assert_eq!(open[0].started_at, t(0));
    assert!(h.drain().is_empty());

    // t=10 at D2: D1 closed as moved, D2 opened
    h.detect(D2, t(10)).await;
    let events = h.store.events();
    assert_eq!(events.len(), 2);
    let d1 = &events[0];
    assert!(!d1.is_open);
    assert_eq!(d1.ended_at, Some(t(10)));
    assert_eq!(d1.payload["close_reason"], "moved_to_other_device_or_rule");
    assert_eq!(d1.payload["duration_seconds"], 10.0);
    let d2 = &events[1];
    assert!(d2.is_open);
    assert_eq!(d2.device_id, Some(D2));

    let jobs = h.drain();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].payload["is_open"], false);
    assert_eq!(jobs[1].payload["device_id"], 2);
    assert_eq!(h.metrics.alerts_opened(), 2);
    assert_eq!(h.metrics.alerts_closed(), 1);
}

#[tokio::test]
async fn test_forbidden_sector_single_open_per_key() {
    let h = create_test_engine(vec![rule(10, RuleType::ForbiddenSector, D1, None)]);
    for secs in 0..20 {
        h.detect(D1, t(secs)).await;
    }
    assert_eq!(h.store.events().len(), 1);
    assert_eq!(h.open_events()[0].last_seen_at, t(19));
}

#[tokio::test]
async fn test_two_rules_same_device_do_not_evict_each_other() {
    let h = create_test_engine(vec![
        rule(10, RuleType::ForbiddenSector, D1, None),
        rule(11, RuleType::ForbiddenSector, D1, Some(STAFF)),
    ]);
    h.detect(D1, t(0)).await;
    h.detect(D1, t(3)).await;
    let open = h.open_events();
    assert_eq!(open.len(), 2);
    assert_eq!(h.store.events().len(), 2);
}

#[tokio::test]
async fn test_group_scoped_rule_ignores_non_members() {
    let h = create_test_engine(vec![rule(10, RuleType::ForbiddenSector, D1, Some(GroupId(99)))]);
    h.detect(D1, t(0)).await;
    assert!(h.store.events().is_empty());
}

#[tokio::test]
async fn test_message_falls_back_to_tag_code() {
    let mut h = create_test_engine(vec![rule(10, RuleType::ForbiddenSector, D1, None)]);
    let mut anonymous = tag();
    anonymous.person_id = None;
    let device = h.device(D1);
    h.engine.on_detection(&device, &anonymous, None, t(0)).await.unwrap();

    let jobs = h.drain();
    assert_eq!(jobs[0].payload["message"], "Forbidden sector entry: T-007 at gateway 'Lab door'.");
    assert_eq!(jobs[0].payload["person_id"], Value::Null);
}

#[tokio::test]
async fn test_duplicate_open_sessions_repaired() {
    let h = create_test_engine(vec![rule(10, RuleType::ForbiddenSector, D1, None)]);
    for _ in 0..2 {
        let mut draft = NewAlertEvent::open(AlertKind::ForbiddenSector, t(0));
        draft.rule_id = Some(RuleId(10));
        draft.tag_id = Some(TAG);
        draft.device_id = Some(D1);
        h.store.insert_event(draft).await.unwrap();
    }

    h.detect(D1, t(5)).await;
    let events = h.store.events();
    assert_eq!(events.len(), 2);
    assert!(!events[0].is_open);
    assert_eq!(events[0].payload["close_reason"], "duplicate_open_session");
    assert!(events[1].is_open);
    assert_eq!(events[1].last_seen_at, t(5));
}

// ============================================================================
// Dwell time
// ============================================================================

#[tokio::test]
async fn test_dwell_threshold_and_monotonic_dwell() {
    let mut dwell = rule(30, RuleType::DwellTime, D1, None);
    dwell.max_dwell_seconds = Some(10);
    let mut h = create_test_engine(vec![dwell]);

    h.detect(D1, t(0)).await;
    let opened = h.open_events().remove(0);
    assert!(opened.message.is_none());

    h.detect(D1, t(5)).await;
    let event = h.open_events().remove(0);
    assert_eq!(event.payload["dwell_seconds"], 5.0);
    assert!(event.message.is_none());

    h.detect(D1, t(12)).await;
    let event = h.open_events().remove(0);
    assert_eq!(event.payload["dwell_seconds"], 12.0);
    assert_eq!(
        event.message.as_deref(),
        Some("Dwell time exceeded: Ana Souza at gateway 'Lab door' for 12s (limit 10s).")
    );

    // every evaluation is dispatched, dwell never decreases
    let jobs = h.drain();
    assert_eq!(jobs.len(), 3);
    let dwell: Vec<f64> = jobs.iter().map(|j| j.payload["dwell_seconds"].as_f64().unwrap()).collect();
    assert_eq!(dwell, vec![0.0, 5.0, 12.0]);
    assert_eq!(h.store.events().len(), 1);
}

#[tokio::test]
async fn test_dwell_not_closed_by_detection_elsewhere() {
    let mut dwell = rule(30, RuleType::DwellTime, D1, None);
    dwell.max_dwell_seconds = Some(60);
    let h = create_test_engine(vec![dwell, rule(20, RuleType::ForbiddenSector, D2, None)]);

    h.detect(D1, t(0)).await;
    h.detect(D2, t(5)).await;
    let open = h.open_events();
    assert_eq!(open.len(), 2);
}

// ============================================================================
// Stale sessions
// ============================================================================

#[tokio::test]
async fn test_stale_session_closed_at_last_seen() {
    let mut h = create_test_engine(vec![rule(10, RuleType::ForbiddenSector, D1, None)]);
    h.detect(D1, t(0)).await;
    h.detect(D1, t(30)).await;
    h.drain();

    // gap longer than the TTL: old session retired, a fresh one opened
    h.detect(D1, t(300)).await;
    let events = h.store.events();
    assert_eq!(events.len(), 2);
    assert!(!events[0].is_open);
    assert_eq!(events[0].ended_at, Some(t(30)));
    assert_eq!(events[0].payload["close_reason"], "stale_ttl_120s");
    assert_eq!(events[0].payload["duration_seconds"], 30.0);
    assert!(events[1].is_open);
    assert_eq!(events[1].started_at, t(300));
    assert_eq!(h.drain().len(), 2);
}

#[tokio::test]
async fn test_stale_close_disabled_with_zero_ttl() {
    let h = create_test_engine_with_ttl(vec![rule(10, RuleType::ForbiddenSector, D1, None)], 0);
    h.detect(D1, t(0)).await;
    h.detect(D1, t(10_000)).await;
    assert_eq!(h.store.events().len(), 1);
    assert_eq!(h.engine.close_stale_sessions(t(99_999), None, None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_sweep_closes_stale_sessions() {
    let h = create_test_engine(vec![rule(10, RuleType::ForbiddenSector, D1, None)]);
    h.detect(D1, t(0)).await;
    let report = h.engine.on_liveness_sweep(t(121)).await.unwrap();
    assert_eq!(report.stale_closed, 1);
    assert!(h.open_events().is_empty());
}

// ============================================================================
// Gateway liveness
// ============================================================================

#[tokio::test]
async fn test_gateway_offline_then_online() {
    let mut h = create_test_engine(vec![]);
    h.store.set_last_seen(D1, Some(t(0)));
    h.store.set_last_seen(D2, Some(t(0)));

    // first sweep only seeds the cache
    let report = h.engine.on_liveness_sweep(t(10)).await.unwrap();
    assert_eq!(report.gateways, 2);
    assert!(h.store.events().is_empty());

    // D2 keeps reporting, D1 goes quiet
    h.store.set_last_seen(D2, Some(t(95)));
    let report = h.engine.on_liveness_sweep(t(100)).await.unwrap();
    assert_eq!(report.went_offline, 1);
    let jobs = h.drain();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].event_type, "GATEWAY_OFFLINE");
    assert_eq!(jobs[0].payload["message"], "Gateway 'Lab door' went OFFLINE.");
    assert_eq!(jobs[0].payload["offline_seconds"], 100);

    // still offline: updated in place, no duplicate
    h.store.set_last_seen(D2, Some(t(125)));
    h.engine.on_liveness_sweep(t(130)).await.unwrap();
    let open = h.open_events();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].payload["offline_seconds"], 130);
    assert_eq!(open[0].last_seen_at, t(130));
    assert!(h.drain().is_empty());

    // back online: offline closed, online recorded closed
    h.store.set_last_seen(D1, Some(t(140)));
    h.store.set_last_seen(D2, Some(t(140)));
    let report = h.engine.on_liveness_sweep(t(141)).await.unwrap();
    assert_eq!(report.came_online, 1);

    let events = h.store.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, AlertKind::GatewayOffline);
    assert!(!events[0].is_open);
    assert_eq!(events[0].payload["close_reason"], "gateway_back_online");
    assert_eq!(events[1].kind, AlertKind::GatewayOnline);
    assert!(!events[1].is_open);
    assert_eq!(events[1].message.as_deref(), Some("Gateway 'Lab door' is back ONLINE."));

    let kinds: Vec<String> = h.drain().into_iter().map(|j| j.event_type).collect();
    assert_eq!(kinds, vec!["GATEWAY_OFFLINE", "GATEWAY_ONLINE"]);

    // steady state: nothing more
    h.engine.on_liveness_sweep(t(150)).await.unwrap();
    assert!(h.drain().is_empty());
    assert_eq!(h.store.events().len(), 2);
}

#[tokio::test]
async fn test_gateway_never_seen_seeds_offline_silently() {
    let mut h = create_test_engine(vec![]);
    h.engine.on_liveness_sweep(t(0)).await.unwrap();
    h.engine.on_liveness_sweep(t(100)).await.unwrap();
    assert!(h.store.events().is_empty());
    assert!(h.drain().is_empty());

    // coming online without a recorded offline session emits nothing
    h.store.set_last_seen(D1, Some(t(190)));
    let report = h.engine.on_liveness_sweep(t(200)).await.unwrap();
    assert_eq!(report.came_online, 0);
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_run_liveness_stops_on_shutdown() {
    let h = create_test_engine(vec![]);
    let engine = Arc::new(h.engine);
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(engine.run_liveness(std::time::Duration::from_millis(10), rx));
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(1), handle).await.unwrap().unwrap();
}

// ============================================================================
// Failure isolation
// ============================================================================

#[derive(Default)]
struct Faults {
    /// `open_or_get_session` fails for drafts of this rule
    open_rule: Option<RuleId>,
    /// `open_or_get_session` fails for drafts at this device
    open_device: Option<DeviceId>,
    /// `close_event` fails for sessions at this device
    close_device: Option<DeviceId>,
}

/// `MemoryStore` with switchable write failures
struct FaultyStore {
    inner: Arc<MemoryStore>,
    faults: parking_lot::Mutex<Faults>,
}

impl FaultyStore {
    fn set(&self, faults: Faults) {
        *self.faults.lock() = faults;
    }

    fn clear(&self) {
        self.set(Faults::default());
    }
}

fn injected() -> StoreError {
    StoreError::Backend("connection reset".to_string())
}

#[async_trait::async_trait]
impl Store for FaultyStore {
    async fn find_device_by_mac(&self, candidates: &[String]) -> StoreResult<Option<Device>> {
        self.inner.find_device_by_mac(candidates).await
    }

    async fn insert_device(&self, device: NewDevice) -> StoreResult<Device> {
        self.inner.insert_device(device).await
    }

    async fn set_device_kind(&self, id: DeviceId, kind: DeviceKind) -> StoreResult<()> {
        self.inner.set_device_kind(id, kind).await
    }

    async fn touch_device(&self, id: DeviceId, seen_at: DateTime<Utc>) -> StoreResult<()> {
        self.inner.touch_device(id, seen_at).await
    }

    async fn list_gateways(&self) -> StoreResult<Vec<Device>> {
        self.inner.list_gateways().await
    }

    async fn location_info(&self, device: &Device) -> StoreResult<LocationInfo> {
        self.inner.location_info(device).await
    }

    async fn list_buildings(&self) -> StoreResult<Vec<Building>> {
        self.inner.list_buildings().await
    }

    async fn list_floors(&self, building: BuildingId) -> StoreResult<Vec<Floor>> {
        self.inner.list_floors(building).await
    }

    async fn find_tag_by_mac(&self, candidates: &[String]) -> StoreResult<Option<Tag>> {
        self.inner.find_tag_by_mac(candidates).await
    }

    async fn person_with_groups(&self, id: PersonId) -> StoreResult<Option<PersonWithGroups>> {
        self.inner.person_with_groups(id).await
    }

    async fn rules_for_detection(
        &self,
        device: DeviceId,
        group_ids: &[GroupId],
    ) -> StoreResult<Vec<AlertRule>> {
        self.inner.rules_for_detection(device, group_ids).await
    }

    async fn insert_sample(&self, sample: NewSample) -> StoreResult<SampleId> {
        self.inner.insert_sample(sample).await
    }

    async fn samples_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<DetectionSample>> {
        self.inner.samples_before(cutoff).await
    }

    async fn purge_samples_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.purge_samples_before(cutoff).await
    }

    async fn open_or_get_session(&self, draft: NewAlertEvent) -> StoreResult<SessionSlot> {
        let fail = {
            let faults = self.faults.lock();
            (faults.open_rule.is_some() && draft.rule_id == faults.open_rule)
                || (faults.open_device.is_some() && draft.device_id == faults.open_device)
        };
        if fail {
            return Err(injected());
        }
        self.inner.open_or_get_session(draft).await
    }

    async fn insert_event(&self, event: NewAlertEvent) -> StoreResult<AlertEvent> {
        self.inner.insert_event(event).await
    }

    async fn update_open_event(
        &self,
        id: AlertEventId,
        patch: EventPatch,
    ) -> StoreResult<Option<AlertEvent>> {
        self.inner.update_open_event(id, patch).await
    }

    async fn close_event(
        &self,
        id: AlertEventId,
        ended_at: DateTime<Utc>,
        payload: Map<String, Value>,
    ) -> StoreResult<Option<AlertEvent>> {
        let close_device = self.faults.lock().close_device;
        if close_device.is_some()
            && self.inner.events().iter().any(|e| e.id == id && e.device_id == close_device)
        {
            return Err(injected());
        }
        self.inner.close_event(id, ended_at, payload).await
    }

    async fn open_events(&self, key: &SessionKey) -> StoreResult<Vec<AlertEvent>> {
        self.inner.open_events(key).await
    }

    async fn open_events_for_tag(
        &self,
        kind: AlertKind,
        tag: TagId,
    ) -> StoreResult<Vec<AlertEvent>> {
        self.inner.open_events_for_tag(kind, tag).await
    }

    async fn stale_open_events(
        &self,
        kinds: &[AlertKind],
        cutoff: DateTime<Utc>,
        tag: Option<TagId>,
        device: Option<DeviceId>,
    ) -> StoreResult<Vec<AlertEvent>> {
        self.inner.stale_open_events(kinds, cutoff, tag, device).await
    }

    async fn subscriptions_for(&self, event_type: &str) -> StoreResult<Vec<WebhookSubscription>> {
        self.inner.subscriptions_for(event_type).await
    }

    async fn upsert_presence_sessions(&self, sessions: &[PresenceSession]) -> StoreResult<()> {
        self.inner.upsert_presence_sessions(sessions).await
    }

    async fn upsert_transitions(&self, transitions: &[PresenceTransition]) -> StoreResult<()> {
        self.inner.upsert_transitions(transitions).await
    }

    async fn presence_sessions_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<PresenceSession>> {
        self.inner.presence_sessions_since(since).await
    }

    async fn upsert_daily_usage(&self, rows: &[DailyUsage]) -> StoreResult<()> {
        self.inner.upsert_daily_usage(rows).await
    }
}

#[tokio::test]
async fn test_failing_rule_does_not_block_sibling_rule() {
    let (h, faulty) = create_faulty_engine(vec![
        rule(10, RuleType::ForbiddenSector, D1, None),
        rule(11, RuleType::ForbiddenSector, D1, Some(STAFF)),
    ]);
    faulty.set(Faults { open_rule: Some(RuleId(10)), ..Default::default() });

    h.detect(D1, t(0)).await;
    let open = h.open_events();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].rule_id, Some(RuleId(11)));
    assert_eq!(h.metrics.engine_errors(), 1);

    // storage recovers: the next detection opens the missing session
    faulty.clear();
    h.detect(D1, t(5)).await;
    let mut rules: Vec<RuleId> = h.open_events().iter().filter_map(|e| e.rule_id).collect();
    rules.sort();
    assert_eq!(rules, vec![RuleId(10), RuleId(11)]);
}

#[tokio::test]
async fn test_failed_move_close_still_opens_new_entry() {
    let (h, faulty) = create_faulty_engine(vec![
        rule(10, RuleType::ForbiddenSector, D1, None),
        rule(20, RuleType::ForbiddenSector, D2, None),
    ]);
    h.detect(D1, t(0)).await;

    faulty.set(Faults { close_device: Some(D1), ..Default::default() });
    h.detect(D2, t(10)).await;
    let open = h.open_events();
    assert_eq!(open.len(), 2);
    assert!(open.iter().any(|e| e.device_id == Some(D2)));
    assert_eq!(h.metrics.engine_errors(), 1);

    // the close is retried by the next detection
    faulty.clear();
    h.detect(D2, t(15)).await;
    let open = h.open_events();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].device_id, Some(D2));
}

#[tokio::test]
async fn test_failing_gateway_does_not_block_sweep() {
    let (h, faulty) = create_faulty_engine(vec![]);
    h.store.set_last_seen(D1, Some(t(0)));
    h.store.set_last_seen(D2, Some(t(0)));
    h.engine.on_liveness_sweep(t(10)).await.unwrap();

    faulty.set(Faults { open_device: Some(D1), ..Default::default() });
    let report = h.engine.on_liveness_sweep(t(100)).await.unwrap();
    assert_eq!(report.failures, 1);
    assert_eq!(report.went_offline, 1);
    let open = h.open_events();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].device_id, Some(D2));

    // cached state was restored, so the transition is retried
    faulty.clear();
    let report = h.engine.on_liveness_sweep(t(110)).await.unwrap();
    assert_eq!(report.failures, 0);
    assert_eq!(report.went_offline, 1);
    let offline: Vec<DeviceId> = h
        .open_events()
        .iter()
        .filter(|e| e.kind == AlertKind::GatewayOffline)
        .filter_map(|e| e.device_id)
        .collect();
    assert_eq!(offline.len(), 2);
    assert!(offline.contains(&D1));
}
