//! Presence rollup
//!
//! Raw detection samples older than the retention cutoff are folded into
//! contiguous presence sessions per (tag, device), transitions between
//! gateways, and per-day usage. The same cutoff then drives the purge, so a
//! sample is only deleted after it has been rolled up.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::types::{
    DailyUsage, DetectionSample, DeviceId, PresenceSession, PresenceTransition, TagId,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::store::{Store, StoreResult};

/// Group samples into sessions: a new session starts for a (tag, device)
/// whenever the gap since its previous sample exceeds `gap`
pub fn sessionize(samples: &[DetectionSample], gap: chrono::Duration) -> Vec<PresenceSession> {
    let mut by_key: BTreeMap<(TagId, DeviceId), Vec<DateTime<Utc>>> = BTreeMap::new();
    for sample in samples {
        by_key.entry((sample.tag_id, sample.device_id)).or_default().push(sample.captured_at);
    }

    let mut sessions = Vec::new();
    for ((tag_id, device_id), mut times) in by_key {
        times.sort_unstable();
        let mut iter = times.into_iter();
        let Some(first) = iter.next() else { continue };

        let mut current = PresenceSession {
            tag_id,
            device_id,
            started_at: first,
            ended_at: first,
            duration_seconds: 0,
            samples_count: 1,
        };
        for at in iter {
            if at - current.ended_at > gap {
                sessions.push(finish(current));
                current = PresenceSession {
                    tag_id,
                    device_id,
                    started_at: at,
                    ended_at: at,
                    duration_seconds: 0,
                    samples_count: 1,
                };
            } else {
                current.ended_at = at;
                current.samples_count += 1;
            }
        }
        sessions.push(finish(current));
    }

    sessions.sort_by_key(|s| (s.tag_id, s.started_at, s.device_id));
    sessions
}

fn finish(mut session: PresenceSession) -> PresenceSession {
    session.duration_seconds = (session.ended_at - session.started_at).num_seconds();
    session
}

/// Moves between consecutive sessions of a tag on different devices
pub fn derive_transitions(sessions: &[PresenceSession]) -> Vec<PresenceTransition> {
    let mut by_tag: BTreeMap<TagId, Vec<&PresenceSession>> = BTreeMap::new();
    for session in sessions {
        by_tag.entry(session.tag_id).or_default().push(session);
    }

    let mut transitions = Vec::new();
    for (tag_id, mut tag_sessions) in by_tag {
        tag_sessions.sort_by_key(|s| (s.started_at, s.device_id));
        for pair in tag_sessions.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            if from.device_id == to.device_id {
                continue;
            }
            transitions.push(PresenceTransition {
                tag_id,
                from_device_id: from.device_id,
                to_device_id: to.device_id,
                transition_start_at: from.ended_at,
                transition_end_at: to.started_at,
                transition_seconds: (to.started_at - from.ended_at).num_seconds().max(0),
            });
        }
    }
    transitions
}

/// Per (tag, device, UTC day of `started_at`) totals
pub fn daily_usage(sessions: &[PresenceSession]) -> Vec<DailyUsage> {
    let mut rows: BTreeMap<(TagId, DeviceId, NaiveDate), DailyUsage> = BTreeMap::new();
    for session in sessions {
        let day = session.started_at.date_naive();
        let row = rows.entry((session.tag_id, session.device_id, day)).or_insert(DailyUsage {
            tag_id: session.tag_id,
            device_id: session.device_id,
            day,
            total_dwell_seconds: 0,
            sessions_count: 0,
            samples_count: 0,
        });
        row.total_dwell_seconds += session.duration_seconds;
        row.sessions_count += 1;
        row.samples_count += session.samples_count;
    }
    rows.into_values().collect()
}

fn day_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = at.date_naive().and_hms_opt(0, 0, 0).unwrap_or_else(|| at.naive_utc());
    Utc.from_utc_datetime(&midnight)
}

/// Counts from one rollup pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RollupReport {
    pub samples: usize,
    pub sessions: usize,
    pub transitions: usize,
    pub usage_rows: usize,
    pub purged: u64,
}

pub struct Sessionizer {
    store: Arc<dyn Store>,
    metrics: Arc<Metrics>,
    retention: chrono::Duration,
    gap: chrono::Duration,
    interval: Duration,
}

impl Sessionizer {
    pub fn new(store: Arc<dyn Store>, metrics: Arc<Metrics>, config: &Config) -> Self {
        Self::with_settings(
            store,
            metrics,
            config.retention_days(),
            config.gap_seconds(),
            config.rollup_interval(),
        )
    }

    pub fn with_settings(
        store: Arc<dyn Store>,
        metrics: Arc<Metrics>,
        retention_days: u32,
        gap_seconds: u64,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            retention: chrono::Duration::days(i64::from(retention_days)),
            gap: chrono::Duration::seconds(gap_seconds as i64),
            interval,
        }
    }

    /// One rollup pass. Safe to rerun: every write is an upsert and daily
    /// usage is recomputed from all persisted sessions of the affected days.
    pub async fn run_once(&self, now: DateTime<Utc>) -> StoreResult<RollupReport> {
        let cutoff = now - self.retention;
        let mut report = RollupReport::default();

        let samples = self.store.samples_before(cutoff).await?;
        report.samples = samples.len();

        let sessions = sessionize(&samples, self.gap);
        report.sessions = sessions.len();

        if let Some(earliest) = sessions.iter().map(|s| s.started_at).min() {
            self.store.upsert_presence_sessions(&sessions).await?;

            let persisted = self.store.presence_sessions_since(day_start(earliest)).await?;

            let transitions = derive_transitions(&persisted);
            self.store.upsert_transitions(&transitions).await?;
            report.transitions = transitions.len();

            let affected: BTreeSet<(TagId, DeviceId, NaiveDate)> = sessions
                .iter()
                .map(|s| (s.tag_id, s.device_id, s.started_at.date_naive()))
                .collect();
            let usage: Vec<DailyUsage> = daily_usage(&persisted)
                .into_iter()
                .filter(|row| affected.contains(&(row.tag_id, row.device_id, row.day)))
                .collect();
            self.store.upsert_daily_usage(&usage).await?;
            report.usage_rows = usage.len();
        }

        report.purged = self.store.purge_samples_before(cutoff).await?;
        self.metrics.record_rollup(report.purged);
        Ok(report)
    }

    /// Roll up every interval until shutdown; the first pass runs at start
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = %self.interval.as_secs(),
            retention_days = %self.retention.num_days(),
            gap_seconds = %self.gap.num_seconds(),
            "rollup_started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once(Utc::now()).await {
                        Ok(report) if report.samples > 0 || report.purged > 0 => info!(
                            samples = %report.samples,
                            sessions = %report.sessions,
                            transitions = %report.transitions,
                            usage_rows = %report.usage_rows,
                            purged = %report.purged,
                            "rollup_done"
                        ),
                        Ok(_) => debug!("rollup_nothing_to_do"),
                        Err(e) => warn!(error = %e, "rollup_failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("rollup_shutdown");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{NewSample, SampleId};
    use crate::store::MemoryStore;
    use serde_json::Value;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn sample(id: i64, tag: i64, device: i64, at: DateTime<Utc>) -> DetectionSample {
        DetectionSample {
            id: SampleId(id),
            device_id: DeviceId(device),
            tag_id: TagId(tag),
            rssi: Some(-60),
            captured_at: at,
            raw: Value::Null,
        }
    }

    #[test]
    fn test_sessionize_splits_on_gap() {
        let samples = vec![
            sample(1, 1, 1, t(0)),
            sample(2, 1, 1, t(60)),
            sample(3, 1, 1, t(180)),
            sample(4, 1, 1, t(500)),
            sample(5, 1, 1, t(510)),
        ];
        let sessions = sessionize(&samples, chrono::Duration::seconds(120));
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].started_at, t(0));
        assert_eq!(sessions[0].ended_at, t(180));
        assert_eq!(sessions[0].duration_seconds, 180);
        assert_eq!(sessions[0].samples_count, 3);
        assert_eq!(sessions[1].duration_seconds, 10);
        assert_eq!(sessions[1].samples_count, 2);
    }

    #[test]
    fn test_sessionize_keys_by_tag_and_device() {
        let samples = vec![
            sample(1, 1, 1, t(0)),
            sample(2, 1, 2, t(10)),
            sample(3, 2, 1, t(20)),
            sample(4, 1, 1, t(30)),
        ];
        let sessions = sessionize(&samples, chrono::Duration::seconds(120));
        assert_eq!(sessions.len(), 3);
        // device 1 session for tag 1 is not broken by the visit to device 2
        assert_eq!(sessions[0].device_id, DeviceId(1));
        assert_eq!(sessions[0].samples_count, 2);
    }

    #[test]
    fn test_transitions_only_between_devices() {
        let samples = vec![
            sample(1, 1, 1, t(0)),
            sample(2, 1, 1, t(30)),
            sample(3, 1, 2, t(100)),
            sample(4, 1, 1, t(400)),
        ];
        let sessions = sessionize(&samples, chrono::Duration::seconds(60));
        assert_eq!(sessions.len(), 3);
        let transitions = derive_transitions(&sessions);
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].from_device_id, DeviceId(1));
        assert_eq!(transitions[0].to_device_id, DeviceId(2));
        assert_eq!(transitions[0].transition_start_at, t(30));
        assert_eq!(transitions[0].transition_end_at, t(100));
        assert_eq!(transitions[0].transition_seconds, 70);
        assert_eq!(transitions[1].to_device_id, DeviceId(1));
    }

    #[test]
    fn test_daily_usage_by_start_day() {
        let late = Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 0).unwrap();
        let samples = vec![
            sample(1, 1, 1, late),
            sample(2, 1, 1, late + chrono::Duration::seconds(90)),
            sample(3, 1, 1, late + chrono::Duration::hours(2)),
        ];
        let usage = daily_usage(&sessionize(&samples, chrono::Duration::seconds(120)));
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].day, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        assert_eq!(usage[0].total_dwell_seconds, 90);
        assert_eq!(usage[0].samples_count, 2);
        assert_eq!(usage[1].day, NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
        assert_eq!(usage[1].sessions_count, 1);
    }

    async fn seeded_store(times: &[i64]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for &secs in times {
            store
                .insert_sample(NewSample {
                    device_id: DeviceId(1),
                    tag_id: TagId(1),
                    rssi: Some(-60),
                    captured_at: t(secs),
                    raw: Value::Null,
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_run_once_rolls_up_then_purges() {
        let store = seeded_store(&[0, 30, 60]).await;
        let metrics = Arc::new(Metrics::new());
        let sessionizer =
            Sessionizer::with_settings(store.clone(), metrics, 30, 120, Duration::from_secs(3600));

        let now = t(60) + chrono::Duration::days(30) + chrono::Duration::seconds(1);
        let report = sessionizer.run_once(now).await.unwrap();
        assert_eq!(report.samples, 3);
        assert_eq!(report.sessions, 1);
        assert_eq!(report.purged, 3);
        assert!(store.samples().is_empty());
        assert_eq!(store.presence_sessions().len(), 1);
        assert_eq!(store.daily_usage()[0].total_dwell_seconds, 60);

        // rerun after the purge keeps the totals
        let again = sessionizer.run_once(now).await.unwrap();
        assert_eq!(again, RollupReport::default());
        assert_eq!(store.daily_usage().len(), 1);
        assert_eq!(store.daily_usage()[0].total_dwell_seconds, 60);
    }

    #[tokio::test]
    async fn test_recent_samples_untouched() {
        let store = seeded_store(&[0, 30]).await;
        let sessionizer = Sessionizer::with_settings(
            store.clone(),
            Arc::new(Metrics::new()),
            30,
            120,
            Duration::from_secs(3600),
        );
        let report = sessionizer.run_once(t(60)).await.unwrap();
        assert_eq!(report, RollupReport::default());
        assert_eq!(store.samples().len(), 2);
    }

    #[tokio::test]
    async fn test_later_run_adds_to_same_day() {
        let store = seeded_store(&[0, 30, 1000, 1010]).await;
        let sessionizer = Sessionizer::with_settings(
            store.clone(),
            Arc::new(Metrics::new()),
            30,
            120,
            Duration::from_secs(3600),
        );
        let retention = chrono::Duration::days(30);

        // first pass only sees the first visit
        sessionizer.run_once(t(500) + retention).await.unwrap();
        assert_eq!(store.daily_usage()[0].sessions_count, 1);

        sessionizer.run_once(t(2000) + retention).await.unwrap();
        let usage = store.daily_usage();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].sessions_count, 2);
        assert_eq!(usage[0].total_dwell_seconds, 40);
        assert_eq!(usage[0].samples_count, 4);
    }
}
