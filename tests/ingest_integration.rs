//! End-to-end ingestion tests over in-memory `SQLite`.
//!
//! Covers the tracking scenarios (entry, exit, heartbeat, out-of-order),
//! boundary hysteresis, idempotent replay and redelivery, restarts, the
//! transition bucket trade-off, degraded geofence reads, motion events and
//! pipeline draining.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use geowatch::alerts::{AlertSink, DeliveryResult};
use geowatch::models::{
    ActivityEvent, ActivityType, Coordinate, Geofence, GeofenceId, GeofenceKind, GroupId,
    LocationSample, SessionKey, SessionStatus, UserId,
};
use geowatch::services::{IngestOutcome, Transition, Tracker};
use geowatch::storage::sqlite::{SqliteActivityBackend, SqliteSessionBackend};
use geowatch::storage::{
    ActivityBackend, GeofenceBackend, SequencedEvent, SessionBackend, StorageBackends,
    StorageResilienceConfig, StoredAppend,
};
use geowatch::{Clock, Error, FeatureFlags, GeowatchConfig, ManualClock, Result};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
}

fn home() -> Coordinate {
    Coordinate::new(28.6139, 77.2090)
}

fn group() -> GroupId {
    GroupId::new("fam")
}

fn quiet_config() -> GeowatchConfig {
    GeowatchConfig::default().with_features(FeatureFlags::none())
}

struct Harness {
    tracker: Tracker,
    clock: Arc<ManualClock>,
    backends: StorageBackends,
}

impl Harness {
    fn new(config: GeowatchConfig) -> Self {
        let backends = StorageBackends::in_memory(&config.storage.resilience).unwrap();
        Self::with_backends(config, backends)
    }

    fn with_backends(config: GeowatchConfig, backends: StorageBackends) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = Tracker::with_clock(config, backends.clone(), Arc::clone(&clock) as Arc<dyn Clock>);
        Self {
            tracker,
            clock,
            backends,
        }
    }

    async fn add_fence(&self, id: &str, radius_m: u32) {
        self.tracker
            .index()
            .upsert_geofence(
                Geofence::new(group(), id, home(), radius_m, GeofenceKind::Safe).with_id(id),
            )
            .await
            .unwrap();
    }

    async fn ingest(&self, distance_m: f64, at: DateTime<Utc>) -> IngestOutcome {
        self.ingest_sample(sample("alice", distance_m, at)).await
    }

    async fn ingest_sample(&self, sample: LocationSample) -> IngestOutcome {
        self.tracker.ingestor().ingest(sample).await.unwrap()
    }

    async fn events(&self) -> Vec<ActivityEvent> {
        let mut events = self
            .tracker
            .activity()
            .recent_for_group(&group(), 1_000)
            .await
            .unwrap();
        events.reverse();
        events
    }

    async fn session(&self, user: &str) -> geowatch::LiveSession {
        self.tracker
            .sessions()
            .snapshot(&SessionKey::new(UserId::new(user), group()))
            .await
            .unwrap()
            .expect("session exists")
    }
}

fn sample(user: &str, distance_m: f64, at: DateTime<Utc>) -> LocationSample {
    LocationSample::new(user, "fam", home().offset_north(distance_m), at)
}

fn transitions(outcome: &IngestOutcome) -> Vec<Transition> {
    match outcome {
        IngestOutcome::Accepted { transitions, .. } => {
            transitions.iter().map(|t| t.transition).collect()
        },
        other => panic!("expected accepted sample, got {other:?}"),
    }
}

fn types(events: &[ActivityEvent]) -> Vec<ActivityType> {
    events.iter().map(|e| e.activity_type).collect()
}

#[tokio::test]
async fn test_entry_creates_one_event_and_active_session() {
    let h = Harness::new(quiet_config());
    h.add_fence("home", 200).await;

    let outcome = h.ingest(500.0, t0()).await;
    assert!(transitions(&outcome).is_empty());

    let outcome = h.ingest(150.0, t0() + Duration::seconds(10)).await;
    assert_eq!(transitions(&outcome), vec![Transition::Entered]);

    let events = h.events().await;
    assert_eq!(types(&events), vec![ActivityType::GeofenceEntry]);
    assert_eq!(events[0].geofence_id, Some(GeofenceId::new("home")));
    assert_eq!(events[0].source_timestamp, t0() + Duration::seconds(10));

    let session = h.session("alice").await;
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.last_update, t0() + Duration::seconds(10));
}

#[tokio::test]
async fn test_exit_beyond_margin_creates_one_event() {
    let h = Harness::new(quiet_config());
    h.add_fence("home", 200).await;

    h.ingest(150.0, t0()).await;
    let outcome = h.ingest(250.0, t0() + Duration::seconds(10)).await;
    assert_eq!(transitions(&outcome), vec![Transition::Exited]);

    let outcome = h.ingest(400.0, t0() + Duration::seconds(20)).await;
    assert!(transitions(&outcome).is_empty());

    assert_eq!(
        types(&h.events().await),
        vec![ActivityType::GeofenceEntry, ActivityType::GeofenceExit]
    );
}

#[tokio::test]
async fn test_heartbeat_marks_silent_session_inactive_without_events() {
    let h = Harness::new(quiet_config());
    h.add_fence("home", 200).await;
    h.ingest(150.0, t0()).await;
    let before = h.tracker.activity().count().await.unwrap();

    h.clock.set(t0() + Duration::seconds(60));
    assert_eq!(h.tracker.heartbeat().sweep_once().await.unwrap().inactivated, 0);

    h.clock.set(t0() + Duration::seconds(130));
    let report = h.tracker.heartbeat().sweep_once().await.unwrap();
    assert_eq!(report.inactivated, 1);

    let session = h.session("alice").await;
    assert_eq!(session.status, SessionStatus::Inactive);
    assert_eq!(session.session_end, Some(t0() + Duration::seconds(130)));
    assert_eq!(h.tracker.activity().count().await.unwrap(), before);

    // A new sample reopens the session
    h.ingest(150.0, t0() + Duration::seconds(200)).await;
    let session = h.session("alice").await;
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.session_start, t0() + Duration::seconds(200));
    assert!(session.session_end.is_none());
}

#[tokio::test]
async fn test_out_of_order_sample_is_ignored() {
    let h = Harness::new(quiet_config());
    h.add_fence("home", 200).await;

    let at = t0() + Duration::seconds(30);
    h.ingest(150.0, at).await;
    let late = h.ingest(500.0, at - Duration::seconds(5)).await;
    assert_eq!(late, IngestOutcome::Stale);

    let equal = h.ingest(500.0, at).await;
    assert_eq!(equal, IngestOutcome::Stale);

    let session = h.session("alice").await;
    assert_eq!(session.last_update, at);
    assert_eq!(types(&h.events().await), vec![ActivityType::GeofenceEntry]);
}

#[tokio::test]
async fn test_boundary_hover_does_not_flap() {
    let h = Harness::new(quiet_config());
    h.add_fence("pond", 100).await;

    // Margin is max(5, 0.05 * 100) = 5 m
    let path = [50.0, 103.0, 98.0, 104.9, 99.0, 106.0, 103.0, 101.0, 99.0];
    for (i, distance) in path.iter().enumerate() {
        h.ingest(*distance, t0() + Duration::seconds(i as i64 * 10)).await;
    }

    assert_eq!(
        types(&h.events().await),
        vec![
            ActivityType::GeofenceEntry,
            ActivityType::GeofenceExit,
            ActivityType::GeofenceEntry,
        ]
    );
}

#[tokio::test]
async fn test_deactivated_fence_is_not_evaluated() {
    let h = Harness::new(quiet_config());
    h.add_fence("home", 200).await;
    h.ingest(150.0, t0()).await;

    h.tracker
        .index()
        .set_active(&GeofenceId::new("home"), false)
        .await
        .unwrap();
    let outcome = h.ingest(900.0, t0() + Duration::seconds(10)).await;
    assert!(transitions(&outcome).is_empty());
    assert_eq!(types(&h.events().await), vec![ActivityType::GeofenceEntry]);
}

#[tokio::test]
async fn test_unrelated_users_do_not_interfere() {
    let h = Harness::new(quiet_config());
    h.add_fence("home", 200).await;

    h.ingest_sample(sample("alice", 100.0, t0() + Duration::seconds(60))).await;
    let bob = h.ingest_sample(sample("bob", 100.0, t0())).await;
    assert_eq!(transitions(&bob), vec![Transition::Entered]);

    let alice_feed = h
        .tracker
        .activity()
        .recent_for(&UserId::new("alice"), 10)
        .await
        .unwrap();
    assert_eq!(alice_feed.len(), 1);
}

#[tokio::test]
async fn test_replay_after_state_loss_writes_nothing_new() {
    let config = quiet_config();
    let h = Harness::new(config.clone());
    h.add_fence("home", 200).await;

    let script = [(500.0, 0), (150.0, 10), (120.0, 20), (260.0, 30), (180.0, 40)];
    for (distance, secs) in script {
        h.ingest(distance, t0() + Duration::seconds(secs)).await;
    }
    let original = h.events().await;
    assert_eq!(original.len(), 3);

    // Same geofences and log, live session state lost
    let backends = StorageBackends::new(
        Arc::clone(&h.backends.geofences),
        Arc::new(SqliteSessionBackend::in_memory().unwrap()),
        Arc::clone(&h.backends.activity),
    );
    let replay = Harness::with_backends(config, backends);
    for (distance, secs) in script {
        let outcome = replay.ingest(distance, t0() + Duration::seconds(secs)).await;
        if let IngestOutcome::Accepted {
            transitions,
            events,
            ..
        } = outcome
        {
            assert_eq!(events, 0);
            assert!(transitions.iter().all(|t| !t.recorded));
        }
    }

    let replayed = replay.events().await;
    let ids = |events: &[ActivityEvent]| events.iter().map(|e| e.id.clone()).collect::<Vec<_>>();
    assert_eq!(ids(&replayed), ids(&original));
}

/// Activity backend that fails appends while `failing` is set.
struct FlakyActivity {
    inner: SqliteActivityBackend,
    failing: AtomicBool,
}

impl ActivityBackend for FlakyActivity {
    fn append(&self, event: &ActivityEvent) -> Result<StoredAppend> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::OperationFailed {
                operation: "append".to_string(),
                cause: "disk I/O error".to_string(),
            });
        }
        self.inner.append(event)
    }

    fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<ActivityEvent>> {
        self.inner.find_by_dedup_key(dedup_key)
    }

    fn recent_for_user(&self, user_id: &UserId, limit: usize) -> Result<Vec<ActivityEvent>> {
        self.inner.recent_for_user(user_id, limit)
    }

    fn recent_for_group(&self, group_id: &GroupId, limit: usize) -> Result<Vec<ActivityEvent>> {
        self.inner.recent_for_group(group_id, limit)
    }

    fn last_created_at(&self, user_id: &UserId) -> Result<Option<DateTime<Utc>>> {
        self.inner.last_created_at(user_id)
    }

    fn last_transitions(&self, user_id: &UserId, group_id: &GroupId) -> Result<Vec<ActivityEvent>> {
        self.inner.last_transitions(user_id, group_id)
    }

    fn events_since(
        &self,
        since: DateTime<Utc>,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<SequencedEvent>> {
        self.inner.events_since(since, after_seq, limit)
    }

    fn count(&self) -> Result<usize> {
        self.inner.count()
    }
}

#[tokio::test]
async fn test_failed_append_allows_redelivery() {
    let config = quiet_config();
    let memory = StorageBackends::in_memory(&StorageResilienceConfig::default()).unwrap();
    let flaky = Arc::new(FlakyActivity {
        inner: SqliteActivityBackend::in_memory().unwrap(),
        failing: AtomicBool::new(false),
    });
    let backends = StorageBackends::new(
        memory.geofences,
        memory.sessions,
        Arc::clone(&flaky) as Arc<dyn ActivityBackend>,
    );
    let h = Harness::with_backends(config, backends);
    h.add_fence("home", 200).await;
    h.ingest(500.0, t0()).await;

    flaky.failing.store(true, Ordering::SeqCst);
    let entering = sample("alice", 150.0, t0() + Duration::seconds(10));
    let err = h.tracker.ingestor().ingest(entering.clone()).await;
    assert!(err.is_err());
    assert_eq!(h.session("alice").await.last_update, t0());

    flaky.failing.store(false, Ordering::SeqCst);
    let outcome = h.ingest_sample(entering.clone()).await;
    assert_eq!(transitions(&outcome), vec![Transition::Entered]);

    // Redelivering an applied sample is a no-op
    assert_eq!(h.ingest_sample(entering).await, IngestOutcome::Stale);
    assert_eq!(types(&h.events().await), vec![ActivityType::GeofenceEntry]);
}

#[tokio::test]
async fn test_restart_keeps_membership_from_log() {
    let config = quiet_config();
    let h = Harness::new(config.clone());
    h.add_fence("home", 200).await;
    h.ingest(100.0, t0()).await;

    // Same storage, fresh process; the user is still inside
    let restarted = Harness::with_backends(config, h.backends.clone());
    let outcome = restarted.ingest(100.0, t0() + Duration::seconds(30)).await;
    assert!(transitions(&outcome).is_empty());

    let outcome = restarted.ingest(400.0, t0() + Duration::seconds(60)).await;
    assert_eq!(transitions(&outcome), vec![Transition::Exited]);
    assert_eq!(
        types(&restarted.events().await),
        vec![ActivityType::GeofenceEntry, ActivityType::GeofenceExit]
    );
}

#[tokio::test]
async fn test_coarse_bucket_suppresses_rapid_reentry() {
    let mut config = quiet_config();
    config.dedup.transition_bucket_ms = 60_000;
    let h = Harness::new(config);
    h.add_fence("home", 200).await;

    h.ingest(100.0, t0()).await;
    h.ingest(400.0, t0() + Duration::seconds(10)).await;
    let reentry = h.ingest(100.0, t0() + Duration::seconds(20)).await;
    match reentry {
        IngestOutcome::Accepted { transitions, .. } => assert!(!transitions[0].recorded),
        other => panic!("unexpected {other:?}"),
    }
    // The suppressed entry leaves the user outside, so no second exit
    let leave = h.ingest(400.0, t0() + Duration::seconds(70)).await;
    assert!(transitions(&leave).is_empty());
    assert_eq!(
        types(&h.events().await),
        vec![ActivityType::GeofenceEntry, ActivityType::GeofenceExit]
    );

    // Next bucket: the entry is recorded again and the log keeps alternating
    h.ingest(100.0, t0() + Duration::seconds(130)).await;
    h.ingest(400.0, t0() + Duration::seconds(140)).await;
    assert_eq!(
        types(&h.events().await),
        [ActivityType::GeofenceEntry, ActivityType::GeofenceExit].repeat(2)
    );

    let fine = Harness::new(quiet_config());
    fine.add_fence("home", 200).await;
    fine.ingest(100.0, t0()).await;
    fine.ingest(400.0, t0() + Duration::seconds(10)).await;
    fine.ingest(100.0, t0() + Duration::seconds(20)).await;
    assert_eq!(fine.events().await.len(), 3);
}

#[tokio::test]
async fn test_heartbeat_ends_sessions_left_active_before_restart() {
    let config = quiet_config();
    let h = Harness::new(config.clone());
    h.add_fence("home", 200).await;
    h.ingest(100.0, t0()).await;
    h.ingest_sample(sample("bob", 100.0, t0() + Duration::seconds(100))).await;

    let reopened = Harness::with_backends(config, h.backends.clone());
    assert!(reopened.tracker.sessions().is_empty());
    reopened.clock.set(t0() + Duration::seconds(150));
    let report = reopened.tracker.heartbeat().sweep_once().await.unwrap();
    assert_eq!(report.inactivated, 1);

    let alice = h
        .backends
        .sessions
        .load(&SessionKey::new(UserId::new("alice"), group()))
        .unwrap()
        .unwrap();
    assert_eq!(alice.status, SessionStatus::Inactive);
    assert_eq!(alice.session_end, Some(t0() + Duration::seconds(150)));
    assert_eq!(reopened.session("bob").await.status, SessionStatus::Active);
}

#[tokio::test]
async fn test_heartbeat_releases_ended_sessions() {
    let h = Harness::new(quiet_config());
    h.add_fence("home", 200).await;
    for i in 0..5 {
        h.ingest_sample(sample(&format!("user-{i}"), 100.0, t0())).await;
    }
    h.ingest_sample(sample("late", 100.0, t0() + Duration::seconds(100))).await;
    assert_eq!(h.tracker.sessions().len(), 6);
    assert_eq!(h.tracker.activity().tracked_users(), 6);

    h.clock.set(t0() + Duration::seconds(150));
    let report = h.tracker.heartbeat().sweep_once().await.unwrap();
    assert_eq!(report.inactivated, 5);
    assert_eq!(report.evicted.len(), 5);
    assert_eq!(h.tracker.sessions().len(), 1);
    assert_eq!(h.tracker.activity().tracked_users(), 1);

    // A released user comes back inside without a second entry
    let outcome = h
        .ingest_sample(sample("user-0", 100.0, t0() + Duration::seconds(200)))
        .await;
    assert!(transitions(&outcome).is_empty());
    assert_eq!(h.session("user-0").await.status, SessionStatus::Active);
    assert_eq!(h.tracker.sessions().len(), 2);
}

/// Geofence backend whose reads always fail.
struct BrokenGeofences;

impl GeofenceBackend for BrokenGeofences {
    fn upsert(&self, _geofence: &Geofence) -> Result<()> {
        Err(Error::Unavailable("geofences offline".to_string()))
    }

    fn get(&self, _id: &GeofenceId) -> Result<Option<Geofence>> {
        Err(Error::Unavailable("geofences offline".to_string()))
    }

    fn set_active(&self, _id: &GeofenceId, _active: bool) -> Result<bool> {
        Err(Error::Unavailable("geofences offline".to_string()))
    }

    fn list_active(&self, _group_id: &GroupId) -> Result<Vec<Geofence>> {
        Err(Error::Unavailable("geofences offline".to_string()))
    }

    fn list_all(&self, _group_id: &GroupId) -> Result<Vec<Geofence>> {
        Err(Error::Unavailable("geofences offline".to_string()))
    }
}

#[tokio::test]
async fn test_unavailable_index_degrades_but_updates_session() {
    let memory = StorageBackends::in_memory(&StorageResilienceConfig::default()).unwrap();
    let backends = StorageBackends::new(Arc::new(BrokenGeofences), memory.sessions, memory.activity);
    let h = Harness::with_backends(quiet_config(), backends);

    let outcome = h.ingest(10.0, t0()).await;
    assert_eq!(
        outcome,
        IngestOutcome::Accepted {
            transitions: Vec::new(),
            events: 0,
            index_degraded: true,
        }
    );
    assert_eq!(outcome.label(), "degraded");
    assert_eq!(h.session("alice").await.last_update, t0());
}

#[tokio::test]
async fn test_invalid_sample_is_rejected_without_state_change() {
    let h = Harness::new(quiet_config());
    let bad = LocationSample::new("alice", "fam", Coordinate::new(95.0, 10.0), t0());
    assert!(matches!(
        h.ingest_sample(bad).await,
        IngestOutcome::Rejected(_)
    ));

    let negative = sample("alice", 10.0, t0()).with_speed(-4.0);
    assert!(matches!(
        h.ingest_sample(negative).await,
        IngestOutcome::Rejected(_)
    ));

    let anonymous = LocationSample::new("", "fam", home(), t0());
    assert!(matches!(
        h.ingest_sample(anonymous).await,
        IngestOutcome::Rejected(_)
    ));

    assert!(
        h.tracker
            .sessions()
            .snapshot(&SessionKey::new(UserId::new("alice"), group()))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_motion_and_location_events() {
    let mut config = GeowatchConfig::default();
    config.ingest.location_update_interval_s = Some(60);
    let h = Harness::new(config);

    let speeds = [(0, 30.0), (2, 60.0), (30, 65.0), (32, 35.0), (90, 40.0)];
    for (secs, speed) in speeds {
        h.ingest_sample(sample("alice", 1_000.0, t0() + Duration::seconds(secs)).with_speed(speed))
            .await;
    }

    assert_eq!(
        types(&h.events().await),
        vec![
            ActivityType::LocationUpdate,
            ActivityType::SpeedAlert,
            ActivityType::HarshAcceleration,
            ActivityType::HarshBraking,
            ActivityType::LocationUpdate,
        ]
    );
    let session = h.session("alice").await;
    assert_eq!(session.speed, Some(40.0));
}

#[tokio::test]
async fn test_disabled_features_emit_transitions_only() {
    let h = Harness::new(quiet_config());
    h.add_fence("home", 200).await;
    h.ingest_sample(sample("alice", 100.0, t0()).with_speed(120.0)).await;
    h.ingest_sample(sample("alice", 100.0, t0() + Duration::seconds(1)).with_speed(10.0))
        .await;
    assert_eq!(types(&h.events().await), vec![ActivityType::GeofenceEntry]);
}

struct RecordingSink {
    seen: Mutex<Vec<ActivityEvent>>,
}

impl AlertSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn deliver(&self, event: &ActivityEvent) -> Result<DeliveryResult> {
        self.seen.lock().unwrap().push(event.clone());
        Ok(DeliveryResult::success(None, 1, 0))
    }
}

#[tokio::test]
async fn test_pipeline_drains_on_shutdown_and_alerts_every_event() {
    let h = Harness::new(quiet_config());
    h.add_fence("home", 200).await;
    let sink = Arc::new(RecordingSink {
        seen: Mutex::new(Vec::new()),
    });
    let runtime = h
        .tracker
        .start_with_sinks(vec![Arc::clone(&sink) as Arc<dyn AlertSink>]);

    let users: Vec<String> = (0..8).map(|i| format!("user-{i}")).collect();
    for step in 0..6_i64 {
        let distance = if step % 2 == 0 { 100.0 } else { 400.0 };
        for user in &users {
            runtime
                .pipeline()
                .submit(sample(user, distance, t0() + Duration::seconds(step * 10)))
                .unwrap();
        }
    }
    runtime.shutdown().await;

    // Every user entered and exited three times
    assert_eq!(h.tracker.activity().count().await.unwrap(), 8 * 6);
    for user in &users {
        let feed = h
            .tracker
            .activity()
            .recent_for(&UserId::new(user.as_str()), 10)
            .await
            .unwrap();
        let mut kinds = types(&feed);
        kinds.reverse();
        assert_eq!(
            kinds,
            [
                ActivityType::GeofenceEntry,
                ActivityType::GeofenceExit,
            ]
            .repeat(3)
        );
    }
    assert_eq!(sink.seen.lock().unwrap().len(), 8 * 6);
}

#[tokio::test]
async fn test_submit_after_shutdown_is_unavailable() {
    let h = Harness::new(quiet_config());
    let runtime = h.tracker.start_with_sinks(Vec::new());
    let pipeline = Arc::clone(runtime.pipeline());
    runtime.shutdown().await;

    assert!(pipeline.is_closed());
    assert!(matches!(
        pipeline.submit(sample("alice", 0.0, t0())),
        Err(Error::Unavailable(_))
    ));
}
