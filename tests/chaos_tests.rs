//! Chaos tests for concurrent ingestion.
//!
//! Many users and many tasks hit one tracker at once on a multi-threaded
//! runtime. The tests check that per-user sequencing holds, that racing
//! duplicate appends write one row, and that nothing deadlocks.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use geowatch::models::{
    ActivityType, Coordinate, DedupKey, Geofence, GeofenceKind, GroupId, LocationSample,
    NewActivityEvent, SessionKey, UserId,
};
use geowatch::services::IngestOutcome;
use geowatch::{FeatureFlags, GeowatchConfig, Tracker};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
}

fn home() -> Coordinate {
    Coordinate::new(-33.8688, 151.2093)
}

async fn tracker_with_fence() -> Arc<Tracker> {
    let config = GeowatchConfig::default().with_features(FeatureFlags::none());
    let tracker = Tracker::in_memory(config).unwrap();
    tracker
        .index()
        .upsert_geofence(
            Geofence::new(GroupId::new("fam"), "home", home(), 150, GeofenceKind::Safe)
                .with_id("home"),
        )
        .await
        .unwrap();
    Arc::new(tracker)
}

fn distance_for(step: i64) -> f64 {
    if step % 2 == 0 { 50.0 } else { 600.0 }
}

/// Test: independent users ingesting in parallel each get their own log.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_users_keep_independent_state() {
    let tracker = tracker_with_fence().await;
    let users = 24;
    let steps = 10_i64;

    let handles: Vec<_> = (0..users)
        .map(|u| {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                for step in 0..steps {
                    let sample = LocationSample::new(
                        format!("user-{u}"),
                        "fam",
                        home().offset_north(distance_for(step)),
                        t0() + Duration::seconds(step * 5),
                    );
                    let outcome = tracker.ingestor().ingest(sample).await.unwrap();
                    assert!(outcome.is_accepted());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(
        tracker.activity().count().await.unwrap(),
        users * usize::try_from(steps).unwrap()
    );
    for u in 0..users {
        let user = UserId::new(format!("user-{u}"));
        let feed = tracker.activity().recent_for(&user, 100).await.unwrap();
        assert_eq!(feed.len(), 10);
        assert!(feed.iter().all(|e| e.user_id == user));
        assert!(
            feed.windows(2)
                .all(|pair| pair[0].activity_type != pair[1].activity_type)
        );
    }
}

/// Test: racing samples of one user are serialized; the newest wins.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_samples_of_one_user() {
    let tracker = tracker_with_fence().await;
    let stale = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..32_i64)
        .map(|i| {
            let tracker = Arc::clone(&tracker);
            let stale = Arc::clone(&stale);
            tokio::spawn(async move {
                // Reverse submission order makes most samples arrive late
                let step = 31 - i;
                let sample = LocationSample::new(
                    "alice",
                    "fam",
                    home().offset_north(distance_for(step)),
                    t0() + Duration::seconds(step),
                );
                if tracker.ingestor().ingest(sample).await.unwrap() == IngestOutcome::Stale {
                    stale.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let session = tracker
        .sessions()
        .snapshot(&SessionKey::new(UserId::new("alice"), GroupId::new("fam")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.last_update, t0() + Duration::seconds(31));

    let feed = tracker
        .activity()
        .recent_for(&UserId::new("alice"), 100)
        .await
        .unwrap();
    let accepted = 32 - stale.load(Ordering::SeqCst);
    assert!(feed.len() <= accepted);
    let mut ordered = feed.clone();
    ordered.reverse();
    assert!(
        ordered
            .windows(2)
            .all(|pair| pair[0].source_timestamp < pair[1].source_timestamp)
    );
    assert!(
        ordered
            .windows(2)
            .all(|pair| pair[0].activity_type != pair[1].activity_type)
    );
}

/// Test: concurrent appends of one event write exactly one row.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_appends_race_to_one_row() {
    let tracker = tracker_with_fence().await;
    let mut alerts = tracker.dispatcher().subscribe();
    let inserted = Arc::new(AtomicUsize::new(0));

    let event = || {
        let user_id = UserId::new("alice");
        let group_id = GroupId::new("fam");
        NewActivityEvent {
            dedup_key: DedupKey::per_sample(&user_id, &group_id, ActivityType::SpeedAlert, t0()),
            user_id,
            group_id,
            activity_type: ActivityType::SpeedAlert,
            geofence_id: None,
            payload: serde_json::json!({ "speed_kmh": 88.0 }),
            position: Some(home()),
            speed: Some(88.0),
            source_timestamp: t0(),
        }
    };

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let tracker = Arc::clone(&tracker);
            let inserted = Arc::clone(&inserted);
            let event = event();
            tokio::spawn(async move {
                if tracker.activity().append(event).await.unwrap().is_inserted() {
                    inserted.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(inserted.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.activity().count().await.unwrap(), 1);
    assert!(alerts.recv().await.is_ok());
    assert!(alerts.try_recv().is_err());
}

/// Test: heartbeat sweeps running alongside ingestion do not deadlock.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sweeps_during_ingestion_complete() {
    let tracker = tracker_with_fence().await;

    let ingest = {
        let tracker = Arc::clone(&tracker);
        tokio::spawn(async move {
            for step in 0..200_i64 {
                let sample = LocationSample::new(
                    format!("user-{}", step % 8),
                    "fam",
                    home().offset_north(distance_for(step / 8)),
                    t0() + Duration::seconds(step),
                );
                tracker.ingestor().ingest(sample).await.unwrap();
            }
        })
    };
    let sweeps = {
        let tracker = Arc::clone(&tracker);
        tokio::spawn(async move {
            for _ in 0..50 {
                tracker.heartbeat().sweep_once().await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    tokio::time::timeout(std::time::Duration::from_secs(30), async {
        ingest.await.unwrap();
        sweeps.await.unwrap();
    })
    .await
    .expect("ingestion and sweeps finished");

    // Samples are far in the past, so sweeps may end and evict any of them
    let persisted = tracker
        .sessions()
        .sessions_for_group(&GroupId::new("fam"))
        .await
        .unwrap();
    assert_eq!(persisted.len(), 8);
    assert!(tracker.sessions().len() <= 8);
    for user in 0..8 {
        let feed = tracker
            .activity()
            .recent_for(&UserId::new(format!("user-{user}")), 100)
            .await
            .unwrap();
        let toggles = feed
            .windows(2)
            .all(|pair| pair[0].activity_type != pair[1].activity_type);
        assert!(toggles, "user-{user} log does not alternate");
    }
}
