//! Location sample ingestion.
//!
//! For each sample the ingestor, while holding the (user, group) slot lock:
//!
//! 1. validates and normalizes the sample (`Rejected` on bad input)
//! 2. discards it as `Stale` unless it is newer than the last accepted one
//! 3. evaluates candidate geofences plus every geofence the user is inside,
//!    with memberships rebuilt from the activity log when the slot is new
//! 4. derives motion and periodic location events
//! 5. appends all events, persists the session, then commits the slot
//!
//! A failure in step 5 returns an error and leaves the slot untouched, so the
//! same sample can be redelivered; idempotent appends absorb whatever was
//! already written.

use super::activity_store::{ActivityEventStore, DedupConfig};
use super::geofence_index::{GeofenceIndex, IndexLookup};
use super::motion::{MotionDetectors, MotionEvaluator, MotionEvent};
use super::session_store::SessionStateStore;
use super::transition::{Transition, TransitionEvaluator};
use crate::config::FeatureFlags;
use crate::models::{
    ActivityType, DedupKey, Geofence, GeofenceId, LiveSession, LocationSample, MembershipState,
    NewActivityEvent, SessionStatus,
};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Ingestion configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Minimum spacing of `location_update` events in seconds; `None` disables them.
    pub location_update_interval_s: Option<u64>,
    /// Number of pipeline workers.
    pub workers: usize,
    /// Capacity of each worker's queue.
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            location_update_interval_s: Some(60),
            workers: 4,
            queue_capacity: 1_024,
        }
    }
}

/// A transition detected while ingesting a sample.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRecord {
    /// Geofence crossed.
    pub geofence_id: GeofenceId,
    /// Geofence name at the time of the crossing.
    pub geofence_name: String,
    /// Direction.
    pub transition: Transition,
    /// Distance from the geofence center in meters.
    pub distance_m: f64,
    /// `false` if an identical event had already been recorded.
    pub recorded: bool,
}

/// Result of ingesting one sample.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The sample updated the session.
    Accepted {
        /// Transitions detected, in geofence-ID order.
        transitions: Vec<TransitionRecord>,
        /// Number of activity events newly written.
        events: usize,
        /// `true` if geofences could not be read for this sample.
        index_degraded: bool,
    },
    /// The sample was not newer than the last accepted one.
    Stale,
    /// The sample failed validation.
    Rejected(String),
}

impl IngestOutcome {
    /// Metric label for this outcome.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Accepted {
                index_degraded: true,
                ..
            } => "degraded",
            Self::Accepted { .. } => "accepted",
            Self::Stale => "stale",
            Self::Rejected(_) => "rejected",
        }
    }

    /// Returns `true` if the sample was accepted.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Validates, sequences and evaluates location samples.
pub struct LocationIngestor {
    config: IngestConfig,
    features: FeatureFlags,
    dedup: DedupConfig,
    evaluator: TransitionEvaluator,
    motion: MotionEvaluator,
    index: Arc<GeofenceIndex>,
    sessions: Arc<SessionStateStore>,
    activity: Arc<ActivityEventStore>,
}

struct PendingTransition {
    geofence: Geofence,
    transition: Transition,
    distance_m: f64,
    state: MembershipState,
}

impl LocationIngestor {
    /// Creates an ingestor.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: IngestConfig,
        features: FeatureFlags,
        dedup: DedupConfig,
        evaluator: TransitionEvaluator,
        motion: MotionEvaluator,
        index: Arc<GeofenceIndex>,
        sessions: Arc<SessionStateStore>,
        activity: Arc<ActivityEventStore>,
    ) -> Self {
        Self {
            config,
            features,
            dedup,
            evaluator,
            motion,
            index,
            sessions,
            activity,
        }
    }

    /// Ingests one sample.
    ///
    /// Invalid and stale samples are not errors; see [`IngestOutcome`].
    ///
    /// # Errors
    ///
    /// Returns an error if the session or an event cannot be stored. The
    /// sample is then not considered accepted and may be redelivered.
    #[tracing::instrument(
        name = "ingest",
        skip(self, sample),
        fields(user_id = %sample.user_id, group_id = %sample.group_id, ts = %sample.timestamp)
    )]
    pub async fn ingest(&self, sample: LocationSample) -> Result<IngestOutcome> {
        let start = Instant::now();
        let result = self.ingest_inner(sample).await;
        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        metrics::counter!("ingest_samples_total", "outcome" => label).increment(1);
        metrics::histogram!("ingest_duration_ms", "outcome" => label)
            .record(start.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn ingest_inner(&self, sample: LocationSample) -> Result<IngestOutcome> {
        if sample.user_id.as_str().trim().is_empty() || sample.group_id.as_str().trim().is_empty() {
            return Ok(Self::reject("user_id and group_id are required".to_string()));
        }
        let sample = match sample.normalized() {
            Ok(sample) => sample,
            Err(reason) => return Ok(Self::reject(reason)),
        };

        let key = sample.key();
        let mut slot = self.sessions.lock(&key).await?;

        if let Some(last) = slot.last_accepted()
            && sample.timestamp <= last
        {
            tracing::debug!(last_accepted = %last, "Discarding stale sample");
            return Ok(IngestOutcome::Stale);
        }

        if slot.needs_memberships() {
            let restored = self.activity.memberships_for(&key).await?;
            if !restored.is_empty() {
                tracing::debug!(geofences = restored.len(), "Restored geofence memberships");
            }
            slot.restore_memberships(restored);
        }

        let position = sample.position();
        let lookup = self.index.candidates(&sample.group_id, &position).await;
        let index_degraded = lookup.is_unavailable();

        let transitions = match lookup {
            IndexLookup::Available { candidates, fences } => {
                let mut to_check: BTreeMap<GeofenceId, Geofence> = candidates
                    .into_iter()
                    .map(|fence| (fence.id.clone(), fence))
                    .collect();
                // Exits must be seen even when the point is far from the fence
                for id in slot.inside() {
                    if let Some(fence) = fences.get(id) {
                        to_check
                            .entry(id.clone())
                            .or_insert_with(|| fence.clone());
                    }
                }
                self.evaluate_fences(&slot.memberships, &sample, to_check.into_values())
            },
            IndexLookup::Unavailable => Vec::new(),
        };

        let detectors = MotionDetectors {
            speed: self.features.speed_alerts,
            harsh: self.features.harsh_driving,
        };
        let (motion_events, next_motion) =
            self.motion
                .evaluate(slot.motion, sample.speed, sample.timestamp, detectors);

        let location_due = self.location_update_due(slot.last_location_event, sample.timestamp);

        // Append every event before touching the session
        let mut events = 0;
        let mut records = Vec::with_capacity(transitions.len());
        let mut memberships = Vec::with_capacity(transitions.len());
        for pending in &transitions {
            let outcome = self
                .activity
                .append(self.transition_event(&sample, pending))
                .await?;
            if outcome.is_inserted() {
                events += 1;
            }
            // A duplicate from another sample in the same bucket leaves the
            // logged membership in place
            if outcome.is_inserted() || outcome.event().source_timestamp == sample.timestamp {
                memberships.push((pending.geofence.id.clone(), pending.state));
            }
            records.push(TransitionRecord {
                geofence_id: pending.geofence.id.clone(),
                geofence_name: pending.geofence.name.clone(),
                transition: pending.transition,
                distance_m: pending.distance_m,
                recorded: outcome.is_inserted(),
            });
        }
        for motion in &motion_events {
            if self
                .activity
                .append(Self::motion_event(&sample, motion))
                .await?
                .is_inserted()
            {
                events += 1;
            }
        }
        if location_due
            && self
                .activity
                .append(Self::location_event(&sample))
                .await?
                .is_inserted()
        {
            events += 1;
        }

        let next_session = Self::next_session(slot.session.as_ref(), &sample);
        self.sessions.persist(&next_session).await?;

        if slot
            .session
            .as_ref()
            .is_some_and(|prev| prev.status != SessionStatus::Active)
        {
            tracing::info!(session = %key, "Session reactivated");
        }

        slot.session = Some(next_session);
        slot.memberships.extend(memberships);
        slot.motion = next_motion;
        if location_due {
            slot.last_location_event = Some(sample.timestamp);
        }
        drop(slot);

        for record in &records {
            metrics::counter!(
                "geofence_transitions_total",
                "type" => record.transition.activity_type().as_str()
            )
            .increment(1);
            tracing::info!(
                geofence_id = %record.geofence_id,
                geofence = %record.geofence_name,
                transition = %record.transition.activity_type(),
                distance_m = record.distance_m,
                recorded = record.recorded,
                "Geofence transition"
            );
        }

        Ok(IngestOutcome::Accepted {
            transitions: records,
            events,
            index_degraded,
        })
    }

    fn reject(reason: String) -> IngestOutcome {
        tracing::warn!(reason = %reason, "Rejected location sample");
        IngestOutcome::Rejected(reason)
    }

    fn evaluate_fences(
        &self,
        memberships: &BTreeMap<GeofenceId, MembershipState>,
        sample: &LocationSample,
        fences: impl Iterator<Item = Geofence>,
    ) -> Vec<PendingTransition> {
        let position = sample.position();
        fences
            .filter_map(|geofence| {
                let prior = memberships.get(&geofence.id).copied().unwrap_or_default();
                if prior.changed_at.is_some_and(|changed| sample.timestamp <= changed) {
                    return None;
                }
                let eval = self
                    .evaluator
                    .evaluate(prior, &position, &geofence, sample.timestamp);
                eval.transition.map(|transition| PendingTransition {
                    geofence,
                    transition,
                    distance_m: eval.distance_m,
                    state: eval.state,
                })
            })
            .collect()
    }

    fn location_update_due(&self, last: Option<DateTime<Utc>>, at: DateTime<Utc>) -> bool {
        if !self.features.location_updates {
            return false;
        }
        let Some(interval_s) = self.config.location_update_interval_s else {
            return false;
        };
        let interval = Duration::seconds(i64::try_from(interval_s).unwrap_or(i64::MAX));
        last.is_none_or(|last| at - last >= interval)
    }

    fn transition_event(
        &self,
        sample: &LocationSample,
        pending: &PendingTransition,
    ) -> NewActivityEvent {
        let activity_type = pending.transition.activity_type();
        NewActivityEvent {
            user_id: sample.user_id.clone(),
            group_id: sample.group_id.clone(),
            activity_type,
            geofence_id: Some(pending.geofence.id.clone()),
            payload: serde_json::json!({
                "geofence_name": pending.geofence.name,
                "geofence_type": pending.geofence.kind.as_str(),
                "radius_m": pending.geofence.radius_m,
                "distance_m": pending.distance_m,
            }),
            position: Some(sample.position()),
            speed: sample.speed,
            source_timestamp: sample.timestamp,
            dedup_key: DedupKey::transition(
                &sample.user_id,
                &pending.geofence.id,
                activity_type,
                sample.timestamp,
                self.dedup.transition_bucket_ms,
            ),
        }
    }

    fn motion_event(sample: &LocationSample, motion: &MotionEvent) -> NewActivityEvent {
        Self::sample_event(
            sample,
            motion.activity_type,
            serde_json::json!({
                "speed_kmh": motion.speed_kmh,
                "rate_kmh_per_s": motion.rate_kmh_per_s,
            }),
        )
    }

    fn location_event(sample: &LocationSample) -> NewActivityEvent {
        Self::sample_event(
            sample,
            ActivityType::LocationUpdate,
            serde_json::json!({
                "heading": sample.heading,
                "battery": sample.battery,
            }),
        )
    }

    fn sample_event(
        sample: &LocationSample,
        activity_type: ActivityType,
        payload: serde_json::Value,
    ) -> NewActivityEvent {
        NewActivityEvent {
            user_id: sample.user_id.clone(),
            group_id: sample.group_id.clone(),
            activity_type,
            geofence_id: None,
            payload,
            position: Some(sample.position()),
            speed: sample.speed,
            source_timestamp: sample.timestamp,
            dedup_key: DedupKey::per_sample(
                &sample.user_id,
                &sample.group_id,
                activity_type,
                sample.timestamp,
            ),
        }
    }

    /// Session after accepting `sample`.
    ///
    /// An ended session is replaced by a fresh one; an open one (active or
    /// paused) keeps its start time.
    fn next_session(previous: Option<&LiveSession>, sample: &LocationSample) -> LiveSession {
        let base = match previous {
            Some(prev) if prev.is_open() => prev.clone(),
            _ => LiveSession::start(
                sample.user_id.clone(),
                sample.group_id.clone(),
                sample.timestamp,
            ),
        };
        LiveSession {
            position: Some(sample.position()),
            speed: sample.speed,
            heading: sample.heading,
            battery_level: sample.battery,
            status: SessionStatus::Active,
            last_update: sample.timestamp,
            ..base
        }
    }
}
