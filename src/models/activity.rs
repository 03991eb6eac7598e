//! Activity log events.

use super::{Coordinate, EventId, GeofenceId, GroupId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Kind of activity event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    /// The member entered a geofence.
    GeofenceEntry,
    /// The member left a geofence.
    GeofenceExit,
    /// The member exceeded the configured speed limit.
    SpeedAlert,
    /// Deceleration above the harsh-braking threshold.
    HarshBraking,
    /// Acceleration above the harsh-acceleration threshold.
    HarshAcceleration,
    /// Periodic position record.
    LocationUpdate,
}

impl ActivityType {
    /// Returns the storage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::GeofenceEntry => "geofence_entry",
            Self::GeofenceExit => "geofence_exit",
            Self::SpeedAlert => "speed_alert",
            Self::HarshBraking => "harsh_braking",
            Self::HarshAcceleration => "harsh_acceleration",
            Self::LocationUpdate => "location_update",
        }
    }

    /// Parses a stored type name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "geofence_entry" => Some(Self::GeofenceEntry),
            "geofence_exit" => Some(Self::GeofenceExit),
            "speed_alert" => Some(Self::SpeedAlert),
            "harsh_braking" => Some(Self::HarshBraking),
            "harsh_acceleration" => Some(Self::HarshAcceleration),
            "location_update" => Some(Self::LocationUpdate),
            _ => None,
        }
    }

    /// Returns `true` for geofence entry and exit.
    #[must_use]
    pub const fn is_transition(&self) -> bool {
        matches!(self, Self::GeofenceEntry | Self::GeofenceExit)
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deduplication keys for the activity log.
///
/// Keys are SHA-256 hex digests so that the stored column has a fixed width
/// regardless of identifier lengths.
pub struct DedupKey;

impl DedupKey {
    /// Key for a transition event: (user, geofence, type, time bucket).
    ///
    /// Two transitions of the same type for the same pair within one bucket
    /// collapse into one row.
    #[must_use]
    pub fn transition(
        user_id: &UserId,
        geofence_id: &GeofenceId,
        activity_type: ActivityType,
        source_timestamp: DateTime<Utc>,
        bucket_ms: u64,
    ) -> String {
        let width = i64::try_from(bucket_ms.max(1)).unwrap_or(i64::MAX);
        let bucket = source_timestamp.timestamp_millis().div_euclid(width);
        Self::digest(&[
            "transition",
            user_id.as_str(),
            geofence_id.as_str(),
            activity_type.as_str(),
            &bucket.to_string(),
        ])
    }

    /// Key for any other event: (user, group, type, exact source timestamp).
    #[must_use]
    pub fn per_sample(
        user_id: &UserId,
        group_id: &GroupId,
        activity_type: ActivityType,
        source_timestamp: DateTime<Utc>,
    ) -> String {
        Self::digest(&[
            "sample",
            user_id.as_str(),
            group_id.as_str(),
            activity_type.as_str(),
            &source_timestamp.timestamp_millis().to_string(),
        ])
    }

    fn digest(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            // Unit separator keeps ("ab", "c") distinct from ("a", "bc")
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }
}

/// An event ready to be appended; the store assigns identity and creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewActivityEvent {
    /// User the event is about.
    pub user_id: UserId,
    /// Group the event belongs to.
    pub group_id: GroupId,
    /// Event kind.
    pub activity_type: ActivityType,
    /// Geofence for transition events.
    pub geofence_id: Option<GeofenceId>,
    /// Free-form details.
    pub payload: serde_json::Value,
    /// Position of the generating sample.
    pub position: Option<Coordinate>,
    /// Speed of the generating sample in km/h.
    pub speed: Option<f64>,
    /// Source timestamp of the generating sample.
    pub source_timestamp: DateTime<Utc>,
    /// Idempotency key.
    pub dedup_key: String,
}

/// A durable activity log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Unique identifier.
    pub id: EventId,
    /// User the event is about.
    pub user_id: UserId,
    /// Group the event belongs to.
    pub group_id: GroupId,
    /// Event kind.
    pub activity_type: ActivityType,
    /// Geofence for transition events.
    pub geofence_id: Option<GeofenceId>,
    /// Free-form details.
    pub payload: serde_json::Value,
    /// Position of the generating sample.
    pub position: Option<Coordinate>,
    /// Speed of the generating sample in km/h.
    pub speed: Option<f64>,
    /// Source timestamp of the generating sample.
    pub source_timestamp: DateTime<Utc>,
    /// Creation time assigned by the store; non-decreasing per user.
    pub created_at: DateTime<Utc>,
    /// Idempotency key.
    pub dedup_key: String,
}

impl ActivityEvent {
    /// Materializes a new event with a fresh identifier.
    #[must_use]
    pub fn from_new(event: NewActivityEvent, created_at: DateTime<Utc>) -> Self {
        Self {
            id: EventId::generate(),
            user_id: event.user_id,
            group_id: event.group_id,
            activity_type: event.activity_type,
            geofence_id: event.geofence_id,
            payload: event.payload,
            position: event.position,
            speed: event.speed,
            source_timestamp: event.source_timestamp,
            created_at,
            dedup_key: event.dedup_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_type_roundtrip() {
        for t in [
            ActivityType::GeofenceEntry,
            ActivityType::GeofenceExit,
            ActivityType::SpeedAlert,
            ActivityType::HarshBraking,
            ActivityType::HarshAcceleration,
            ActivityType::LocationUpdate,
        ] {
            assert_eq!(ActivityType::parse(t.as_str()), Some(t));
        }
        assert!(ActivityType::GeofenceExit.is_transition());
        assert!(!ActivityType::SpeedAlert.is_transition());
    }

    #[test]
    fn test_transition_key_buckets() {
        let user = UserId::new("alice");
        let fence = GeofenceId::new("home");
        let a = DedupKey::transition(&user, &fence, ActivityType::GeofenceEntry, t0(), 1_000);
        let same_bucket = DedupKey::transition(
            &user,
            &fence,
            ActivityType::GeofenceEntry,
            t0() + Duration::milliseconds(999),
            1_000,
        );
        let next_bucket = DedupKey::transition(
            &user,
            &fence,
            ActivityType::GeofenceEntry,
            t0() + Duration::milliseconds(1_000),
            1_000,
        );
        assert_eq!(a, same_bucket);
        assert_ne!(a, next_bucket);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_transition_key_distinguishes_type_and_fence() {
        let user = UserId::new("alice");
        let home = GeofenceId::new("home");
        let school = GeofenceId::new("school");
        let entry = DedupKey::transition(&user, &home, ActivityType::GeofenceEntry, t0(), 1_000);
        let exit = DedupKey::transition(&user, &home, ActivityType::GeofenceExit, t0(), 1_000);
        let other = DedupKey::transition(&user, &school, ActivityType::GeofenceEntry, t0(), 1_000);
        assert_ne!(entry, exit);
        assert_ne!(entry, other);
    }

    #[test]
    fn test_zero_bucket_width_is_treated_as_one_ms() {
        let user = UserId::new("alice");
        let fence = GeofenceId::new("home");
        let a = DedupKey::transition(&user, &fence, ActivityType::GeofenceEntry, t0(), 0);
        let b = DedupKey::transition(&user, &fence, ActivityType::GeofenceEntry, t0(), 1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_per_sample_key_uses_exact_timestamp() {
        let user = UserId::new("alice");
        let group = GroupId::new("fam");
        let a = DedupKey::per_sample(&user, &group, ActivityType::LocationUpdate, t0());
        let b = DedupKey::per_sample(
            &user,
            &group,
            ActivityType::LocationUpdate,
            t0() + Duration::milliseconds(1),
        );
        assert_ne!(a, b);
    }
}
