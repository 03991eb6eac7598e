//! Live session and geofence membership state.

use super::{Coordinate, GroupId, SessionKey, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tracking status of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Samples are arriving.
    Active,
    /// The device asked to pause tracking.
    Paused,
    /// No sample arrived within the heartbeat timeout.
    Inactive,
}

impl SessionStatus {
    /// Returns the storage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Inactive => "inactive",
        }
    }

    /// Parses a stored status.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The most recent known state of one user in one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSession {
    /// Tracked user.
    pub user_id: UserId,
    /// Group the session belongs to.
    pub group_id: GroupId,
    /// Last known position.
    pub position: Option<Coordinate>,
    /// Last reported speed in km/h.
    pub speed: Option<f64>,
    /// Last reported heading in degrees.
    pub heading: Option<f64>,
    /// Last reported battery level in percent.
    pub battery_level: Option<f64>,
    /// Current status.
    pub status: SessionStatus,
    /// Source timestamp of the last accepted sample.
    pub last_update: DateTime<Utc>,
    /// Start of the current (or last) session.
    pub session_start: DateTime<Utc>,
    /// End of the last session, cleared on reactivation.
    pub session_end: Option<DateTime<Utc>>,
}

impl LiveSession {
    /// Starts a new session at `at`.
    #[must_use]
    pub const fn start(user_id: UserId, group_id: GroupId, at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            group_id,
            position: None,
            speed: None,
            heading: None,
            battery_level: None,
            status: SessionStatus::Active,
            last_update: at,
            session_start: at,
            session_end: None,
        }
    }

    /// Returns the session key.
    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.user_id.clone(), self.group_id.clone())
    }

    /// Returns `true` if the session has not ended.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.session_end.is_none()
    }

    /// Age of the last accepted sample at `now`, never negative.
    #[must_use]
    pub fn staleness(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_update).max(Duration::zero())
    }

    /// Returns `true` if the last sample is older than `timeout` at `now`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.staleness(now) > timeout
    }
}

/// Hysteresis memory for one (user, geofence) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MembershipState {
    /// Whether the user is currently considered inside.
    pub inside: bool,
    /// Source timestamp of the sample that last flipped `inside`.
    pub changed_at: Option<DateTime<Utc>>,
}

impl MembershipState {
    /// State for a user considered inside since `at`.
    #[must_use]
    pub const fn inside_since(at: DateTime<Utc>) -> Self {
        Self {
            inside: true,
            changed_at: Some(at),
        }
    }

    /// State for a user considered outside since `at`.
    #[must_use]
    pub const fn outside_since(at: DateTime<Utc>) -> Self {
        Self {
            inside: false,
            changed_at: Some(at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Paused,
            SessionStatus::Inactive,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("gone"), None);
    }

    #[test]
    fn test_staleness() {
        let session = LiveSession::start(UserId::new("u"), GroupId::new("g"), t0());
        let now = t0() + Duration::seconds(130);
        assert_eq!(session.staleness(now), Duration::seconds(130));
        assert!(session.is_stale(now, Duration::seconds(120)));
        assert!(!session.is_stale(now, Duration::seconds(130)));
    }

    #[test]
    fn test_staleness_never_negative() {
        let session = LiveSession::start(UserId::new("u"), GroupId::new("g"), t0());
        assert_eq!(session.staleness(t0() - Duration::seconds(5)), Duration::zero());
    }

    #[test]
    fn test_membership_default_is_outside() {
        let state = MembershipState::default();
        assert!(!state.inside);
        assert!(state.changed_at.is_none());
    }
}
