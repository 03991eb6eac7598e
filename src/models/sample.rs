//! Inbound location samples.

use super::{Coordinate, GroupId, SessionKey, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw location report from a member's device.
///
/// This is also the NDJSON wire shape accepted by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Reporting user.
    pub user_id: UserId,
    /// Group the report is addressed to.
    pub group_id: GroupId,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Ground speed in km/h.
    #[serde(default)]
    pub speed: Option<f64>,
    /// Heading in degrees clockwise from north.
    #[serde(default)]
    pub heading: Option<f64>,
    /// Battery level in percent.
    #[serde(default)]
    pub battery: Option<f64>,
    /// Device timestamp of the fix.
    pub timestamp: DateTime<Utc>,
}

impl LocationSample {
    /// Creates a sample with only a position and timestamp.
    #[must_use]
    pub fn new(
        user_id: impl Into<UserId>,
        group_id: impl Into<GroupId>,
        position: Coordinate,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            group_id: group_id.into(),
            latitude: position.latitude,
            longitude: position.longitude,
            speed: None,
            heading: None,
            battery: None,
            timestamp,
        }
    }

    /// Sets the speed in km/h.
    #[must_use]
    pub const fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Sets the heading in degrees.
    #[must_use]
    pub const fn with_heading(mut self, heading: f64) -> Self {
        self.heading = Some(heading);
        self
    }

    /// Sets the battery level in percent.
    #[must_use]
    pub const fn with_battery(mut self, battery: f64) -> Self {
        self.battery = Some(battery);
        self
    }

    /// Returns the reported position.
    #[must_use]
    pub const fn position(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    /// Returns the sequencing domain of this sample.
    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.user_id.clone(), self.group_id.clone())
    }

    /// Validates and normalizes the sample.
    ///
    /// Coordinates must be finite and in range and speed must not be negative;
    /// battery is clamped to `[0, 100]` and heading is wrapped into `[0, 360)`.
    /// Non-finite battery or heading values are dropped rather than rejected.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason.
    pub fn normalized(&self) -> std::result::Result<Self, String> {
        self.position().validate()?;

        if let Some(speed) = self.speed {
            if !speed.is_finite() {
                return Err("speed is not finite".to_string());
            }
            if speed < 0.0 {
                return Err(format!("speed {speed} is negative"));
            }
        }

        let mut sample = self.clone();
        sample.battery = self
            .battery
            .filter(|b| b.is_finite())
            .map(|b| b.clamp(0.0, 100.0));
        sample.heading = self
            .heading
            .filter(|h| h.is_finite())
            .map(|h| h.rem_euclid(360.0));
        Ok(sample)
    }
}
