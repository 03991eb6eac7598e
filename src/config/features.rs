//! Feature flags for optional event kinds.

use serde::Deserialize;

/// Feature flags controlling which optional activity events are emitted.
///
/// Geofence transitions are always detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Emit `speed_alert` events.
    pub speed_alerts: bool,
    /// Emit `harsh_braking` and `harsh_acceleration` events.
    pub harsh_driving: bool,
    /// Emit periodic `location_update` events.
    pub location_updates: bool,
}

impl FeatureFlags {
    /// Creates feature flags with all optional events disabled.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            speed_alerts: false,
            harsh_driving: false,
            location_updates: false,
        }
    }

    /// Creates feature flags with all optional events enabled.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            speed_alerts: true,
            harsh_driving: true,
            location_updates: true,
        }
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::all()
    }
}
