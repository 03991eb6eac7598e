//! Hysteresis-based geofence transition detection.
//!
//! A member enters a geofence when the haversine distance to its center is
//! within the radius, and exits only once the distance exceeds the radius
//! plus a margin. Between the two thresholds nothing changes, so a device
//! hovering on the boundary cannot produce an entry/exit storm.

use crate::models::{ActivityType, Coordinate, Geofence, MembershipState};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Exit margin configuration.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct HysteresisConfig {
    /// Smallest exit margin in meters.
    pub min_margin_m: f64,
    /// Exit margin as a fraction of the radius.
    pub margin_ratio: f64,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            min_margin_m: 5.0,
            margin_ratio: 0.05,
        }
    }
}

impl HysteresisConfig {
    /// Exit margin for a geofence radius: `max(min_margin_m, margin_ratio × radius)`.
    #[must_use]
    pub fn margin_m(&self, radius_m: u32) -> f64 {
        self.min_margin_m.max(self.margin_ratio * f64::from(radius_m))
    }

    /// Distance beyond which an inside member is considered to have left.
    #[must_use]
    pub fn exit_threshold_m(&self, radius_m: u32) -> f64 {
        f64::from(radius_m) + self.margin_m(radius_m)
    }
}

/// A detected boundary crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Outside to inside.
    Entered,
    /// Inside to outside.
    Exited,
}

impl Transition {
    /// Activity type recorded for this transition.
    #[must_use]
    pub const fn activity_type(self) -> ActivityType {
        match self {
            Self::Entered => ActivityType::GeofenceEntry,
            Self::Exited => ActivityType::GeofenceExit,
        }
    }
}

/// Result of evaluating one sample against one geofence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// Haversine distance from the sample to the center, in meters.
    pub distance_m: f64,
    /// Crossing detected by this sample, if any.
    pub transition: Option<Transition>,
    /// Membership after this sample.
    pub state: MembershipState,
}

/// Pure transition decision function.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionEvaluator {
    config: HysteresisConfig,
}

impl TransitionEvaluator {
    /// Creates an evaluator.
    #[must_use]
    pub const fn new(config: HysteresisConfig) -> Self {
        Self { config }
    }

    /// Returns the hysteresis configuration.
    #[must_use]
    pub const fn config(&self) -> &HysteresisConfig {
        &self.config
    }

    /// Evaluates `position` (observed at `at`) against `geofence`, given the
    /// membership before the sample.
    #[must_use]
    pub fn evaluate(
        &self,
        prior: MembershipState,
        position: &Coordinate,
        geofence: &Geofence,
        at: DateTime<Utc>,
    ) -> Evaluation {
        let distance_m = position.distance_m(&geofence.center);

        let transition = if prior.inside {
            (distance_m > self.config.exit_threshold_m(geofence.radius_m))
                .then_some(Transition::Exited)
        } else {
            (distance_m <= f64::from(geofence.radius_m)).then_some(Transition::Entered)
        };

        let state = match transition {
            Some(Transition::Entered) => MembershipState::inside_since(at),
            Some(Transition::Exited) => MembershipState::outside_since(at),
            None => prior,
        };

        Evaluation {
            distance_m,
            transition,
            state,
        }
    }
}
