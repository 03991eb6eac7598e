//! Speed and harsh-driving detection.
//!
//! Works on consecutive accepted samples of one session. Speeds are in km/h;
//! acceleration is the speed change per second between two samples.

use crate::models::ActivityType;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Motion thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Speed above which a `speed_alert` fires, in km/h.
    pub speed_limit_kmh: f64,
    /// Deceleration that counts as harsh braking, in km/h per second.
    pub harsh_braking_kmh_per_s: f64,
    /// Acceleration that counts as harsh acceleration, in km/h per second.
    pub harsh_acceleration_kmh_per_s: f64,
    /// Samples further apart than this are not compared.
    pub max_sample_gap_s: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            speed_limit_kmh: 50.0,
            harsh_braking_kmh_per_s: 12.0,
            harsh_acceleration_kmh_per_s: 10.0,
            max_sample_gap_s: 10.0,
        }
    }
}

/// Per-session motion memory.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotionState {
    /// Speed and timestamp of the previous sample that carried a speed.
    pub last: Option<(f64, DateTime<Utc>)>,
    /// Whether the last speed was above the limit.
    pub over_limit: bool,
}

/// A detected motion event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionEvent {
    /// Event kind.
    pub activity_type: ActivityType,
    /// Speed of the triggering sample in km/h.
    pub speed_kmh: f64,
    /// Speed change rate in km/h per second, for harsh events.
    pub rate_kmh_per_s: Option<f64>,
}

/// Which detectors run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionDetectors {
    /// Speed alerts.
    pub speed: bool,
    /// Harsh braking and acceleration.
    pub harsh: bool,
}

/// Pure motion detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct MotionEvaluator {
    config: MotionConfig,
}

impl MotionEvaluator {
    /// Creates a detector.
    #[must_use]
    pub const fn new(config: MotionConfig) -> Self {
        Self { config }
    }

    /// Evaluates a sample's speed against the previous state.
    ///
    /// Speed alerts are edge-triggered: one event when the limit is first
    /// exceeded, re-armed once the speed is back at or below the limit.
    #[must_use]
    pub fn evaluate(
        &self,
        prior: MotionState,
        speed_kmh: Option<f64>,
        at: DateTime<Utc>,
        detectors: MotionDetectors,
    ) -> (Vec<MotionEvent>, MotionState) {
        let Some(speed) = speed_kmh else {
            return (Vec::new(), prior);
        };

        let mut events = Vec::new();
        let over_limit = speed > self.config.speed_limit_kmh;
        if detectors.speed && over_limit && !prior.over_limit {
            events.push(MotionEvent {
                activity_type: ActivityType::SpeedAlert,
                speed_kmh: speed,
                rate_kmh_per_s: None,
            });
        }

        if detectors.harsh
            && let Some((last_speed, last_at)) = prior.last
        {
            #[allow(clippy::cast_precision_loss)]
            let dt_s = (at - last_at).num_milliseconds() as f64 / 1000.0;
            if dt_s > 0.0 && dt_s <= self.config.max_sample_gap_s {
                let rate = (speed - last_speed) / dt_s;
                if -rate >= self.config.harsh_braking_kmh_per_s {
                    events.push(MotionEvent {
                        activity_type: ActivityType::HarshBraking,
                        speed_kmh: speed,
                        rate_kmh_per_s: Some(rate),
                    });
                } else if rate >= self.config.harsh_acceleration_kmh_per_s {
                    events.push(MotionEvent {
                        activity_type: ActivityType::HarshAcceleration,
                        speed_kmh: speed,
                        rate_kmh_per_s: Some(rate),
                    });
                }
            }
        }

        let next = MotionState {
            last: Some((speed, at)),
            over_limit: if detectors.speed { over_limit } else { prior.over_limit },
        };
        (events, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const ALL: MotionDetectors = MotionDetectors {
        speed: true,
        harsh: true,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn types(events: &[MotionEvent]) -> Vec<ActivityType> {
        events.iter().map(|e| e.activity_type).collect()
    }

    #[test]
    fn test_speed_alert_is_edge_triggered() {
        let evaluator = MotionEvaluator::default();
        let (events, state) = evaluator.evaluate(MotionState::default(), Some(55.0), t0(), ALL);
        assert_eq!(types(&events), vec![ActivityType::SpeedAlert]);

        let (events, state) =
            evaluator.evaluate(state, Some(58.0), t0() + Duration::seconds(30), ALL);
        assert!(events.is_empty());

        let (events, state) =
            evaluator.evaluate(state, Some(45.0), t0() + Duration::seconds(60), ALL);
        assert!(events.is_empty());
        assert!(!state.over_limit);

        let (events, _) = evaluator.evaluate(state, Some(52.0), t0() + Duration::seconds(90), ALL);
        assert_eq!(types(&events), vec![ActivityType::SpeedAlert]);
    }

    #[test]
    fn test_harsh_braking_and_acceleration() {
        let evaluator = MotionEvaluator::default();
        let start = MotionState {
            last: Some((40.0, t0())),
            over_limit: false,
        };

        let (events, _) = evaluator.evaluate(start, Some(10.0), t0() + Duration::seconds(2), ALL);
        assert_eq!(types(&events), vec![ActivityType::HarshBraking]);
        assert_eq!(events[0].rate_kmh_per_s, Some(-15.0));

        let (events, _) = evaluator.evaluate(start, Some(65.0), t0() + Duration::seconds(2), ALL);
        assert_eq!(
            types(&events),
            vec![ActivityType::SpeedAlert, ActivityType::HarshAcceleration]
        );
    }

    #[test]
    fn test_long_gap_is_not_compared() {
        let evaluator = MotionEvaluator::default();
        let start = MotionState {
            last: Some((40.0, t0())),
            over_limit: false,
        };
        let (events, _) = evaluator.evaluate(start, Some(0.0), t0() + Duration::seconds(60), ALL);
        assert!(events.is_empty());
    }

    #[test]
    fn test_missing_speed_keeps_state() {
        let evaluator = MotionEvaluator::default();
        let start = MotionState {
            last: Some((40.0, t0())),
            over_limit: true,
        };
        let (events, state) = evaluator.evaluate(start, None, t0() + Duration::seconds(1), ALL);
        assert!(events.is_empty());
        assert_eq!(state, start);
    }

    #[test]
    fn test_disabled_detectors_emit_nothing() {
        let evaluator = MotionEvaluator::default();
        let none = MotionDetectors {
            speed: false,
            harsh: false,
        };
        let (events, state) = evaluator.evaluate(MotionState::default(), Some(90.0), t0(), none);
        assert!(events.is_empty());
        assert_eq!(state.last, Some((90.0, t0())));
    }
}
