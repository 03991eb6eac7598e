//! Data models for geowatch.
//!
//! This module contains the core data structures shared by the ingestion
//! pipeline, the storage layer, and the alert dispatcher.

mod activity;
mod geofence;
mod ids;
mod position;
mod sample;
mod session;

pub use activity::{ActivityEvent, ActivityType, DedupKey, NewActivityEvent};
pub use geofence::{Geofence, GeofenceKind, MAX_NAME_LEN, MAX_RADIUS_M, MIN_RADIUS_M};
pub use ids::{EventId, GeofenceId, GroupId, SessionKey, UserId};
pub use position::{Coordinate, EARTH_RADIUS_M, METERS_PER_DEGREE_LAT};
pub use sample::LocationSample;
pub use session::{LiveSession, MembershipState, SessionStatus};
