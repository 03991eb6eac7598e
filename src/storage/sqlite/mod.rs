//! `SQLite` backends for the three persisted tables.
//!
//! - [`SqliteGeofenceBackend`]: `geofences`
//! - [`SqliteSessionBackend`]: `live_sessions`, one row per (user, group)
//! - [`SqliteActivityBackend`]: `activity_logs`, append-only
//!
//! Each backend owns its own connection to the same database file; WAL mode
//! lets them proceed independently. Timestamps are stored as Unix epoch
//! milliseconds.

mod activity;
mod connection;
mod geofence;
mod metrics;
mod session;

pub use activity::SqliteActivityBackend;
pub use connection::{
    BUSY_TIMEOUT_MS, acquire_lock, configure_connection, db_error, open_file, open_in_memory,
};
pub use geofence::SqliteGeofenceBackend;
pub use metrics::{record_operation_metrics, timed};
pub use session::SqliteSessionBackend;

use chrono::{DateTime, Utc};

/// Converts a timestamp to its stored representation.
#[must_use]
pub const fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Converts a stored timestamp back, clamping unrepresentable values to the epoch.
#[must_use]
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}
