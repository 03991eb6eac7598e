//! # Geowatch
//!
//! Geofence transition detection and live-location tracking for family groups.
//!
//! Geowatch ingests periodic location samples from members' devices, keeps an
//! authoritative live session per (user, group), and records exactly one
//! activity event per geofence entry or exit, even when samples arrive late,
//! duplicated, out of order, or hovering on a zone boundary.
//!
//! ## Features
//!
//! - Asymmetric hysteresis on geofence boundaries (no flapping)
//! - Per-(user, group) serialization with full cross-user parallelism
//! - Idempotent, append-only activity log backed by `SQLite`
//! - Heartbeat sweep that marks silent sessions inactive
//! - Broadcast alert dispatch with log and HTTP sinks
//!
//! ## Example
//!
//! ```rust,ignore
//! use geowatch::{GeowatchConfig, Tracker, LocationSample};
//!
//! let tracker = Tracker::in_memory(GeowatchConfig::default())?;
//! let outcome = tracker.ingestor().ingest(sample).await?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod alerts;
pub mod cli;
pub mod clock;
pub mod config;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;

// Re-exports for convenience
pub use alerts::AlertDispatcher;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FeatureFlags, GeowatchConfig};
pub use models::{
    ActivityEvent, ActivityType, Coordinate, Geofence, GeofenceId, GeofenceKind, GroupId,
    LiveSession, LocationSample, SessionStatus, UserId,
};
pub use services::{
    ActivityEventStore, AppendOutcome, GeofenceIndex, HeartbeatMonitor, IngestOutcome,
    IngestPipeline, LocationIngestor, SessionStateStore, Tracker, TransitionEvaluator,
};

/// Error type for geowatch operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Geofence administration with bad fields, malformed config or NDJSON |
/// | `OperationFailed` | `SQLite` queries fail, files cannot be read, retries are exhausted |
/// | `Timeout` | A bounded storage or index call did not finish in time |
/// | `Unavailable` | The ingest pipeline is full or shut down, a circuit breaker is open |
///
/// Malformed or stale location samples are never errors; they are reported
/// through [`IngestOutcome`].
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    ///
    /// Raised when:
    /// - `SQLite` database operations fail
    /// - Configuration or sample files cannot be read
    /// - Storage retries are exhausted
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// A bounded operation exceeded its deadline.
    #[error("operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The deadline in milliseconds.
        timeout_ms: u64,
    },

    /// A component cannot accept work right now.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl Error {
    /// Returns `true` if retrying the operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::OperationFailed { .. } | Self::Timeout { .. })
    }
}

/// Result type alias for geowatch operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("test error".to_string());
        assert_eq!(err.to_string(), "invalid input: test error");

        let err = Error::OperationFailed {
            operation: "test".to_string(),
            cause: "failed".to_string(),
        };
        assert_eq!(err.to_string(), "operation 'test' failed: failed");

        let err = Error::Timeout {
            operation: "index_read".to_string(),
            timeout_ms: 500,
        };
        assert_eq!(err.to_string(), "operation 'index_read' timed out after 500ms");
    }

    #[test]
    fn test_transient_classification() {
        assert!(
            Error::OperationFailed {
                operation: "append".to_string(),
                cause: "disk I/O error".to_string(),
            }
            .is_transient()
        );
        assert!(
            Error::Timeout {
                operation: "append".to_string(),
                timeout_ms: 10,
            }
            .is_transient()
        );
        assert!(!Error::InvalidInput("bad".to_string()).is_transient());
        assert!(!Error::Unavailable("closed".to_string()).is_transient());
    }
}
