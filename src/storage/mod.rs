//! Storage layer abstraction.
//!
//! Three logical tables, each behind its own trait:
//! - **Geofences**: administrator-defined zones, read by the index
//! - **Live sessions**: one row per (user, group), written by the ingestor
//! - **Activity log**: append-only, deduplicated event record
//!
//! The `SQLite` backends are wrapped in [`ResilientBackend`] (retries plus
//! circuit breaker). Async callers reach them through a [`StorageBulkhead`].

// Allow cast precision loss for gauge values.
#![allow(clippy::cast_precision_loss)]
// Allow significant_drop_tightening - dropping database connections slightly early
// provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]
// Allow match_same_arms for explicit enum handling.
#![allow(clippy::match_same_arms)]

pub mod bulkhead;
pub mod resilience;
pub mod sqlite;
pub mod traits;

pub use bulkhead::{StorageBulkhead, StorageBulkheadConfig};
pub use resilience::{CircuitBreaker, ResilientBackend, StorageResilienceConfig};
pub use traits::{ActivityBackend, GeofenceBackend, SequencedEvent, SessionBackend, StoredAppend};

use crate::Result;
use sqlite::{SqliteActivityBackend, SqliteGeofenceBackend, SqliteSessionBackend};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the database inside the data directory.
pub const DATABASE_FILE: &str = "geowatch.db";

/// The three storage backends used by a tracker.
#[derive(Clone)]
pub struct StorageBackends {
    /// Geofence table.
    pub geofences: Arc<dyn GeofenceBackend>,
    /// Live session table.
    pub sessions: Arc<dyn SessionBackend>,
    /// Activity log table.
    pub activity: Arc<dyn ActivityBackend>,
}

impl StorageBackends {
    /// Assembles backends from explicit implementations.
    #[must_use]
    pub fn new(
        geofences: Arc<dyn GeofenceBackend>,
        sessions: Arc<dyn SessionBackend>,
        activity: Arc<dyn ActivityBackend>,
    ) -> Self {
        Self {
            geofences,
            sessions,
            activity,
        }
    }

    /// Opens the `SQLite` database in `data_dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(data_dir: &Path, resilience: &StorageResilienceConfig) -> Result<Self> {
        let path = database_path(data_dir);
        tracing::info!(path = %path.display(), "Opening geowatch database");
        Ok(Self::new(
            Arc::new(ResilientBackend::new(
                SqliteGeofenceBackend::new(&path)?,
                resilience.clone(),
                "geofences",
            )),
            Arc::new(ResilientBackend::new(
                SqliteSessionBackend::new(&path)?,
                resilience.clone(),
                "live_sessions",
            )),
            Arc::new(ResilientBackend::new(
                SqliteActivityBackend::new(&path)?,
                resilience.clone(),
                "activity_logs",
            )),
        ))
    }

    /// Creates in-memory backends (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if a database cannot be initialized.
    pub fn in_memory(resilience: &StorageResilienceConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(ResilientBackend::new(
                SqliteGeofenceBackend::in_memory()?,
                resilience.clone(),
                "geofences",
            )),
            Arc::new(ResilientBackend::new(
                SqliteSessionBackend::in_memory()?,
                resilience.clone(),
                "live_sessions",
            )),
            Arc::new(ResilientBackend::new(
                SqliteActivityBackend::in_memory()?,
                resilience.clone(),
                "activity_logs",
            )),
        ))
    }
}

/// Returns the database path inside a data directory.
#[must_use]
pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DATABASE_FILE)
}

/// Returns the platform data directory for geowatch.
///
/// Falls back to `./.geowatch` when no home directory can be determined.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "geowatch").map_or_else(
        || PathBuf::from(".geowatch"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}
