//! Geofence storage trait.

use crate::Result;
use crate::models::{Geofence, GeofenceId, GroupId};

/// Storage for administrator-defined geofences.
///
/// Implementations must be thread-safe (`Send + Sync`). The ingestion core
/// only reads through this trait; writes come from the administrative
/// boundary.
pub trait GeofenceBackend: Send + Sync {
    /// Inserts or replaces a geofence.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn upsert(&self, geofence: &Geofence) -> Result<()>;

    /// Gets a geofence by ID, active or not.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn get(&self, id: &GeofenceId) -> Result<Option<Geofence>>;

    /// Sets the active flag.
    ///
    /// # Returns
    ///
    /// `true` if the geofence exists.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn set_active(&self, id: &GeofenceId, active: bool) -> Result<bool>;

    /// Lists the active geofences of a group, ordered by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn list_active(&self, group_id: &GroupId) -> Result<Vec<Geofence>>;

    /// Lists every geofence of a group, ordered by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn list_all(&self, group_id: &GroupId) -> Result<Vec<Geofence>>;
}
