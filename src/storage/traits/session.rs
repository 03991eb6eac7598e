//! Live session storage trait.

use crate::Result;
use crate::models::{GroupId, LiveSession, SessionKey};
use chrono::{DateTime, Utc};

/// Storage for the `live_sessions` table: one row per (user, group).
pub trait SessionBackend: Send + Sync {
    /// Loads the session for a key.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn load(&self, key: &SessionKey) -> Result<Option<LiveSession>>;

    /// Inserts or replaces the session row for the session's key.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn save(&self, session: &LiveSession) -> Result<()>;

    /// Lists the sessions of a group, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn list_for_group(&self, group_id: &GroupId) -> Result<Vec<LiveSession>>;

    /// Keys of active sessions whose last update is before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn list_active_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionKey>>;
}
