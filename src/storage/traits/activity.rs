//! Activity log storage trait.

use crate::Result;
use crate::models::{ActivityEvent, GroupId, UserId};
use chrono::{DateTime, Utc};

/// Result of a storage-level append.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredAppend {
    /// The event was written.
    Inserted(ActivityEvent),
    /// A row with the same dedup key already existed; it is returned as is.
    Duplicate(ActivityEvent),
}

/// An event with its insertion sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedEvent {
    /// Insertion sequence; increases with every append.
    pub seq: i64,
    /// The stored event.
    pub event: ActivityEvent,
}

/// Append-only storage for the `activity_logs` table.
///
/// Rows are never updated or deleted. `append` must be atomic: either the
/// whole row is written or nothing is.
pub trait ActivityBackend: Send + Sync {
    /// Appends an event unless its dedup key is already present.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn append(&self, event: &ActivityEvent) -> Result<StoredAppend>;

    /// Looks up an event by its dedup key.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<ActivityEvent>>;

    /// Most recent events of a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn recent_for_user(&self, user_id: &UserId, limit: usize) -> Result<Vec<ActivityEvent>>;

    /// Most recent events of a group, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn recent_for_group(&self, group_id: &GroupId, limit: usize) -> Result<Vec<ActivityEvent>>;

    /// Latest creation timestamp recorded for a user.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn last_created_at(&self, user_id: &UserId) -> Result<Option<DateTime<Utc>>>;

    /// Latest `geofence_entry` or `geofence_exit` of a user in a group, one
    /// per geofence.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn last_transitions(&self, user_id: &UserId, group_id: &GroupId) -> Result<Vec<ActivityEvent>>;

    /// Events created at or after `since` with a sequence number above
    /// `after_seq`, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn events_since(
        &self,
        since: DateTime<Utc>,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<SequencedEvent>>;

    /// Total number of stored events.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be accessed.
    fn count(&self) -> Result<usize>;
}
