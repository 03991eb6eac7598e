//! Deduplicated, append-only activity log.
//!
//! Appends are idempotent on the event's dedup key. A newly inserted event is
//! published to the [`AlertDispatcher`] exactly once, after the row is
//! durable; a duplicate returns the stored row and publishes nothing.
//!
//! An append that fails may still have written its row (a storage deadline
//! can fire after the commit). Such keys are remembered, and when a retry
//! finds the row already present it is published then and reported as
//! inserted.
//!
//! Creation timestamps are `max(clock now, previous creation time of the
//! user)`, assigned under a per-user lock so that per-user append order and
//! creation order agree.

use crate::alerts::AlertDispatcher;
use crate::clock::Clock;
use crate::models::{
    ActivityEvent, ActivityType, GeofenceId, GroupId, MembershipState, NewActivityEvent,
    SessionKey, UserId,
};
use crate::Result;
use crate::storage::{ActivityBackend, SequencedEvent, StorageBulkhead, StoredAppend};
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Default number of events returned by feed queries.
pub const DEFAULT_FEED_LIMIT: usize = 50;

/// Idempotency configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Width of the time bucket for transition keys, in milliseconds.
    pub transition_bucket_ms: u64,
    /// Number of recently seen keys kept in memory.
    pub recent_keys_capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            transition_bucket_ms: 1_000,
            recent_keys_capacity: 4_096,
        }
    }
}

/// Result of [`ActivityEventStore::append`].
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// The event was written and published.
    Inserted(ActivityEvent),
    /// An event with the same key already existed.
    Duplicate(ActivityEvent),
}

impl AppendOutcome {
    /// Returns the stored event.
    #[must_use]
    pub const fn event(&self) -> &ActivityEvent {
        match self {
            Self::Inserted(event) | Self::Duplicate(event) => event,
        }
    }

    /// Returns `true` for a new row.
    #[must_use]
    pub const fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

type UserSlot = Arc<tokio::sync::Mutex<Option<DateTime<Utc>>>>;

/// Service for the activity log.
pub struct ActivityEventStore {
    backend: Arc<dyn ActivityBackend>,
    bulkhead: StorageBulkhead,
    clock: Arc<dyn Clock>,
    dispatcher: AlertDispatcher,
    recent: Mutex<LruCache<String, ActivityEvent>>,
    unpublished: Mutex<LruCache<String, ()>>,
    users: Mutex<HashMap<UserId, UserSlot>>,
}

impl ActivityEventStore {
    /// Creates the store.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ActivityBackend>,
        bulkhead: StorageBulkhead,
        clock: Arc<dyn Clock>,
        dispatcher: AlertDispatcher,
        config: DedupConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.recent_keys_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            backend,
            bulkhead,
            clock,
            dispatcher,
            recent: Mutex::new(LruCache::new(capacity)),
            unpublished: Mutex::new(LruCache::new(capacity)),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Appends an event unless its dedup key was already recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails after retries or times out. The
    /// event may or may not have been written; appending it again is safe.
    pub async fn append(&self, event: NewActivityEvent) -> Result<AppendOutcome> {
        if let Some(existing) = self.recent_hit(&event.dedup_key) {
            Self::record_duplicate(&existing, "cache");
            return Ok(AppendOutcome::Duplicate(existing));
        }

        let slot = self.user_slot(&event.user_id);
        let mut last_created = slot.lock().await;

        if last_created.is_none() {
            let backend = Arc::clone(&self.backend);
            let user = event.user_id.clone();
            *last_created = Some(
                self.bulkhead
                    .run("last_activity_created_at", move || {
                        backend.last_created_at(&user)
                    })
                    .await?
                    .unwrap_or(DateTime::UNIX_EPOCH),
            );
        }

        let now = self.clock.now();
        let created_at = (*last_created).map_or(now, |prev| now.max(prev));
        let dedup_key = event.dedup_key.clone();
        let to_store = ActivityEvent::from_new(event, created_at);
        let backend = Arc::clone(&self.backend);
        let stored = match self
            .bulkhead
            .run("append_activity", move || backend.append(&to_store))
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                // The write may still land; reload the watermark next time
                *last_created = None;
                self.unpublished
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .put(dedup_key, ());
                metrics::counter!("activity_events_append_failures_total").increment(1);
                return Err(err);
            },
        };

        match stored {
            StoredAppend::Inserted(event) => {
                *last_created = Some(event.created_at);
                drop(last_created);
                self.take_unpublished(&event.dedup_key);
                Ok(self.publish_new(event, "inserted"))
            },
            StoredAppend::Duplicate(existing) if self.take_unpublished(&existing.dedup_key) => {
                drop(last_created);
                Ok(self.publish_new(existing, "recovered"))
            },
            StoredAppend::Duplicate(existing) => {
                drop(last_created);
                self.remember(&existing);
                Self::record_duplicate(&existing, "storage");
                Ok(AppendOutcome::Duplicate(existing))
            },
        }
    }

    /// Geofence memberships implied by the last logged crossing of each
    /// geofence by a user in a group.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn memberships_for(
        &self,
        key: &SessionKey,
    ) -> Result<BTreeMap<GeofenceId, MembershipState>> {
        let backend = Arc::clone(&self.backend);
        let (user, group) = (key.user_id.clone(), key.group_id.clone());
        let latest = self
            .bulkhead
            .run("last_transitions", move || {
                backend.last_transitions(&user, &group)
            })
            .await?;
        Ok(latest
            .into_iter()
            .filter_map(|event| {
                let state = match event.activity_type {
                    ActivityType::GeofenceEntry => MembershipState::inside_since(event.source_timestamp),
                    ActivityType::GeofenceExit => MembershipState::outside_since(event.source_timestamp),
                    _ => return None,
                };
                event.geofence_id.map(|id| (id, state))
            })
            .collect())
    }

    /// Events created at or after `since` with a sequence number above
    /// `after_seq`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn events_since(
        &self,
        since: DateTime<Utc>,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<SequencedEvent>> {
        let backend = Arc::clone(&self.backend);
        self.bulkhead
            .run("activity_since", move || {
                backend.events_since(since, after_seq, limit)
            })
            .await
    }

    /// Current time of the store's clock; creation timestamps are never
    /// earlier than this.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Drops the cached creation watermark of a user unless an append holds
    /// it. The next append reloads it from storage.
    pub fn forget_user(&self, user_id: &UserId) {
        let mut users = self
            .users
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if users
            .get(user_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            users.remove(user_id);
        }
    }

    /// Number of users with a cached watermark.
    #[must_use]
    pub fn tracked_users(&self) -> usize {
        self.users
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Most recent events of a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn recent_for(&self, user_id: &UserId, limit: usize) -> Result<Vec<ActivityEvent>> {
        let backend = Arc::clone(&self.backend);
        let user = user_id.clone();
        self.bulkhead
            .run("recent_activity_for_user", move || {
                backend.recent_for_user(&user, limit)
            })
            .await
    }

    /// Most recent events of a group, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn recent_for_group(
        &self,
        group_id: &GroupId,
        limit: usize,
    ) -> Result<Vec<ActivityEvent>> {
        let backend = Arc::clone(&self.backend);
        let group = group_id.clone();
        self.bulkhead
            .run("recent_activity_for_group", move || {
                backend.recent_for_group(&group, limit)
            })
            .await
    }

    /// Total number of stored events.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn count(&self) -> Result<usize> {
        let backend = Arc::clone(&self.backend);
        self.bulkhead
            .run("count_activity", move || backend.count())
            .await
    }

    fn user_slot(&self, user_id: &UserId) -> UserSlot {
        let mut users = self
            .users
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(users.entry(user_id.clone()).or_default())
    }

    fn publish_new(&self, event: ActivityEvent, how: &'static str) -> AppendOutcome {
        self.remember(&event);
        metrics::counter!(
            "activity_events_appended_total",
            "type" => event.activity_type.as_str(),
            "how" => how
        )
        .increment(1);
        tracing::debug!(
            event_id = %event.id,
            user_id = %event.user_id,
            activity_type = %event.activity_type,
            how,
            "Appended activity event"
        );
        self.dispatcher.publish(event.clone());
        AppendOutcome::Inserted(event)
    }

    fn take_unpublished(&self, key: &str) -> bool {
        self.unpublished
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop(key)
            .is_some()
    }

    fn recent_hit(&self, key: &str) -> Option<ActivityEvent> {
        self.recent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn remember(&self, event: &ActivityEvent) {
        self.recent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .put(event.dedup_key.clone(), event.clone());
    }

    fn record_duplicate(event: &ActivityEvent, source: &'static str) {
        metrics::counter!(
            "activity_events_duplicate_total",
            "type" => event.activity_type.as_str(),
            "source" => source
        )
        .increment(1);
        tracing::debug!(
            user_id = %event.user_id,
            activity_type = %event.activity_type,
            source,
            "Suppressed duplicate activity event"
        );
    }
}
