//! Live session state, one tracking slot per (user, group).
//!
//! Each slot is guarded by its own async mutex; the registry lock is held
//! only to find or create a slot. The ingestor mutates a slot's session,
//! geofence memberships and motion memory while holding the slot lock, so
//! samples of one user in one group are fully serialized while other slots
//! proceed in parallel.
//!
//! Sessions are persisted to the `live_sessions` table. Memberships are not
//! stored here; the ingestor rebuilds them from the activity log the first
//! time a slot is used. Motion memory starts empty.
//!
//! The heartbeat sweep covers every session persisted as active, including
//! ones from a previous process, and evicts slots of ended sessions so the
//! registry holds only live users.

use super::motion::MotionState;
use crate::Result;
use crate::models::{GeofenceId, GroupId, LiveSession, MembershipState, SessionKey, SessionStatus};
use crate::storage::{SessionBackend, StorageBulkhead};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

/// Mutable tracking state of one (user, group).
#[derive(Debug, Clone, Default)]
pub struct TrackedSession {
    /// Persisted session, `None` until the first accepted sample.
    pub session: Option<LiveSession>,
    /// Membership per geofence evaluated so far.
    pub memberships: BTreeMap<GeofenceId, MembershipState>,
    /// Speed memory for motion events.
    pub motion: MotionState,
    /// Source timestamp of the last emitted `location_update` event.
    pub last_location_event: Option<DateTime<Utc>>,
    loaded: bool,
    memberships_restored: bool,
}

impl TrackedSession {
    /// Timestamp of the last accepted sample.
    #[must_use]
    pub fn last_accepted(&self) -> Option<DateTime<Utc>> {
        self.session.as_ref().map(|s| s.last_update)
    }

    /// Returns `true` until memberships have been restored for this slot.
    #[must_use]
    pub const fn needs_memberships(&self) -> bool {
        !self.memberships_restored
    }

    /// Replaces the memberships with ones rebuilt from the activity log.
    pub fn restore_memberships(&mut self, memberships: BTreeMap<GeofenceId, MembershipState>) {
        self.memberships = memberships;
        self.memberships_restored = true;
    }

    fn is_ended(&self) -> bool {
        self.session
            .as_ref()
            .is_none_or(|session| session.status == SessionStatus::Inactive)
    }

    /// Geofences the user is currently inside, in ID order.
    pub fn inside(&self) -> impl Iterator<Item = &GeofenceId> {
        self.memberships
            .iter()
            .filter(|(_, state)| state.inside)
            .map(|(id, _)| id)
    }
}

/// Exclusive access to one slot.
pub type SlotGuard = OwnedMutexGuard<TrackedSession>;

type Slot = Arc<tokio::sync::Mutex<TrackedSession>>;

/// Outcome of a heartbeat sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Slots examined.
    pub examined: usize,
    /// Sessions marked inactive.
    pub inactivated: usize,
    /// Slots skipped because they were busy.
    pub skipped: usize,
    /// Sessions whose slots were dropped from memory.
    pub evicted: Vec<SessionKey>,
}

/// Store of live sessions.
pub struct SessionStateStore {
    backend: Arc<dyn SessionBackend>,
    bulkhead: StorageBulkhead,
    slots: Mutex<HashMap<SessionKey, Slot>>,
    snapshots: RwLock<HashMap<SessionKey, LiveSession>>,
}

impl SessionStateStore {
    /// Creates the store.
    #[must_use]
    pub fn new(backend: Arc<dyn SessionBackend>, bulkhead: StorageBulkhead) -> Self {
        Self {
            backend,
            bulkhead,
            slots: Mutex::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Locks the slot for `key`, loading the persisted session on first use.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the persisted session cannot be loaded.
    pub async fn lock(&self, key: &SessionKey) -> Result<SlotGuard> {
        let mut guard = self.slot(key).lock_owned().await;
        self.load_into(key, &mut guard).await?;
        Ok(guard)
    }

    /// Persists a session and refreshes its snapshot.
    ///
    /// The caller must hold the session's slot lock and commit the slot only
    /// after this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn persist(&self, session: &LiveSession) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        let row = session.clone();
        self.bulkhead
            .run("save_session", move || backend.save(&row))
            .await?;
        self.publish_snapshot(session);
        Ok(())
    }

    /// Latest session of a user in a group.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn snapshot(&self, key: &SessionKey) -> Result<Option<LiveSession>> {
        let cached = self
            .snapshots
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        let backend = Arc::clone(&self.backend);
        let lookup = key.clone();
        self.bulkhead
            .run("load_session", move || backend.load(&lookup))
            .await
    }

    /// Sessions of a group, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn sessions_for_group(&self, group_id: &GroupId) -> Result<Vec<LiveSession>> {
        let backend = Arc::clone(&self.backend);
        let group = group_id.clone();
        self.bulkhead
            .run("list_sessions", move || backend.list_for_group(&group))
            .await
    }

    /// Marks an active session paused at a device's request.
    ///
    /// Returns the updated session, or `None` if the user has no session in
    /// the group. Paused and inactive sessions are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn pause(&self, key: &SessionKey) -> Result<Option<LiveSession>> {
        let mut guard = self.lock(key).await?;
        let Some(current) = guard.session.clone() else {
            return Ok(None);
        };
        if current.status != SessionStatus::Active {
            return Ok(Some(current));
        }

        let paused = LiveSession {
            status: SessionStatus::Paused,
            ..current
        };
        self.persist(&paused).await?;
        guard.session = Some(paused.clone());
        tracing::info!(session = %key, "Session paused");
        Ok(Some(paused))
    }

    /// Marks active sessions silent for longer than `timeout` as inactive.
    ///
    /// Covers the slots in memory plus every session persisted as active
    /// whose last update is older than the timeout. Each slot lock is awaited
    /// for at most `lock_wait`; busy slots are skipped until the next sweep.
    /// Paused sessions are left alone. Slots of ended sessions are evicted
    /// when no one else holds them.
    ///
    /// # Errors
    ///
    /// Returns the first storage error; slots already processed stay updated.
    pub async fn sweep(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
        lock_wait: std::time::Duration,
    ) -> Result<SweepReport> {
        let backend = Arc::clone(&self.backend);
        let cutoff = now - timeout;
        let persisted = self
            .bulkhead
            .run("list_stale_sessions", move || {
                backend.list_active_before(cutoff)
            })
            .await?;

        let mut keys: BTreeSet<SessionKey> = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.extend(persisted);

        let mut report = SweepReport::default();
        for key in keys {
            report.examined += 1;
            let slot = self.slot(&key);
            let Ok(mut guard) = tokio::time::timeout(lock_wait, Arc::clone(&slot).lock_owned()).await
            else {
                report.skipped += 1;
                continue;
            };
            self.load_into(&key, &mut guard).await?;
            if self.end_if_silent(&key, &mut guard, now, timeout).await? {
                report.inactivated += 1;
            }
            let ended = guard.is_ended();
            drop(guard);
            if ended && self.evict(&key, &slot) {
                report.evicted.push(key);
            }
        }
        Ok(report)
    }

    async fn end_if_silent(
        &self,
        key: &SessionKey,
        tracked: &mut TrackedSession,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<bool> {
        let Some(current) = tracked.session.clone() else {
            return Ok(false);
        };
        if current.status != SessionStatus::Active || !current.is_stale(now, timeout) {
            return Ok(false);
        }

        let silent_for_s = current.staleness(now).num_seconds();
        let ended = LiveSession {
            status: SessionStatus::Inactive,
            session_end: Some(now),
            ..current
        };
        self.persist(&ended).await?;
        tracked.session = Some(ended);
        tracing::info!(session = %key, silent_for_s, "Session marked inactive");
        Ok(true)
    }

    async fn load_into(&self, key: &SessionKey, tracked: &mut TrackedSession) -> Result<()> {
        if tracked.loaded {
            return Ok(());
        }
        let backend = Arc::clone(&self.backend);
        let lookup = key.clone();
        let stored = self
            .bulkhead
            .run("load_session", move || backend.load(&lookup))
            .await?;
        if let Some(ref session) = stored {
            self.publish_snapshot(session);
        }
        tracked.session = stored;
        tracked.loaded = true;
        Ok(())
    }

    /// Drops `slot` from the registry if it is still registered for `key`,
    /// nobody else holds it and its session has ended.
    fn evict(&self, key: &SessionKey, slot: &Slot) -> bool {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Registry entry plus `slot`
        let idle = Arc::strong_count(slot) == 2
            && slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot))
            && slot.try_lock().is_ok_and(|tracked| tracked.is_ended());
        if idle {
            slots.remove(key);
            self.snapshots
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(key);
            tracing::debug!(session = %key, "Evicted ended session");
        }
        idle
    }

    /// Number of slots resident in memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if no slot is resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &SessionKey) -> Slot {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    fn publish_snapshot(&self, session: &LiveSession) {
        self.snapshots
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(session.key(), session.clone());
    }
}
