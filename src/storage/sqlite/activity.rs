//! `SQLite` backend for the append-only activity log.

use super::{acquire_lock, db_error, from_millis, open_file, open_in_memory, timed, to_millis};
use crate::models::{ActivityEvent, ActivityType, Coordinate, EventId, GeofenceId, GroupId, UserId};
use crate::storage::traits::{ActivityBackend, SequencedEvent, StoredAppend};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::Mutex;

const TABLE: &str = "activity_logs";

const SELECT_COLUMNS: &str = "id, user_id, family_id, activity_type, geofence_id, data, \
     latitude, longitude, speed, source_ts, created_at, dedup_key";

/// SQLite-based activity log.
///
/// Rows are ordered by `(created_at, seq)`, where `seq` is the insertion
/// sequence. Update and delete are rejected by triggers.
pub struct SqliteActivityBackend {
    conn: Mutex<Connection>,
}

impl SqliteActivityBackend {
    /// Opens (or creates) the activity table in the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_file(path.as_ref(), "open_activity_database")?;
        Self::with_connection(conn)
    }

    /// Creates an in-memory backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(open_in_memory("open_activity_database_memory")?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS activity_logs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                family_id TEXT NOT NULL,
                activity_type TEXT NOT NULL,
                geofence_id TEXT,
                data TEXT NOT NULL DEFAULT 'null',
                latitude REAL,
                longitude REAL,
                speed REAL,
                source_ts INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                dedup_key TEXT NOT NULL UNIQUE
            );

            CREATE INDEX IF NOT EXISTS idx_activity_logs_user
                ON activity_logs(user_id, created_at DESC, seq DESC);
            CREATE INDEX IF NOT EXISTS idx_activity_logs_family
                ON activity_logs(family_id, created_at DESC, seq DESC);
            CREATE INDEX IF NOT EXISTS idx_activity_logs_fence
                ON activity_logs(user_id, family_id, geofence_id, seq);
            CREATE INDEX IF NOT EXISTS idx_activity_logs_created
                ON activity_logs(created_at, seq);

            CREATE TRIGGER IF NOT EXISTS activity_logs_no_update
                BEFORE UPDATE ON activity_logs
                BEGIN SELECT RAISE(ABORT, 'activity_logs is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS activity_logs_no_delete
                BEFORE DELETE ON activity_logs
                BEGIN SELECT RAISE(ABORT, 'activity_logs is append-only'); END;
            ",
        )
        .map_err(db_error("initialize_activity_schema"))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_event(row: &Row<'_>) -> rusqlite::Result<ActivityEvent> {
        let activity_type: String = row.get(3)?;
        let data: String = row.get(5)?;
        let latitude: Option<f64> = row.get(6)?;
        let longitude: Option<f64> = row.get(7)?;
        Ok(ActivityEvent {
            id: EventId::new(row.get::<_, String>(0)?),
            user_id: UserId::new(row.get::<_, String>(1)?),
            group_id: GroupId::new(row.get::<_, String>(2)?),
            activity_type: ActivityType::parse(&activity_type).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    format!("unknown activity type '{activity_type}'").into(),
                )
            })?,
            geofence_id: row.get::<_, Option<String>>(4)?.map(GeofenceId::new),
            payload: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
            position: latitude
                .zip(longitude)
                .map(|(lat, lon)| Coordinate::new(lat, lon)),
            speed: row.get(8)?,
            source_timestamp: from_millis(row.get(9)?),
            created_at: from_millis(row.get(10)?),
            dedup_key: row.get(11)?,
        })
    }

    fn find_by_dedup_key_locked(
        conn: &Connection,
        dedup_key: &str,
    ) -> Result<Option<ActivityEvent>> {
        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM activity_logs WHERE dedup_key = ?1"),
            params![dedup_key],
            Self::row_to_event,
        )
        .optional()
        .map_err(db_error("find_activity_by_dedup_key"))
    }

    fn recent(&self, column: &str, value: &str, limit: usize) -> Result<Vec<ActivityEvent>> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {SELECT_COLUMNS} FROM activity_logs
                 WHERE {column} = ?1 ORDER BY created_at DESC, seq DESC LIMIT ?2"
            ))
            .map_err(db_error("prepare_recent_activity"))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![value, limit], Self::row_to_event)
            .map_err(db_error("recent_activity"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error("recent_activity"))
    }
}

impl ActivityBackend for SqliteActivityBackend {
    fn append(&self, event: &ActivityEvent) -> Result<StoredAppend> {
        timed(TABLE, "append", || {
            let conn = acquire_lock(&self.conn);
            let data = serde_json::to_string(&event.payload).map_err(|e| {
                Error::InvalidInput(format!("activity payload is not serializable: {e}"))
            })?;
            let inserted = conn
                .execute(
                    "INSERT INTO activity_logs
                        (id, user_id, family_id, activity_type, geofence_id, data,
                         latitude, longitude, speed, source_ts, created_at, dedup_key)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(dedup_key) DO NOTHING",
                    params![
                        event.id.as_str(),
                        event.user_id.as_str(),
                        event.group_id.as_str(),
                        event.activity_type.as_str(),
                        event.geofence_id.as_ref().map(GeofenceId::as_str),
                        data,
                        event.position.map(|p| p.latitude),
                        event.position.map(|p| p.longitude),
                        event.speed,
                        to_millis(event.source_timestamp),
                        to_millis(event.created_at),
                        event.dedup_key,
                    ],
                )
                .map_err(db_error("append_activity"))?;

            if inserted > 0 {
                return Ok(StoredAppend::Inserted(event.clone()));
            }

            Self::find_by_dedup_key_locked(&conn, &event.dedup_key)?
                .map(StoredAppend::Duplicate)
                .ok_or_else(|| Error::OperationFailed {
                    operation: "append_activity".to_string(),
                    cause: format!(
                        "insert ignored but no row holds dedup key {}",
                        event.dedup_key
                    ),
                })
        })
    }

    fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<ActivityEvent>> {
        timed(TABLE, "find_by_dedup_key", || {
            let conn = acquire_lock(&self.conn);
            Self::find_by_dedup_key_locked(&conn, dedup_key)
        })
    }

    fn recent_for_user(&self, user_id: &UserId, limit: usize) -> Result<Vec<ActivityEvent>> {
        timed(TABLE, "recent_for_user", || {
            self.recent("user_id", user_id.as_str(), limit)
        })
    }

    fn recent_for_group(&self, group_id: &GroupId, limit: usize) -> Result<Vec<ActivityEvent>> {
        timed(TABLE, "recent_for_group", || {
            self.recent("family_id", group_id.as_str(), limit)
        })
    }

    fn last_created_at(&self, user_id: &UserId) -> Result<Option<DateTime<Utc>>> {
        timed(TABLE, "last_created_at", || {
            let conn = acquire_lock(&self.conn);
            conn.query_row(
                "SELECT MAX(created_at) FROM activity_logs WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| row.get::<_, Option<i64>>(0),
            )
            .map(|ms| ms.map(from_millis))
            .map_err(db_error("last_activity_created_at"))
        })
    }

    fn last_transitions(&self, user_id: &UserId, group_id: &GroupId) -> Result<Vec<ActivityEvent>> {
        timed(TABLE, "last_transitions", || {
            let conn = acquire_lock(&self.conn);
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT {SELECT_COLUMNS} FROM activity_logs
                     WHERE seq IN (
                         SELECT MAX(seq) FROM activity_logs
                         WHERE user_id = ?1 AND family_id = ?2
                           AND geofence_id IS NOT NULL
                           AND activity_type IN (?3, ?4)
                         GROUP BY geofence_id
                     )
                     ORDER BY geofence_id"
                ))
                .map_err(db_error("prepare_last_transitions"))?;
            let rows = stmt
                .query_map(
                    params![
                        user_id.as_str(),
                        group_id.as_str(),
                        ActivityType::GeofenceEntry.as_str(),
                        ActivityType::GeofenceExit.as_str(),
                    ],
                    Self::row_to_event,
                )
                .map_err(db_error("last_transitions"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_error("last_transitions"))
        })
    }

    fn events_since(
        &self,
        since: DateTime<Utc>,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<SequencedEvent>> {
        timed(TABLE, "events_since", || {
            let conn = acquire_lock(&self.conn);
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT {SELECT_COLUMNS}, seq FROM activity_logs
                     WHERE created_at >= ?1 AND seq > ?2
                     ORDER BY seq LIMIT ?3"
                ))
                .map_err(db_error("prepare_events_since"))?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt
                .query_map(params![to_millis(since), after_seq, limit], |row| {
                    Ok(SequencedEvent {
                        event: Self::row_to_event(row)?,
                        seq: row.get(12)?,
                    })
                })
                .map_err(db_error("events_since"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_error("events_since"))
        })
    }

    fn count(&self) -> Result<usize> {
        timed(TABLE, "count", || {
            let conn = acquire_lock(&self.conn);
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM activity_logs", [], |row| row.get(0))
                .map_err(db_error("count_activity"))?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }
}
