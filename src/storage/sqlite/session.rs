//! `SQLite` backend for live sessions.

use super::{acquire_lock, db_error, from_millis, open_file, open_in_memory, timed, to_millis};
use crate::Result;
use crate::models::{Coordinate, GroupId, LiveSession, SessionKey, SessionStatus, UserId};
use crate::storage::traits::SessionBackend;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::Mutex;

const TABLE: &str = "live_sessions";

const SELECT_COLUMNS: &str = "user_id, family_id, latitude, longitude, speed, heading, \
     battery_level, status, last_update, session_start, session_end";

/// SQLite-based live session storage.
///
/// The (user, group) primary key enforces at most one live row per pair.
pub struct SqliteSessionBackend {
    conn: Mutex<Connection>,
}

impl SqliteSessionBackend {
    /// Opens (or creates) the session table in the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_file(path.as_ref(), "open_session_database")?;
        Self::with_connection(conn)
    }

    /// Creates an in-memory backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(open_in_memory("open_session_database_memory")?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS live_sessions (
                user_id TEXT NOT NULL,
                family_id TEXT NOT NULL,
                latitude REAL,
                longitude REAL,
                speed REAL,
                heading REAL,
                battery_level REAL,
                status TEXT NOT NULL,
                last_update INTEGER NOT NULL,
                session_start INTEGER NOT NULL,
                session_end INTEGER,
                PRIMARY KEY (user_id, family_id)
            );

            CREATE INDEX IF NOT EXISTS idx_live_sessions_family
                ON live_sessions(family_id, last_update DESC);
            CREATE INDEX IF NOT EXISTS idx_live_sessions_status
                ON live_sessions(status, last_update);
            ",
        )
        .map_err(db_error("initialize_session_schema"))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_session(row: &Row<'_>) -> rusqlite::Result<LiveSession> {
        let latitude: Option<f64> = row.get(2)?;
        let longitude: Option<f64> = row.get(3)?;
        let status: String = row.get(7)?;
        Ok(LiveSession {
            user_id: UserId::new(row.get::<_, String>(0)?),
            group_id: GroupId::new(row.get::<_, String>(1)?),
            position: latitude
                .zip(longitude)
                .map(|(lat, lon)| Coordinate::new(lat, lon)),
            speed: row.get(4)?,
            heading: row.get(5)?,
            battery_level: row.get(6)?,
            status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Inactive),
            last_update: from_millis(row.get(8)?),
            session_start: from_millis(row.get(9)?),
            session_end: row.get::<_, Option<i64>>(10)?.map(from_millis),
        })
    }
}

impl SessionBackend for SqliteSessionBackend {
    fn load(&self, key: &SessionKey) -> Result<Option<LiveSession>> {
        timed(TABLE, "load", || {
            let conn = acquire_lock(&self.conn);
            conn.query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM live_sessions
                     WHERE user_id = ?1 AND family_id = ?2"
                ),
                params![key.user_id.as_str(), key.group_id.as_str()],
                Self::row_to_session,
            )
            .optional()
            .map_err(db_error("load_session"))
        })
    }

    fn save(&self, session: &LiveSession) -> Result<()> {
        timed(TABLE, "save", || {
            let conn = acquire_lock(&self.conn);
            conn.execute(
                "INSERT INTO live_sessions
                    (user_id, family_id, latitude, longitude, speed, heading, battery_level,
                     status, last_update, session_start, session_end)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(user_id, family_id) DO UPDATE SET
                    latitude = excluded.latitude,
                    longitude = excluded.longitude,
                    speed = excluded.speed,
                    heading = excluded.heading,
                    battery_level = excluded.battery_level,
                    status = excluded.status,
                    last_update = excluded.last_update,
                    session_start = excluded.session_start,
                    session_end = excluded.session_end",
                params![
                    session.user_id.as_str(),
                    session.group_id.as_str(),
                    session.position.map(|p| p.latitude),
                    session.position.map(|p| p.longitude),
                    session.speed,
                    session.heading,
                    session.battery_level,
                    session.status.as_str(),
                    to_millis(session.last_update),
                    to_millis(session.session_start),
                    session.session_end.map(to_millis),
                ],
            )
            .map_err(db_error("save_session"))?;
            Ok(())
        })
    }

    fn list_for_group(&self, group_id: &GroupId) -> Result<Vec<LiveSession>> {
        timed(TABLE, "list_for_group", || {
            let conn = acquire_lock(&self.conn);
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT {SELECT_COLUMNS} FROM live_sessions
                     WHERE family_id = ?1 ORDER BY last_update DESC, user_id"
                ))
                .map_err(db_error("prepare_list_sessions"))?;
            let rows = stmt
                .query_map(params![group_id.as_str()], Self::row_to_session)
                .map_err(db_error("list_sessions"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_error("list_sessions"))
        })
    }

    fn list_active_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionKey>> {
        timed(TABLE, "list_active_before", || {
            let conn = acquire_lock(&self.conn);
            let mut stmt = conn
                .prepare_cached(
                    "SELECT user_id, family_id FROM live_sessions
                     WHERE status = ?1 AND last_update < ?2
                     ORDER BY last_update, user_id, family_id",
                )
                .map_err(db_error("prepare_list_stale_sessions"))?;
            let rows = stmt
                .query_map(
                    params![SessionStatus::Active.as_str(), to_millis(cutoff)],
                    |row| {
                        Ok(SessionKey::new(
                            UserId::new(row.get::<_, String>(0)?),
                            GroupId::new(row.get::<_, String>(1)?),
                        ))
                    },
                )
                .map_err(db_error("list_stale_sessions"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_error("list_stale_sessions"))
        })
    }
}
