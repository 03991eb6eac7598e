//! `SQLite` backend for geofences.

use super::{acquire_lock, db_error, open_file, open_in_memory, timed, to_millis};
use crate::Result;
use crate::models::{Coordinate, Geofence, GeofenceId, GeofenceKind, GroupId};
use crate::storage::traits::GeofenceBackend;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::Mutex;

const TABLE: &str = "geofences";

const SELECT_COLUMNS: &str =
    "id, family_id, name, latitude, longitude, radius, type, is_active, created_by";

/// SQLite-based geofence storage.
pub struct SqliteGeofenceBackend {
    conn: Mutex<Connection>,
}

impl SqliteGeofenceBackend {
    /// Opens (or creates) the geofence table in the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_file(path.as_ref(), "open_geofence_database")?;
        Self::with_connection(conn)
    }

    /// Creates an in-memory backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(open_in_memory("open_geofence_database_memory")?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS geofences (
                id TEXT PRIMARY KEY,
                family_id TEXT NOT NULL,
                name TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                radius INTEGER NOT NULL,
                type TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_by TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_geofences_family_active
                ON geofences(family_id, is_active);
            ",
        )
        .map_err(db_error("initialize_geofence_schema"))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_geofence(row: &Row<'_>) -> rusqlite::Result<Geofence> {
        let kind: String = row.get(6)?;
        Ok(Geofence {
            id: GeofenceId::new(row.get::<_, String>(0)?),
            group_id: GroupId::new(row.get::<_, String>(1)?),
            name: row.get(2)?,
            center: Coordinate::new(row.get(3)?, row.get(4)?),
            radius_m: row.get(5)?,
            kind: GeofenceKind::parse(&kind).unwrap_or(GeofenceKind::Notify),
            active: row.get(7)?,
            created_by: row.get(8)?,
        })
    }

    fn list(&self, group_id: &GroupId, active_only: bool) -> Result<Vec<Geofence>> {
        let conn = acquire_lock(&self.conn);
        let sql = if active_only {
            format!(
                "SELECT {SELECT_COLUMNS} FROM geofences
                 WHERE family_id = ?1 AND is_active = 1 ORDER BY id"
            )
        } else {
            format!("SELECT {SELECT_COLUMNS} FROM geofences WHERE family_id = ?1 ORDER BY id")
        };
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(db_error("prepare_list_geofences"))?;
        let rows = stmt
            .query_map(params![group_id.as_str()], Self::row_to_geofence)
            .map_err(db_error("list_geofences"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error("list_geofences"))
    }
}

impl GeofenceBackend for SqliteGeofenceBackend {
    fn upsert(&self, geofence: &Geofence) -> Result<()> {
        timed(TABLE, "upsert", || {
            let conn = acquire_lock(&self.conn);
            let now = to_millis(Utc::now());
            conn.execute(
                "INSERT INTO geofences
                    (id, family_id, name, latitude, longitude, radius, type, is_active,
                     created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    family_id = excluded.family_id,
                    name = excluded.name,
                    latitude = excluded.latitude,
                    longitude = excluded.longitude,
                    radius = excluded.radius,
                    type = excluded.type,
                    is_active = excluded.is_active,
                    updated_at = excluded.updated_at",
                params![
                    geofence.id.as_str(),
                    geofence.group_id.as_str(),
                    geofence.name,
                    geofence.center.latitude,
                    geofence.center.longitude,
                    geofence.radius_m,
                    geofence.kind.as_str(),
                    geofence.active,
                    geofence.created_by,
                    now,
                ],
            )
            .map_err(db_error("upsert_geofence"))?;
            Ok(())
        })
    }

    fn get(&self, id: &GeofenceId) -> Result<Option<Geofence>> {
        timed(TABLE, "get", || {
            let conn = acquire_lock(&self.conn);
            conn.query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM geofences WHERE id = ?1"),
                params![id.as_str()],
                Self::row_to_geofence,
            )
            .optional()
            .map_err(db_error("get_geofence"))
        })
    }

    fn set_active(&self, id: &GeofenceId, active: bool) -> Result<bool> {
        timed(TABLE, "set_active", || {
            let conn = acquire_lock(&self.conn);
            let changed = conn
                .execute(
                    "UPDATE geofences SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id.as_str(), active, to_millis(Utc::now())],
                )
                .map_err(db_error("set_geofence_active"))?;
            Ok(changed > 0)
        })
    }

    fn list_active(&self, group_id: &GroupId) -> Result<Vec<Geofence>> {
        timed(TABLE, "list_active", || self.list(group_id, true))
    }

    fn list_all(&self, group_id: &GroupId) -> Result<Vec<Geofence>> {
        timed(TABLE, "list_all", || self.list(group_id, false))
    }
}
