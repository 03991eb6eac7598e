//! Shared connection handling for `SQLite` backends.
//!
//! Every table backend owns its own `Mutex<Connection>`; these helpers open
//! and tune connections and recover from poisoned locks.

use crate::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Busy timeout applied to every connection, in milliseconds.
pub const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Acquires a mutex lock with poison recovery.
///
/// A panic inside a previous critical section leaves the connection itself
/// usable, so the inner value is recovered and a warning is logged.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("SQLite mutex was poisoned, recovering");
            metrics::counter!("sqlite_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Configures a connection for concurrent use.
///
/// - **WAL mode**: concurrent readers with a single writer
/// - **NORMAL synchronous**: durable at transaction commit in WAL mode
/// - **`busy_timeout`**: waits for locks instead of failing immediately
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the busy timeout cannot be applied.
pub fn configure_connection(conn: &Connection) -> Result<()> {
    // journal_mode returns a row, so pragma_update may report an error even
    // when the mode was applied; in-memory databases stay in "memory" mode.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    conn.busy_timeout(std::time::Duration::from_millis(u64::from(BUSY_TIMEOUT_MS)))
        .map_err(|e| Error::OperationFailed {
            operation: "configure_connection".to_string(),
            cause: e.to_string(),
        })?;
    Ok(())
}

/// Opens and configures a file-backed connection, creating parent directories.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the directory or database cannot be
/// created.
pub fn open_file(path: &Path, operation: &str) -> Result<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| Error::OperationFailed {
            operation: format!("{operation}_create_dir"),
            cause: format!("{}: {e}", parent.display()),
        })?;
    }
    let conn = Connection::open(path).map_err(|e| Error::OperationFailed {
        operation: operation.to_string(),
        cause: format!("{}: {e}", path.display()),
    })?;
    configure_connection(&conn)?;
    Ok(conn)
}

/// Opens a private in-memory connection.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if `SQLite` cannot allocate the database.
pub fn open_in_memory(operation: &str) -> Result<Connection> {
    let conn = Connection::open_in_memory().map_err(|e| Error::OperationFailed {
        operation: operation.to_string(),
        cause: e.to_string(),
    })?;
    configure_connection(&conn)?;
    Ok(conn)
}

/// Maps a `rusqlite` error into [`Error::OperationFailed`].
pub fn db_error(operation: &str) -> impl FnOnce(rusqlite::Error) -> Error + '_ {
    move |e| Error::OperationFailed {
        operation: operation.to_string(),
        cause: e.to_string(),
    }
}
