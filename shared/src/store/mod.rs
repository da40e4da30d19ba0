//! Relational persistence and session discipline.
//!
//! `Store` is a thin session factory, not a connection cache: every call
//! that needs the database opens its own [`rusqlite::Connection`], runs to
//! completion, and drops it. This is a deliberate departure from a single
//! shared connection reused across concurrent activities — under WAL mode,
//! SQLite lets multiple short-lived connections interleave safely, whereas a
//! single long-lived connection serializes every caller behind one
//! `Mutex`/`RefCell` and turns a stuck query into a system-wide stall.
//!
//! Submodules hold the actual SQL as free functions over `&Connection`,
//! grouped by aggregate: [`tasks`], [`proxies`], [`found_items`].

pub mod found_items;
pub mod proxies;
pub mod tasks;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("../../migrations/0001_init.sql"))];

/// Opens sessions against a single SQLite database file and tracks applied
/// schema migrations.
#[derive(Debug, Clone)]
pub struct Store {
    database_path: PathBuf,
    busy_timeout: Duration,
}

impl Store {
    pub fn new(database_path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            database_path: database_path.into(),
            busy_timeout,
        }
    }

    /// Opens a fresh connection configured for this store's database: WAL
    /// journaling, a bounded auto-checkpoint, and the configured busy
    /// timeout so concurrent sessions wait briefly on contention instead of
    /// failing immediately with `SQLITE_BUSY`.
    pub fn open_session(&self) -> crate::Result<Connection> {
        let conn = Connection::open(&self.database_path).map_err(|e| {
            crate::MonitoringError::Store(format!(
                "failed to open database {}: {e}",
                self.database_path.display()
            ))
        })?;

        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(|e| crate::MonitoringError::Store(format!("failed to enable WAL: {e}")))?;
        conn.query_row("PRAGMA wal_autocheckpoint=1000", [], |_| Ok(()))
            .map_err(|e| {
                crate::MonitoringError::Store(format!("failed to set wal_autocheckpoint: {e}"))
            })?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| crate::MonitoringError::Store(format!("failed to set busy_timeout: {e}")))?;
        conn.execute("PRAGMA foreign_keys=ON", [])
            .map_err(|e| crate::MonitoringError::Store(format!("failed to enable foreign_keys: {e}")))?;

        Ok(conn)
    }

    /// Applies every migration newer than the database's recorded schema
    /// version. Safe to call on every startup.
    pub fn migrate(&self) -> crate::Result<()> {
        let conn = self.open_session()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version     INTEGER PRIMARY KEY,
                applied_at  INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| crate::MonitoringError::Store(format!("failed to create schema_migrations: {e}")))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .map_err(|e| crate::MonitoringError::Store(format!("failed to read schema version: {e}")))?;

        for (version, sql) in MIGRATIONS {
            if *version <= current_version {
                continue;
            }

            debug!(version, "applying schema migration");
            conn.execute_batch(sql)
                .map_err(|e| crate::MonitoringError::Store(format!("migration {version} failed: {e}")))?;
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, crate::time::now_unix()],
            )
            .map_err(|e| {
                crate::MonitoringError::Store(format!("failed to record migration {version}: {e}"))
            })?;
        }

        Ok(())
    }

    /// Checkpoints the WAL back into the main database file. Intended to be
    /// called periodically by a background task, not after every write.
    pub fn checkpoint_wal(&self) -> crate::Result<i64> {
        let conn = self.open_session()?;
        let (_busy, _log_frames, checkpointed): (i64, i64, i64) = conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(|e| crate::MonitoringError::Store(format!("WAL checkpoint failed: {e}")))?;
        Ok(checkpointed)
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("test.db"), Duration::from_secs(5));
        store.migrate().unwrap();
        (dir, store)
    }

    #[test]
    fn migrate_is_idempotent() {
        let (_dir, store) = temp_store();
        store.migrate().unwrap();
        store.migrate().unwrap();

        let conn = store.open_session().unwrap();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn open_session_enables_wal_mode() {
        let (_dir, store) = temp_store();
        let conn = store.open_session().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
