use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::migrations::{self, Migration};

/// Thread-safe SQLite connection wrapper.
/// Uses parking_lot::Mutex for synchronous access (rusqlite is not Sync).
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open or create the annotator database and apply pending migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(migrations::PRAGMAS)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_owned(),
        };
        let applied = db.run_migrations(migrations::ALL_MIGRATIONS)?;
        info!(path = %path.display(), applied, "annotator database opened");
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(migrations::PRAGMAS)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        };
        db.run_migrations(migrations::ALL_MIGRATIONS)?;
        Ok(db)
    }

    /// Execute a closure with the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a closure inside a transaction. Rolls back on error.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest applied migration version, 0 before the first.
    pub fn schema_version(&self) -> Result<u32, StoreError> {
        self.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
                [],
                |row| row.get(0),
            )?;
            if !exists {
                return Ok(0);
            }
            let version: Option<u32> =
                conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
            Ok(version.unwrap_or(0))
        })
    }

    fn run_migrations(&self, all: &[Migration]) -> Result<u32, StoreError> {
        let current = self.schema_version()?;
        let mut applied = 0;

        for migration in all {
            if migration.version <= current {
                debug!(version = migration.version, name = migration.name, "migration already applied");
                continue;
            }
            self.with_tx(|tx| {
                for statement in migration.statements {
                    tx.execute_batch(statement).map_err(|e| StoreError::Migration {
                        version: migration.version,
                        name: migration.name,
                        detail: e.to_string(),
                    })?;
                }
                tx.execute(
                    "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                    rusqlite::params![migration.version, terra_core::utcnow()],
                )?;
                Ok(())
            })?;
            applied += 1;
            info!(version = migration.version, name = migration.name, "applied migration");
        }

        Ok(applied)
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            path: self.path.clone(),
        }
    }
}
