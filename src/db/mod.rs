pub mod migrations;
pub mod models;
pub mod repos;

use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

use crate::engine::provider::SessionStore;
use crate::error::AppError;

use self::models::Session;
use self::repos::sessions as session_repo;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Connection customizer that sets per-connection SQLite pragmas.
#[derive(Debug)]
struct SqlitePragmaCustomizer;

impl CustomizeConnection<rusqlite::Connection, rusqlite::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        Ok(())
    }
}

/// Initialize the database: create file, enable WAL, run migrations.
pub fn init_db(data_dir: &Path) -> Result<DbPool, AppError> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("rpi.db");

    tracing::info!(path = %db_path.display(), "Initializing database");

    let manager = SqliteConnectionManager::file(&db_path);
    let pool = Pool::builder()
        .max_size(4)
        .connection_customizer(Box::new(SqlitePragmaCustomizer))
        .build(manager)?;

    // Database-wide, only needs to run once
    {
        let conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    }

    {
        let conn = pool.get()?;
        migrations::run(&conn)?;
    }

    tracing::info!("Database initialized successfully");
    Ok(pool)
}

/// Default location for the session database.
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("rpi-engine")
}

/// A migrated database in its own temp directory, removed on drop.
#[cfg(test)]
pub struct TestDb {
    pool: DbPool,
    dir: tempfile::TempDir,
}

#[cfg(test)]
impl TestDb {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

#[cfg(test)]
impl std::ops::Deref for TestDb {
    type Target = DbPool;

    fn deref(&self) -> &DbPool {
        &self.pool
    }
}

#[cfg(test)]
pub fn init_test_db() -> Result<TestDb, AppError> {
    use std::time::Duration;

    // In-memory databases are per-connection under r2d2, so use a file.
    let dir = tempfile::tempdir()?;
    let manager = SqliteConnectionManager::file(dir.path().join("rpi_test.db"));
    let pool = Pool::builder()
        .max_size(2)
        .connection_timeout(Duration::from_secs(5))
        .connection_customizer(Box::new(SqlitePragmaCustomizer))
        .build(manager)?;

    let conn = pool.get()?;
    migrations::run(&conn)?;
    drop(conn);
    Ok(TestDb { pool, dir })
}

// ============================================================================
// SessionStore backed by SQLite
// ============================================================================

/// Hands finished sessions to the SQLite `sessions` table.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: DbPool,
}

impl SqliteSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl SessionStore for SqliteSessionStore {
    fn save(&self, session: &Session) -> Result<(), AppError> {
        session_repo::save(&self.pool, session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_db_in_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path()).unwrap();
        assert!(dir.path().join("rpi.db").exists());
        let conn = pool.get().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_test_db_removed_on_drop() {
        let db = init_test_db().unwrap();
        let path = db.path().to_path_buf();
        assert!(path.join("rpi_test.db").exists());
        drop(db);
        assert!(!path.exists());
    }
}
