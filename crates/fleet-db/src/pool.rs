//! # Director Store
//!
//! Opens the SQLite file backing the device directory and hands out
//! repositories over one shared pool.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  DbConfig::new("director.db")      DbConfig::in_memory()                │
//! │          │                                   │                          │
//! │          ▼                                   ▼                          │
//! │  parent dir created, WAL,          one connection, never recycled       │
//! │  busy timeout                      (the data lives in that connection)  │
//! │          └─────────────┬─────────────────────┘                          │
//! │                        ▼                                                │
//! │              Database { SqlitePool } ── embedded migrations             │
//! │                        │                                                │
//! │     devices() commands() profiles() applications() housekeeping()      │
//! │                                                                         │
//! │  Readers: scheduler fleet scan, dedup checks                            │
//! │  Writers: enrollment upserts, command records, acknowledgements        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every write is a single-row UPDATE or UPSERT, so concurrent loops never
//! need an application-level lock; SQLite's busy timeout absorbs contention.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::application::ApplicationRepository;
use crate::repository::command::CommandRepository;
use crate::repository::device::DeviceRepository;
use crate::repository::housekeeping::HousekeepingRepository;
use crate::repository::profile::ProfileRepository;

const MEMORY_PATH: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// Where and how to open the store.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_path: PathBuf,

    /// Default: 4. Forced to 1 for in-memory stores.
    pub max_connections: u32,

    /// How long a caller waits for a free pooled connection.
    pub acquire_timeout: Duration,

    /// How long SQLite retries a locked database before failing a statement.
    pub busy_timeout: Duration,

    pub run_migrations: bool,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            run_migrations: true,
        }
    }

    /// A private, empty store that disappears with the `Database`.
    pub fn in_memory() -> Self {
        DbConfig {
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            ..Self::new(MEMORY_PATH)
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Opens the store as-is (schema managed elsewhere).
    pub fn without_migrations(mut self) -> Self {
        self.run_migrations = false;
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == MEMORY_PATH
    }

    fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        if self.is_in_memory() {
            return SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::Unavailable(e.to_string()));
        }

        Ok(SqliteConnectOptions::new()
            .filename(&self.database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(self.busy_timeout))
    }

    fn ensure_parent_dir(&self) -> DbResult<()> {
        if self.is_in_memory() {
            return Ok(());
        }
        match self.database_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DbError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
                })
            }
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Database
// =============================================================================

/// Handle to the director store. Clones share the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the store and applies pending migrations.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        config.ensure_parent_dir()?;

        let in_memory = config.is_in_memory();
        let mut options = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { config.max_connections })
            .acquire_timeout(config.acquire_timeout);
        if in_memory {
            // Dropping the only connection would drop the data.
            options = options.min_connections(1).idle_timeout(None).max_lifetime(None);
        }

        let pool = options
            .connect_with(config.connect_options()?)
            .await
            .map_err(|e| DbError::Unavailable(e.to_string()))?;

        info!(
            path = %config.database_path.display(),
            in_memory,
            max_connections = config.max_connections,
            "Director store opened"
        );

        let db = Database { pool };
        if config.run_migrations {
            migrations::run_migrations(&db.pool).await?;
        }
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn devices(&self) -> DeviceRepository {
        DeviceRepository::new(self.pool.clone())
    }

    pub fn commands(&self) -> CommandRepository {
        CommandRepository::new(self.pool.clone())
    }

    /// Device-specific and shared profile records.
    pub fn profiles(&self) -> ProfileRepository {
        ProfileRepository::new(self.pool.clone())
    }

    pub fn applications(&self) -> ApplicationRepository {
        ApplicationRepository::new(self.pool.clone())
    }

    /// Per-cycle cleanup queries run by the push scheduler.
    pub fn housekeeping(&self) -> HousekeepingRepository {
        HousekeepingRepository::new(self.pool.clone())
    }

    /// Round-trips a trivial statement.
    pub async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Director store closed");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
