//! Pool construction for the task-state and execution stores.
//!
//! Everything tunable comes from [`DatabaseConfig`]. File databases run in
//! WAL mode with foreign keys on. A `:memory:` database lives in exactly one
//! connection, so its pool never grows past one.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;

use crate::domain::models::DatabaseConfig;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Cannot create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot open database {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("Database did not answer: {0}")]
    Unreachable(#[source] sqlx::Error),
}

/// Open a pool for the configured database, creating the file and its
/// parent directories when missing.
pub async fn open_pool(config: &DatabaseConfig) -> Result<SqlitePool, ConnectionError> {
    if config.is_in_memory() {
        return memory_pool().await;
    }

    let path = config.file_path();
    create_parent_dir(&path)?;

    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(config.busy_timeout());

    debug!(
        path = %path.display(),
        max_connections = config.max_connections,
        "opening sqlite pool"
    );
    SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(config.acquire_timeout())
        .connect_with(options)
        .await
        .map_err(|source| ConnectionError::Open {
            path: path.display().to_string(),
            source,
        })
}

/// Single-connection in-process database.
pub async fn memory_pool() -> Result<SqlitePool, ConnectionError> {
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|source| ConnectionError::Open {
            path: ":memory:".to_string(),
            source,
        })
}

fn create_parent_dir(path: &Path) -> Result<(), ConnectionError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
            std::fs::create_dir_all(parent).map_err(|source| ConnectionError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}

/// Round-trip a trivial query.
pub async fn ping(pool: &SqlitePool) -> Result<(), ConnectionError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(ConnectionError::Unreachable)
}
