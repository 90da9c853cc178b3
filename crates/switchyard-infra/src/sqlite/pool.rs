//! Checkpoint database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. Checkpoint appends go through a
//! single-connection writer pool, which also serializes the version check
//! inside each append transaction. Loads and listings use a read-only pool so
//! sessions can be read concurrently while another session commits.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::resolve_data_dir;

/// Readers kept open for concurrent session loads.
const READER_CONNECTIONS: u32 = 8;

/// Split read/write pool for SQLite with WAL mode.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Connect to `database_url`, creating the file if needed.
    ///
    /// Migrations run on the writer before the reader pool opens, so readers
    /// always see the `checkpoints` table.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts.clone())
            .await?;

        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(base_opts.read_only(true))
            .await?;

        tracing::debug!(url = database_url, "checkpoint database ready");
        Ok(Self { reader, writer })
    }

    /// Open `{data_dir}/{file_name}`, creating the directory first.
    pub async fn open(data_dir: &Path, file_name: &str) -> Result<Self, sqlx::Error> {
        tokio::fs::create_dir_all(data_dir).await?;
        Self::new(&database_url(data_dir, file_name)).await
    }
}

/// Build a SQLite URL for `file_name` inside `data_dir`.
pub fn database_url(data_dir: &Path, file_name: &str) -> String {
    format!("sqlite://{}", data_dir.join(file_name).display())
}

/// Default database URL: `switchyard.db` in the resolved data directory.
pub fn default_database_url() -> String {
    database_url(&resolve_data_dir(), "switchyard.db")
}
