//! SQLite checkpoint repository implementation.
//!
//! Implements `CheckpointRepository` from `switchyard-core` using sqlx with
//! split read/write pools. Session state is stored as a JSON blob per row.
//! Appends run inside a write transaction that re-reads the latest version,
//! and the `(session_id, version)` unique key rejects any writer that slips
//! past the check from another process.

use chrono::{DateTime, Utc};
use sqlx::Row;
use switchyard_core::repository::checkpoint::CheckpointRepository;
use switchyard_types::checkpoint::{Checkpoint, SessionSummary};
use switchyard_types::error::RepositoryError;
use switchyard_types::session::{SessionId, SessionState};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointRepository`.
pub struct SqliteCheckpointRepository {
    pool: DatabasePool,
}

impl SqliteCheckpointRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct CheckpointRow {
    id: String,
    session_id: String,
    version: i64,
    state: String,
    next_step: Option<String>,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            version: row.try_get("version")?,
            state: row.try_get("state")?,
            next_step: row.try_get("next_step")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        let state: SessionState = serde_json::from_str(&self.state)
            .map_err(|e| RepositoryError::Query(format!("invalid session state JSON: {e}")))?;

        Ok(Checkpoint {
            id: parse_uuid(&self.id)?,
            session_id: SessionId::new(self.session_id),
            version: self.version as u64,
            state,
            next_step: self.next_step,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

fn rows_to_checkpoints(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Checkpoint>, RepositoryError> {
    let mut checkpoints = Vec::with_capacity(rows.len());
    for row in rows {
        let r = CheckpointRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        checkpoints.push(r.into_checkpoint()?);
    }
    Ok(checkpoints)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// CheckpointRepository impl
// ---------------------------------------------------------------------------

impl CheckpointRepository for SqliteCheckpointRepository {
    async fn load_latest(&self, session_id: &SessionId) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM checkpoints WHERE session_id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(session_id.as_str())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let state_json = serde_json::to_string(&checkpoint.state)
            .map_err(|e| RepositoryError::Query(format!("serialize session state: {e}")))?;
        let expected = checkpoint.expected_version();
        let session_id = checkpoint.session_id.as_str();

        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let (actual,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM checkpoints WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if actual as u64 != expected {
            return Err(RepositoryError::VersionConflict {
                session_id: session_id.to_string(),
                expected,
                actual: actual as u64,
            });
        }

        sqlx::query(
            r#"INSERT INTO checkpoints (id, session_id, version, state, next_step, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(checkpoint.id.to_string())
        .bind(session_id)
        .bind(checkpoint.version as i64)
        .bind(&state_json)
        .bind(&checkpoint.next_step)
        .bind(format_datetime(&checkpoint.created_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.message().contains("UNIQUE") {
                    return RepositoryError::VersionConflict {
                        session_id: session_id.to_string(),
                        expected,
                        actual: checkpoint.version,
                    };
                }
            }
            RepositoryError::Query(e.to_string())
        })?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_versions(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM checkpoints WHERE session_id = ? ORDER BY version DESC LIMIT ?",
        )
        .bind(session_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows_to_checkpoints(&rows)
    }

    async fn prune(&self, session_id: &SessionId, keep: u32) -> Result<u64, RepositoryError> {
        if keep == 0 {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"DELETE FROM checkpoints
               WHERE session_id = ?
                 AND version <= (SELECT COALESCE(MAX(version), 0) FROM checkpoints WHERE session_id = ?) - ?"#,
        )
        .bind(session_id.as_str())
        .bind(session_id.as_str())
        .bind(keep as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT c.* FROM checkpoints c
               JOIN (SELECT session_id, MAX(version) AS latest
                     FROM checkpoints GROUP BY session_id) m
                 ON c.session_id = m.session_id AND c.version = m.latest
               ORDER BY c.created_at DESC, c.session_id ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(rows_to_checkpoints(&rows)?
            .iter()
            .map(SessionSummary::from_checkpoint)
            .collect())
    }
}
