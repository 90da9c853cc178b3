//! Durable checkpoint manager for session execution state.
//!
//! Wraps `CheckpointRepository` to provide a higher-level API for committing
//! session snapshots. Every step transition and every suspension is
//! persisted before the engine moves on, so a crash after a call returns
//! loses nothing already committed.

use switchyard_types::checkpoint::{Checkpoint, SessionSummary};
use switchyard_types::error::RepositoryError;
use switchyard_types::session::{SessionId, SessionState};

use crate::repository::checkpoint::CheckpointRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages versioned checkpoints for sessions.
///
/// Generic over `R: CheckpointRepository` so it works with any storage
/// backend (SQLite, in-memory, etc.).
pub struct CheckpointManager<R: CheckpointRepository> {
    repo: R,
    /// Versions kept per session after each commit (0 = keep all).
    retention: u32,
}

impl<R: CheckpointRepository> CheckpointManager<R> {
    /// Create a new checkpoint manager backed by the given repository.
    pub fn new(repo: R, retention: u32) -> Self {
        Self { repo, retention }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Load the latest checkpoint for a session.
    pub async fn load(&self, session_id: &SessionId) -> Result<Option<Checkpoint>, CheckpointError> {
        self.repo
            .load_latest(session_id)
            .await
            .map_err(CheckpointError::from_repository)
    }

    /// Commit `state` as the version after `previous_version`.
    ///
    /// Returns the new version. Fails with `Conflict` if another writer
    /// committed in between.
    pub async fn commit(
        &self,
        state: &SessionState,
        previous_version: u64,
        next_step: Option<&str>,
    ) -> Result<u64, CheckpointError> {
        let checkpoint = Checkpoint::next(
            state.clone(),
            previous_version,
            next_step.map(str::to_string),
        );

        self.repo
            .save(&checkpoint)
            .await
            .map_err(CheckpointError::from_repository)?;

        tracing::debug!(
            session_id = %state.session_id,
            version = checkpoint.version,
            next_step = next_step.unwrap_or("-"),
            "checkpoint committed"
        );

        if self.retention > 0 && checkpoint.version > u64::from(self.retention) {
            // Audit rows only; the latest checkpoint is already durable.
            if let Err(e) = self.repo.prune(&state.session_id, self.retention).await {
                tracing::warn!(session_id = %state.session_id, error = %e, "checkpoint prune failed");
            }
        }

        Ok(checkpoint.version)
    }

    /// Recent checkpoints for a session, newest first.
    pub async fn history(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.repo
            .list_versions(session_id, limit)
            .await
            .map_err(CheckpointError::from_repository)
    }

    /// Summaries of every stored session.
    pub async fn sessions(&self) -> Result<Vec<SessionSummary>, CheckpointError> {
        self.repo
            .list_sessions()
            .await
            .map_err(CheckpointError::from_repository)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    /// Another call committed this session first.
    #[error("session '{session_id}' was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        session_id: String,
        expected: u64,
        actual: u64,
    },
}

impl CheckpointError {
    fn from_repository(err: RepositoryError) -> Self {
        match err {
            RepositoryError::VersionConflict {
                session_id,
                expected,
                actual,
            } => CheckpointError::Conflict {
                session_id,
                expected,
                actual,
            },
            other => CheckpointError::Repository(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
