//! Checkpoint repository trait definition.
//!
//! Defines the storage interface for versioned session checkpoints. The
//! infrastructure layer (switchyard-infra) implements this trait with SQLite
//! persistence.

use switchyard_types::checkpoint::{Checkpoint, SessionSummary};
use switchyard_types::error::RepositoryError;
use switchyard_types::session::SessionId;

/// Repository trait for checkpoint persistence.
///
/// Reads and writes are keyed by session; implementations must not serialize
/// unrelated sessions behind one another beyond what the backend requires.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointRepository: Send + Sync {
    /// Latest checkpoint for a session, if any.
    fn load_latest(
        &self,
        session_id: &SessionId,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// Append a checkpoint with compare-and-swap semantics.
    ///
    /// Succeeds only if the session's latest stored version equals
    /// `checkpoint.expected_version()` (0 = no checkpoint yet). Otherwise
    /// returns `RepositoryError::VersionConflict` and stores nothing.
    fn save(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Checkpoints for a session, newest first, at most `limit`.
    fn list_versions(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;

    /// Delete all but the newest `keep` checkpoints. Returns rows removed.
    fn prune(
        &self,
        session_id: &SessionId,
        keep: u32,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// One summary row per session, most recently updated first.
    fn list_sessions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<SessionSummary>, RepositoryError>> + Send;
}
