//! In-memory checkpoint repository backed by `DashMap`.
//!
//! Each session's checkpoint list lives under its own map entry, so the
//! entry lock makes the version check and the append one atomic step.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use switchyard_types::checkpoint::{Checkpoint, SessionSummary};
use switchyard_types::error::RepositoryError;
use switchyard_types::session::SessionId;

use super::checkpoint::CheckpointRepository;

/// Process-local `CheckpointRepository`. Contents are lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointRepository {
    sessions: DashMap<SessionId, Vec<Checkpoint>>,
}

impl InMemoryCheckpointRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total checkpoints held for a session.
    pub fn version_count(&self, session_id: &SessionId) -> usize {
        self.sessions.get(session_id).map(|v| v.len()).unwrap_or(0)
    }
}

impl CheckpointRepository for InMemoryCheckpointRepository {
    async fn load_latest(&self, session_id: &SessionId) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self
            .sessions
            .get(session_id)
            .and_then(|versions| versions.last().cloned()))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let expected = checkpoint.expected_version();
        match self.sessions.entry(checkpoint.session_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let actual = occupied.get().last().map(|c| c.version).unwrap_or(0);
                if actual != expected {
                    return Err(RepositoryError::VersionConflict {
                        session_id: checkpoint.session_id.to_string(),
                        expected,
                        actual,
                    });
                }
                occupied.get_mut().push(checkpoint.clone());
            }
            Entry::Vacant(vacant) => {
                if expected != 0 {
                    return Err(RepositoryError::VersionConflict {
                        session_id: checkpoint.session_id.to_string(),
                        expected,
                        actual: 0,
                    });
                }
                vacant.insert(vec![checkpoint.clone()]);
            }
        }
        Ok(())
    }

    async fn list_versions(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|versions| {
                versions
                    .iter()
                    .rev()
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn prune(&self, session_id: &SessionId, keep: u32) -> Result<u64, RepositoryError> {
        let Some(mut versions) = self.sessions.get_mut(session_id) else {
            return Ok(0);
        };
        let keep = keep as usize;
        if keep == 0 || versions.len() <= keep {
            return Ok(0);
        }
        let removed = versions.len() - keep;
        versions.drain(..removed);
        Ok(removed as u64)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, RepositoryError> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter_map(|entry| entry.value().last().map(SessionSummary::from_checkpoint))
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}
