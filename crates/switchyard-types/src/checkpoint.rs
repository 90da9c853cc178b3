//! Checkpoint records.
//!
//! A checkpoint is an immutable, versioned snapshot of a session's state plus
//! the step that would run next. Versions are per-session and strictly
//! increasing; the store uses them for optimistic concurrency control.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::{SessionId, SessionState};

/// A persisted snapshot of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// UUIDv7 row identifier.
    pub id: Uuid,
    pub session_id: SessionId,
    /// Per-session version, starting at 1.
    pub version: u64,
    pub state: SessionState,
    /// The step to run next, or None if the session is idle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Build the checkpoint that follows `previous_version` for `state`.
    pub fn next(state: SessionState, previous_version: u64, next_step: Option<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            session_id: state.session_id.clone(),
            version: previous_version + 1,
            state,
            next_step,
            created_at: Utc::now(),
        }
    }

    /// Version the store must currently hold for this checkpoint to be accepted.
    pub fn expected_version(&self) -> u64 {
        self.version.saturating_sub(1)
    }
}

/// Lightweight listing row for a session's latest checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub version: u64,
    pub turns: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_skill: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSummary {
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            session_id: checkpoint.session_id.clone(),
            version: checkpoint.version,
            turns: checkpoint.state.history.len(),
            pending_step: checkpoint.state.pending_step.as_ref().map(|p| p.step.clone()),
            active_skill: checkpoint.state.active_skill().map(|s| s.to_string()),
            updated_at: checkpoint.created_at,
        }
    }
}
