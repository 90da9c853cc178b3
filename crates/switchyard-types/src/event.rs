//! Event types for the Switchyard engine event bus.
//!
//! `EngineEvent` is broadcast as sessions move through the graph. All
//! variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// Events emitted while the engine drives a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A step handler is about to run.
    StepStarted {
        session_id: SessionId,
        step: String,
        skill: Option<String>,
    },

    /// A step handler returned and its update was applied.
    StepCompleted {
        session_id: SessionId,
        step: String,
        next: String,
        duration_ms: u64,
    },

    /// Execution halted before a gated step.
    Suspended {
        session_id: SessionId,
        step: String,
        proposed_by: Option<String>,
    },

    /// A suspended step was approved or denied.
    Released {
        session_id: SessionId,
        step: String,
        approved: bool,
    },

    /// Control moved into a skill.
    Delegated {
        session_id: SessionId,
        skill: String,
        depth: usize,
    },

    /// A skill handed control back to its parent.
    Returned {
        session_id: SessionId,
        skill: String,
        depth: usize,
    },

    /// A call failed.
    Failed {
        session_id: SessionId,
        step: Option<String>,
        error: String,
    },
}

impl EngineEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            EngineEvent::StepStarted { session_id, .. }
            | EngineEvent::StepCompleted { session_id, .. }
            | EngineEvent::Suspended { session_id, .. }
            | EngineEvent::Released { session_id, .. }
            | EngineEvent::Delegated { session_id, .. }
            | EngineEvent::Returned { session_id, .. }
            | EngineEvent::Failed { session_id, .. } => session_id,
        }
    }
}
