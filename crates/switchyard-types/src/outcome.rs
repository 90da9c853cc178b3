//! Inputs and outcomes of the engine's external interface.
//!
//! Callers submit a [`UserTurn`] via `advance` or a [`Decision`] via `release`
//! and get back an [`Outcome`]. Suspension is a normal outcome, not an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{ActionRequest, Turn};

/// A new external input for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTurn {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl UserTurn {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            data: None,
        }
    }

    pub fn into_turn(self) -> Turn {
        let turn = Turn::user(self.content);
        match self.data {
            Some(data) => turn.with_data(data),
            None => turn,
        }
    }
}

/// External decision on a suspended gated step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Deny { reason: String },
}

impl Decision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Decision::Deny {
            reason: reason.into(),
        }
    }
}

/// What a suspended session is waiting to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    /// The gated step that will run on approval.
    pub step: String,
    /// The step that proposed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_by: Option<String>,
    /// The requested action, when the step was reached through an action route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionRequest>,
}

/// Category of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A step's domain logic failed.
    Handler,
    /// A step produced a result the routing table could not place.
    Routing,
    /// The per-call step limit was exceeded.
    StepLimit,
}

/// Human-readable description of a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub message: String,
}

/// Result of one `advance` or `release` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Execution reached a resting point. `turns` are the turns appended
    /// during the call, excluding the submitted user turn.
    Completed { turns: Vec<Turn> },
    /// Execution halted before a gated step.
    Suspended {
        gated_step: String,
        proposed_action: ActionDescriptor,
    },
    /// A step failed; the failure was recorded as a system turn.
    Failed { error: ErrorDescriptor },
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed { .. })
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Outcome::Suspended { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }

    /// Turns produced by a completed call; empty for other outcomes.
    pub fn turns(&self) -> &[Turn] {
        match self {
            Outcome::Completed { turns } => turns,
            _ => &[],
        }
    }
}
