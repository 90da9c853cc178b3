//! Session state types for Switchyard.
//!
//! `SessionState` is the unit of truth for one conversation: the append-only
//! turn history, the shared scratch map, the delegation stack, and the step
//! (if any) waiting on external approval. It is passed explicitly into every
//! step handler and serialized whole into each checkpoint.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque caller-supplied session identifier. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of a skill (a delegated sub-workflow).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SkillId(pub String);

impl SkillId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SkillId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SkillId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Turns
// ---------------------------------------------------------------------------

/// Who authored a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    /// Engine-synthesized turns (delegation notices, denials, failures).
    System,
    /// Output of a domain action executed by a step.
    Tool,
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnRole::User => write!(f, "user"),
            TurnRole::Assistant => write!(f, "assistant"),
            TurnRole::System => write!(f, "system"),
            TurnRole::Tool => write!(f, "tool"),
        }
    }
}

/// A single entry in the session history.
///
/// `seq` is assigned by [`SessionState::push_turn`] and is strictly
/// increasing within a session. Turns carry no wall-clock time so that
/// replaying the same calls reproduces an identical state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(default)]
    pub seq: u64,
    pub role: TurnRole,
    pub content: String,
    /// Step that produced the turn, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// Skill active when the turn was produced (None = root).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<SkillId>,
    /// Structured payload (action results, denial details).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Turn {
    fn with_role(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            seq: 0,
            role,
            content: content.into(),
            step: None,
            skill: None,
            data: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(TurnRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(TurnRole::System, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::with_role(TurnRole::Tool, content)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// A domain action requested by a step, e.g. `{kind: "cancel", payload: {...}}`.
///
/// Resolved to a step through the routing table, never by reflection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl ActionRequest {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Delegation stack
// ---------------------------------------------------------------------------

/// Ordered stack of active skills. Top of stack is the active skill; an
/// empty stack means the root handler is active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DelegationStack(Vec<SkillId>);

impl DelegationStack {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, skill: SkillId) {
        self.0.push(skill);
    }

    /// Remove the top skill. Popping an empty stack is a no-op returning `None`.
    pub fn pop(&mut self) -> Option<SkillId> {
        self.0.pop()
    }

    /// The active skill, or `None` when the root handler is active.
    pub fn active(&self) -> Option<&SkillId> {
        self.0.last()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SkillId> {
        self.0.iter()
    }
}

// ---------------------------------------------------------------------------
// Pending gated step
// ---------------------------------------------------------------------------

/// A gated step held back awaiting an external decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingStep {
    /// The gated step that was about to run.
    pub step: String,
    /// The step whose routing produced the gated request (denials return here).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Delegation depth `origin` ran at. A gated skill entry sits one level
    /// deeper than the step that pushed the skill.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_depth: Option<usize>,
    /// The action request that routed to the gated step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionRequest>,
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Complete execution state for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    #[serde(default)]
    pub history: Vec<Turn>,
    #[serde(default)]
    pub scratch: BTreeMap<String, Value>,
    #[serde(default)]
    pub delegation_stack: DelegationStack,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_step: Option<PendingStep>,
    /// Actions requested by the most recently executed step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requested_actions: Vec<ActionRequest>,
    /// The action the current step was routed to perform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_action: Option<ActionRequest>,
    /// Logical count of executed steps over the session's lifetime.
    #[serde(default)]
    pub step_count: u64,
}

impl SessionState {
    /// Create an empty state for a new session.
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            history: Vec::new(),
            scratch: BTreeMap::new(),
            delegation_stack: DelegationStack::new(),
            pending_step: None,
            requested_actions: Vec::new(),
            active_action: None,
            step_count: 0,
        }
    }

    /// Append a turn, assigning the next sequence number. Returns the seq.
    pub fn push_turn(&mut self, mut turn: Turn) -> u64 {
        let seq = self.history.last().map(|t| t.seq + 1).unwrap_or(1);
        turn.seq = seq;
        self.history.push(turn);
        seq
    }

    /// The active skill, or `None` when the root handler is active.
    pub fn active_skill(&self) -> Option<&SkillId> {
        self.delegation_stack.active()
    }

    /// The most recent user turn, if any.
    pub fn last_user_turn(&self) -> Option<&Turn> {
        self.history.iter().rev().find(|t| t.role == TurnRole::User)
    }

    pub fn scratch_get(&self, key: &str) -> Option<&Value> {
        self.scratch.get(key)
    }

    /// Whether an action of the given kind was requested by the last step.
    pub fn has_requested(&self, kind: &str) -> bool {
        self.requested_actions.iter().any(|a| a.kind == kind)
    }
}
