//! Step handlers and the registry that names them.
//!
//! A step handler consumes the current [`SessionState`] and returns a
//! [`PartialUpdate`]; it never persists anything itself. Handlers use RPITIT
//! for their async `run`, so they cannot be trait objects directly:
//! 1. `StepHandlerDyn` is the object-safe twin with a boxed future
//! 2. every `StepHandler` gets `StepHandlerDyn` for free
//! 3. the registry stores `Arc<dyn StepHandlerDyn>`

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use switchyard_types::session::{ActionRequest, SessionState, SkillId, Turn};

// ---------------------------------------------------------------------------
// PartialUpdate
// ---------------------------------------------------------------------------

/// A single mutation of the shared scratch map.
#[derive(Debug, Clone, PartialEq)]
pub enum ScratchOp {
    Set(String, Value),
    Remove(String),
}

/// A handler's request to change the delegation stack.
#[derive(Debug, Clone, PartialEq)]
pub enum DelegationRequest {
    /// Hand control to a skill.
    Push(SkillId),
    /// Finish (or escalate out of) the active skill.
    Pop { reason: Option<String> },
}

/// The output of one step: turns to append, scratch changes, action
/// requests for routing, and an optional delegation change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialUpdate {
    pub turns: Vec<Turn>,
    pub scratch: Vec<ScratchOp>,
    pub actions: Vec<ActionRequest>,
    pub delegation: Option<DelegationRequest>,
}

impl PartialUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an assistant turn.
    pub fn say(mut self, content: impl Into<String>) -> Self {
        self.turns.push(Turn::assistant(content));
        self
    }

    pub fn turn(mut self, turn: Turn) -> Self {
        self.turns.push(turn);
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.scratch.push(ScratchOp::Set(key.into(), value));
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.scratch.push(ScratchOp::Remove(key.into()));
        self
    }

    /// Request a domain action; routing decides which step performs it.
    pub fn request(mut self, kind: impl Into<String>, payload: Value) -> Self {
        self.actions.push(ActionRequest::new(kind, payload));
        self
    }

    pub fn push_skill(mut self, skill: impl Into<SkillId>) -> Self {
        self.delegation = Some(DelegationRequest::Push(skill.into()));
        self
    }

    pub fn pop_skill(mut self, reason: Option<String>) -> Self {
        self.delegation = Some(DelegationRequest::Pop { reason });
        self
    }

    /// Apply the non-delegation parts of this update to `state`.
    ///
    /// Turns without an explicit step/skill are attributed to `step` and the
    /// currently active skill. Requested actions replace the previous step's.
    pub fn apply_to(&self, state: &mut SessionState, step: &str) {
        let skill = state.active_skill().cloned();
        for turn in &self.turns {
            let mut turn = turn.clone();
            if turn.step.is_none() {
                turn.step = Some(step.to_string());
            }
            if turn.skill.is_none() {
                turn.skill = skill.clone();
            }
            state.push_turn(turn);
        }

        for op in &self.scratch {
            match op {
                ScratchOp::Set(key, value) => {
                    state.scratch.insert(key.clone(), value.clone());
                }
                ScratchOp::Remove(key) => {
                    state.scratch.remove(key);
                }
            }
        }

        state.requested_actions = self.actions.clone();
        state.active_action = None;
        state.step_count += 1;
    }
}

// ---------------------------------------------------------------------------
// HandlerError
// ---------------------------------------------------------------------------

/// Errors raised by a step's domain logic.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("missing scratch field '{0}'")]
    MissingField(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

// ---------------------------------------------------------------------------
// StepHandler (RPITIT) + object-safe wrapper
// ---------------------------------------------------------------------------

/// A unit of work in the graph.
pub trait StepHandler: Send + Sync {
    fn run(
        &self,
        state: &SessionState,
    ) -> impl Future<Output = Result<PartialUpdate, HandlerError>> + Send;
}

/// Object-safe version of [`StepHandler`] with a boxed future.
pub trait StepHandlerDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        state: &'a SessionState,
    ) -> Pin<Box<dyn Future<Output = Result<PartialUpdate, HandlerError>> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn run_boxed<'a>(
        &'a self,
        state: &'a SessionState,
    ) -> Pin<Box<dyn Future<Output = Result<PartialUpdate, HandlerError>> + Send + 'a>> {
        Box::pin(self.run(state))
    }
}

/// Adapter turning a synchronous closure into a [`StepHandler`].
pub struct FnStep<F>(F);

impl<F> StepHandler for FnStep<F>
where
    F: Fn(&SessionState) -> Result<PartialUpdate, HandlerError> + Send + Sync,
{
    fn run(
        &self,
        state: &SessionState,
    ) -> impl Future<Output = Result<PartialUpdate, HandlerError>> + Send {
        std::future::ready((self.0)(state))
    }
}

/// Wrap a closure as a step handler.
pub fn step_fn<F>(f: F) -> FnStep<F>
where
    F: Fn(&SessionState) -> Result<PartialUpdate, HandlerError> + Send + Sync,
{
    FnStep(f)
}

// ---------------------------------------------------------------------------
// StepRegistry
// ---------------------------------------------------------------------------

/// Maps step names to handlers.
#[derive(Default, Clone)]
pub struct StepRegistry {
    handlers: HashMap<String, Arc<dyn StepHandlerDyn>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`. Returns `false` (and keeps the
    /// existing handler) if the name is already taken.
    pub fn register<H: StepHandler + 'static>(&mut self, name: impl Into<String>, handler: H) -> bool {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return false;
        }
        self.handlers.insert(name, Arc::new(handler));
        true
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn StepHandlerDyn>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered step names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_types::session::TurnRole;

    struct Echo;

    impl StepHandler for Echo {
        async fn run(&self, state: &SessionState) -> Result<PartialUpdate, HandlerError> {
            let last = state
                .last_user_turn()
                .map(|t| t.content.clone())
                .unwrap_or_default();
            Ok(PartialUpdate::new().say(format!("echo: {last}")))
        }
    }

    #[tokio::test]
    async fn resolve_returns_registered_handler() {
        let mut registry = StepRegistry::new();
        assert!(registry.register("echo", Echo));

        let mut state = SessionState::new("s".into());
        state.push_turn(Turn::user("ping"));

        let handler = registry.resolve("echo").unwrap();
        let update = handler.run_boxed(&state).await.unwrap();
        assert_eq!(update.turns[0].content, "echo: ping");
        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = StepRegistry::new();
        assert!(registry.register("a", step_fn(|_| Ok(PartialUpdate::new()))));
        assert!(!registry.register("a", step_fn(|_| Ok(PartialUpdate::new()))));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["a"]);
    }

    #[tokio::test]
    async fn fn_step_propagates_errors() {
        let handler = step_fn(|_| Err(HandlerError::failed("record lookup failed")));
        let state = SessionState::new("s".into());
        let err = handler.run(&state).await.unwrap_err();
        assert_eq!(err.to_string(), "record lookup failed");
    }

    #[test]
    fn apply_to_attributes_turns_and_mutates_scratch() {
        let mut state = SessionState::new("s".into());
        state.delegation_stack.push("billing".into());
        state.scratch.insert("stale".to_string(), json!(true));
        state.requested_actions = vec![ActionRequest::new("old", json!(null))];

        let update = PartialUpdate::new()
            .say("done")
            .set("balance", json!(12))
            .remove("stale")
            .request("refund", json!({"amount": 12}));
        update.apply_to(&mut state, "billing_agent");

        let turn = &state.history[0];
        assert_eq!(turn.role, TurnRole::Assistant);
        assert_eq!(turn.step.as_deref(), Some("billing_agent"));
        assert_eq!(turn.skill.as_ref().unwrap().as_str(), "billing");
        assert_eq!(state.scratch.get("balance"), Some(&json!(12)));
        assert!(!state.scratch.contains_key("stale"));
        assert_eq!(state.requested_actions.len(), 1);
        assert_eq!(state.requested_actions[0].kind, "refund");
        assert_eq!(state.step_count, 1);
    }
}
