//! Routing table: decides the next step from the current session state.
//!
//! Each step owns an ordered list of [`RouteRule`]s. Rules are evaluated in
//! declaration order and the first match wins. This is also the tie-break
//! when a step requests several actions at once: the earliest declared
//! `ActionRequested` rule whose kind was requested is taken, and the matching
//! request becomes the routed step's `active_action`.
//!
//! Routing is a pure function of `SessionState`; the table holds no mutable
//! routing state, so replaying a checkpoint reproduces the same path.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use switchyard_types::session::{ActionRequest, SessionState, SkillId};

// ---------------------------------------------------------------------------
// NextStep
// ---------------------------------------------------------------------------

/// Where control goes after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// Run another step.
    Step(String),
    /// Terminal marker for the active context. Inside a skill this pops
    /// back to the parent.
    End,
    /// Stop this call but keep the active context (wait for the next input).
    Await,
    /// Push a skill and continue at its entry step.
    Delegate(SkillId),
}

impl NextStep {
    pub fn step(name: impl Into<String>) -> Self {
        NextStep::Step(name.into())
    }

    pub fn delegate(skill: impl Into<SkillId>) -> Self {
        NextStep::Delegate(skill.into())
    }
}

impl fmt::Display for NextStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextStep::Step(name) => write!(f, "{name}"),
            NextStep::End => write!(f, "<end>"),
            NextStep::Await => write!(f, "<await>"),
            NextStep::Delegate(skill) => write!(f, "<delegate:{skill}>"),
        }
    }
}

// ---------------------------------------------------------------------------
// Conditions and rules
// ---------------------------------------------------------------------------

/// Predicate over session state.
pub type StatePredicate = Arc<dyn Fn(&SessionState) -> bool + Send + Sync>;

/// When a rule applies.
#[derive(Clone)]
pub enum Condition {
    Always,
    /// The step requested an action of this kind.
    ActionRequested(String),
    ScratchEquals(String, Value),
    ScratchPresent(String),
    Predicate(StatePredicate),
}

impl Condition {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&SessionState) -> bool + Send + Sync + 'static,
    {
        Condition::Predicate(Arc::new(f))
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Always => write!(f, "Always"),
            Condition::ActionRequested(kind) => write!(f, "ActionRequested({kind})"),
            Condition::ScratchEquals(key, value) => write!(f, "ScratchEquals({key}, {value})"),
            Condition::ScratchPresent(key) => write!(f, "ScratchPresent({key})"),
            Condition::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// One `(condition, target)` pair.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub when: Condition,
    pub to: NextStep,
}

/// The routing result for a step.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub next: NextStep,
    /// Set when the decision came from an `ActionRequested` rule.
    pub action: Option<ActionRequest>,
}

/// Routing failures. The engine treats these like handler failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("no route declared for step '{0}'")]
    NoRoute(String),

    #[error("step '{step}' requested unrecognized action '{kind}'")]
    UnhandledAction { step: String, kind: String },

    #[error("no rule matched for step '{0}'")]
    NoMatch(String),

    #[error("unknown skill '{0}'")]
    UnknownSkill(String),
}

// ---------------------------------------------------------------------------
// RoutingTable
// ---------------------------------------------------------------------------

/// Per-step ordered routing rules.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<String, Vec<RouteRule>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an unconditional rule (a static edge).
    pub fn edge(&mut self, from: impl Into<String>, to: NextStep) {
        self.rule(from, Condition::Always, to);
    }

    /// Append a conditional rule. Order of calls is evaluation order.
    pub fn rule(&mut self, from: impl Into<String>, when: Condition, to: NextStep) {
        self.routes
            .entry(from.into())
            .or_default()
            .push(RouteRule { when, to });
    }

    pub fn rules(&self, step: &str) -> Option<&[RouteRule]> {
        self.routes.get(step).map(Vec::as_slice)
    }

    /// Iterate every `(from, target)` pair, for validation.
    pub fn targets(&self) -> impl Iterator<Item = (&str, &NextStep)> {
        self.routes
            .iter()
            .flat_map(|(from, rules)| rules.iter().map(move |r| (from.as_str(), &r.to)))
    }

    /// Decide where control goes after `step`, given the state that step left.
    pub fn route(&self, step: &str, state: &SessionState) -> Result<RouteDecision, RoutingError> {
        let rules = self
            .routes
            .get(step)
            .ok_or_else(|| RoutingError::NoRoute(step.to_string()))?;

        // Every requested action must be recognized by this step's table.
        for action in &state.requested_actions {
            let known = rules.iter().any(
                |r| matches!(&r.when, Condition::ActionRequested(kind) if kind == &action.kind),
            );
            if !known {
                return Err(RoutingError::UnhandledAction {
                    step: step.to_string(),
                    kind: action.kind.clone(),
                });
            }
        }

        for rule in rules {
            match &rule.when {
                Condition::ActionRequested(kind) => {
                    if let Some(action) = state.requested_actions.iter().find(|a| &a.kind == kind) {
                        if state.requested_actions.len() > 1 {
                            tracing::debug!(
                                step,
                                chosen = kind.as_str(),
                                requested = state.requested_actions.len(),
                                "several actions requested; taking first declared route"
                            );
                        }
                        return Ok(RouteDecision {
                            next: rule.to.clone(),
                            action: Some(action.clone()),
                        });
                    }
                }
                other => {
                    if evaluate(other, state) {
                        return Ok(RouteDecision {
                            next: rule.to.clone(),
                            action: None,
                        });
                    }
                }
            }
        }

        Err(RoutingError::NoMatch(step.to_string()))
    }
}

fn evaluate(condition: &Condition, state: &SessionState) -> bool {
    match condition {
        Condition::Always => true,
        Condition::ActionRequested(kind) => state.has_requested(kind),
        Condition::ScratchEquals(key, value) => state.scratch.get(key) == Some(value),
        Condition::ScratchPresent(key) => state.scratch.contains_key(key),
        Condition::Predicate(f) => f(state),
    }
}
