//! Interrupt controller: which steps need approval, and what a decision does.
//!
//! A gated step moves through `Pending -> {Approved -> Executed, Denied ->
//! Rerouted}`. `Pending` is the only state that outlives a call; the engine
//! stores it as `SessionState::pending_step`. [`InterruptController::resolve`]
//! turns a pending step plus a [`Decision`] into the engine's next move.

use std::collections::BTreeSet;

use serde_json::json;
use switchyard_types::outcome::Decision;
use switchyard_types::session::{ActionRequest, PendingStep, Turn};

/// What the engine does after a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum GateResolution {
    /// Approved: run the gated step (bypassing the gate once).
    Execute {
        step: String,
        origin: Option<String>,
        action: Option<ActionRequest>,
    },
    /// Denied: append `notice`, unwind to `origin_depth`, and resume at the
    /// proposing step.
    Reroute {
        origin: Option<String>,
        origin_depth: Option<usize>,
        notice: Turn,
    },
}

/// Static set of gated step names.
#[derive(Debug, Clone, Default)]
pub struct InterruptController {
    gated: BTreeSet<String>,
}

impl InterruptController {
    pub fn new<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            gated: steps.into_iter().map(Into::into).collect(),
        }
    }

    pub fn gate(&mut self, step: impl Into<String>) {
        self.gated.insert(step.into());
    }

    pub fn is_gated(&self, step: &str) -> bool {
        self.gated.contains(step)
    }

    pub fn gated_steps(&self) -> impl Iterator<Item = &str> {
        self.gated.iter().map(String::as_str)
    }

    /// Merge another controller's gates into this one.
    pub fn extend(&mut self, other: &InterruptController) {
        self.gated.extend(other.gated.iter().cloned());
    }

    /// Resolve a pending gated step.
    pub fn resolve(&self, pending: PendingStep, decision: &Decision) -> GateResolution {
        match decision {
            Decision::Approve => GateResolution::Execute {
                step: pending.step,
                origin: pending.origin,
                action: pending.action,
            },
            Decision::Deny { reason } => {
                let what = pending
                    .action
                    .as_ref()
                    .map(|a| format!("action '{}'", a.kind))
                    .unwrap_or_else(|| format!("step '{}'", pending.step));
                let notice = Turn::tool(format!(
                    "The user denied {what}. Reason: {reason}. Continue without performing it, taking the reason into account."
                ))
                .with_data(json!({
                    "denied_step": pending.step,
                    "action": pending.action,
                    "reason": reason,
                }));
                GateResolution::Reroute {
                    origin: pending.origin,
                    origin_depth: pending.origin_depth,
                    notice,
                }
            }
        }
    }
}
