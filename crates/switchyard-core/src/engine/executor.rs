//! Session engine: drives a graph one step at a time with durable checkpoints.
//!
//! The `Engine` processes one `advance` or `release` call per session at a
//! time. Each call loads the latest checkpoint, runs steps until it reaches a
//! resting point (terminal route, await marker, gated step, or failure), and
//! commits a checkpoint after every step. A gated step suspends the session;
//! the paused workflow holds no engine resources until `release` is called.
//!
//! # Execution flow
//!
//! 1. Load the latest checkpoint (or start an empty session).
//! 2. Append the user turn and start at the active context's entry step.
//! 3. For each step: gate check -> run handler -> apply update -> route -> commit.
//! 4. `End` inside a skill pops back to the parent; `Delegate` pushes a skill.
//! 5. Return `Completed`, `Suspended`, or `Failed`.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::json;
use switchyard_types::config::EngineConfig;
use switchyard_types::event::EngineEvent;
use switchyard_types::outcome::{
    ActionDescriptor, Decision, ErrorDescriptor, FailureKind, Outcome, UserTurn,
};
use switchyard_types::session::{ActionRequest, PendingStep, SessionId, SessionState, SkillId, Turn};
use tokio::sync::broadcast;

use crate::event::bus::EventBus;
use crate::graph::Graph;
use crate::graph::interrupt::{GateResolution, InterruptController};
use crate::graph::registry::DelegationRequest;
use crate::graph::routing::{NextStep, RouteDecision, RoutingError};
use crate::repository::checkpoint::CheckpointRepository;

use super::checkpoint::{CheckpointError, CheckpointManager};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Longest accepted session identifier.
pub const MAX_SESSION_ID_LEN: usize = 256;

// ---------------------------------------------------------------------------
// SessionEngine trait
// ---------------------------------------------------------------------------

/// External interface of a session engine.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach.
pub trait SessionEngine: Send + Sync {
    /// Submit a new user turn.
    fn advance(
        &self,
        session_id: &SessionId,
        turn: UserTurn,
    ) -> impl std::future::Future<Output = Result<Outcome, EngineError>> + Send;

    /// Resolve a suspended gated step.
    fn release(
        &self,
        session_id: &SessionId,
        decision: Decision,
    ) -> impl std::future::Future<Output = Result<Outcome, EngineError>> + Send;
}

// ---------------------------------------------------------------------------
// Internal run bookkeeping
// ---------------------------------------------------------------------------

/// Working state of one call.
struct Run {
    state: SessionState,
    /// Version of the last committed checkpoint.
    version: u64,
    /// History length at which this call's output starts.
    mark: usize,
    /// Steps executed during this call.
    executed: u32,
}

/// The step about to run and how control got there.
struct Cursor {
    step: String,
    origin: Option<String>,
    /// Delegation depth `origin` ran at.
    origin_depth: usize,
    action: Option<ActionRequest>,
    /// Gate already cleared by an approval.
    approved: bool,
}

impl Cursor {
    fn entry(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            origin: None,
            origin_depth: 0,
            action: None,
            approved: false,
        }
    }

    fn after(
        step: impl Into<String>,
        origin: &str,
        origin_depth: usize,
        action: Option<ActionRequest>,
    ) -> Self {
        Self {
            step: step.into(),
            origin: Some(origin.to_string()),
            origin_depth,
            action,
            approved: false,
        }
    }
}

enum Transition {
    Route(RouteDecision),
    Pop(Option<String>),
}

/// Removes the session from the in-flight set when dropped.
struct SessionGuard<'a> {
    active: &'a DashMap<SessionId, ()>,
    session_id: SessionId,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.session_id);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Checkpointed, interruptible graph engine.
///
/// Generic over `R: CheckpointRepository` for storage flexibility.
pub struct Engine<R: CheckpointRepository> {
    graph: Arc<Graph>,
    checkpoint: CheckpointManager<R>,
    interrupts: InterruptController,
    event_bus: EventBus,
    max_steps_per_call: u32,
    /// Sessions with a call in flight in this process.
    active: DashMap<SessionId, ()>,
}

impl<R: CheckpointRepository> Engine<R> {
    /// Create an engine for `graph` persisting through `repo`.
    ///
    /// Gates from `config.gated_steps` are added to the graph's own gates.
    pub fn new(graph: Arc<Graph>, repo: R, config: &EngineConfig) -> Self {
        let configured = InterruptController::new(config.gated_steps.iter().cloned());
        for step in configured.gated_steps() {
            if !graph.registry().contains(step) {
                tracing::warn!(step, "configured gate names an unregistered step");
            }
        }
        let mut interrupts = graph.interrupts().clone();
        interrupts.extend(&configured);

        Self {
            graph,
            checkpoint: CheckpointManager::new(repo, config.checkpoint_retention),
            interrupts,
            event_bus: EventBus::from_config(config),
            max_steps_per_call: config.max_steps_per_call.max(1),
            active: DashMap::new(),
        }
    }

    /// Replace the event bus (to share one bus between components).
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_bus.subscribe()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    pub fn checkpoints(&self) -> &CheckpointManager<R> {
        &self.checkpoint
    }

    /// Latest committed state of a session.
    pub async fn session(&self, session_id: &SessionId) -> Result<Option<SessionState>, EngineError> {
        Ok(self.checkpoint.load(session_id).await?.map(|cp| cp.state))
    }

    fn lock_session(&self, session_id: &SessionId) -> Result<SessionGuard<'_>, EngineError> {
        match self.active.entry(session_id.clone()) {
            Entry::Occupied(_) => Err(EngineError::SessionBusy(session_id.clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Ok(SessionGuard {
                    active: &self.active,
                    session_id: session_id.clone(),
                })
            }
        }
    }

    async fn commit(&self, run: &mut Run, next_step: Option<&str>) -> Result<(), EngineError> {
        run.version = self.checkpoint.commit(&run.state, run.version, next_step).await?;
        Ok(())
    }

    fn completed(run: Run) -> Outcome {
        Outcome::Completed {
            turns: run.state.history[run.mark..].to_vec(),
        }
    }

    /// Run steps from `cursor` until the session reaches a resting point.
    async fn drive(&self, mut run: Run, mut cursor: Cursor) -> Result<Outcome, EngineError> {
        loop {
            if run.executed >= self.max_steps_per_call {
                let message = format!(
                    "step limit of {} exceeded before step '{}'",
                    self.max_steps_per_call, cursor.step
                );
                return self
                    .fail(run, FailureKind::StepLimit, Some(cursor.step), message)
                    .await;
            }

            if !cursor.approved && self.interrupts.is_gated(&cursor.step) {
                return self.suspend(run, cursor).await;
            }

            let Some(handler) = self.graph.registry().resolve(&cursor.step) else {
                let message = format!("step '{}' is not registered", cursor.step);
                return self
                    .fail(run, FailureKind::Routing, Some(cursor.step), message)
                    .await;
            };

            let session_id = run.state.session_id.clone();
            run.state.active_action = cursor.action.clone();

            self.event_bus.publish(EngineEvent::StepStarted {
                session_id: session_id.clone(),
                step: cursor.step.clone(),
                skill: run.state.active_skill().map(|s| s.to_string()),
            });

            let started = Instant::now();
            let result = handler.run_boxed(&run.state).await;
            let update = match result {
                Ok(update) => update,
                Err(e) => {
                    return self
                        .fail(run, FailureKind::Handler, Some(cursor.step), e.to_string())
                        .await;
                }
            };

            // Apply to a copy; a routing failure discards the step's output.
            let mut next_state = run.state.clone();
            update.apply_to(&mut next_state, &cursor.step);
            run.executed += 1;

            let transition = match update.delegation {
                Some(DelegationRequest::Push(skill)) => {
                    if self.graph.skill(&skill).is_none() {
                        let error = RoutingError::UnknownSkill(skill.to_string());
                        return self
                            .fail(run, FailureKind::Routing, Some(cursor.step), error.to_string())
                            .await;
                    }
                    Transition::Route(RouteDecision {
                        next: NextStep::Delegate(skill),
                        action: None,
                    })
                }
                Some(DelegationRequest::Pop { reason }) if !next_state.delegation_stack.is_empty() => {
                    Transition::Pop(reason)
                }
                _ => match self.graph.routing().route(&cursor.step, &next_state) {
                    Ok(decision) => Transition::Route(decision),
                    Err(e) => {
                        return self
                            .fail(run, FailureKind::Routing, Some(cursor.step), e.to_string())
                            .await;
                    }
                },
            };

            run.state = next_state;
            let from = cursor.step.clone();
            let depth = run.state.delegation_stack.depth();

            self.event_bus.publish(EngineEvent::StepCompleted {
                session_id,
                step: from.clone(),
                next: match &transition {
                    Transition::Route(decision) => decision.next.to_string(),
                    Transition::Pop(_) => "<pop>".to_string(),
                },
                duration_ms: started.elapsed().as_millis() as u64,
            });

            let next_cursor = match transition {
                Transition::Route(RouteDecision {
                    next: NextStep::Step(step),
                    action,
                }) => Some(Cursor::after(step, &from, depth, action)),
                Transition::Route(RouteDecision {
                    next: NextStep::Delegate(skill),
                    ..
                }) => {
                    self.enter_skill(&mut run.state, &skill, &from);
                    let entry = self.graph.entry_for(Some(&skill)).to_string();
                    Some(Cursor::after(entry, &from, depth, None))
                }
                Transition::Route(RouteDecision {
                    next: NextStep::Await,
                    ..
                }) => None,
                Transition::Route(RouteDecision {
                    next: NextStep::End,
                    ..
                }) => {
                    if run.state.delegation_stack.is_empty() {
                        None
                    } else {
                        self.leave_skill(&mut run.state, &from, None)
                    }
                }
                Transition::Pop(reason) => self.leave_skill(&mut run.state, &from, reason),
            };

            match next_cursor {
                Some(next) => {
                    self.commit(&mut run, Some(&next.step)).await?;
                    cursor = next;
                }
                None => {
                    self.commit(&mut run, None).await?;
                    tracing::debug!(
                        session_id = %run.state.session_id,
                        steps = run.executed,
                        "session at rest"
                    );
                    return Ok(Self::completed(run));
                }
            }
        }
    }

    /// Push `skill` and announce the transfer in the shared history.
    fn enter_skill(&self, state: &mut SessionState, skill: &SkillId, from: &str) {
        let description = self
            .graph
            .skill(skill)
            .map(|s| s.description.clone())
            .unwrap_or_default();

        state.delegation_stack.push(skill.clone());
        let mut content = format!("Control transferred to skill '{skill}'.");
        if !description.is_empty() {
            content.push(' ');
            content.push_str(&description);
        }
        content.push_str(
            " The conversation so far is shared context. Act only within this scope and return control when the task is complete or out of scope.",
        );

        let mut turn = Turn::system(content).with_data(json!({
            "event": "delegate",
            "skill": skill,
            "depth": state.delegation_stack.depth(),
        }));
        turn.step = Some(from.to_string());
        turn.skill = Some(skill.clone());
        state.push_turn(turn);

        tracing::info!(
            session_id = %state.session_id,
            skill = skill.as_str(),
            depth = state.delegation_stack.depth(),
            "delegated to skill"
        );
        self.event_bus.publish(EngineEvent::Delegated {
            session_id: state.session_id.clone(),
            skill: skill.to_string(),
            depth: state.delegation_stack.depth(),
        });
    }

    /// Pop the active skill and pick the parent's resume step if it declares
    /// one. The resume step has no proposing step in the parent context.
    fn leave_skill(
        &self,
        state: &mut SessionState,
        from: &str,
        reason: Option<String>,
    ) -> Option<Cursor> {
        let parent = self.pop_skill(state, from, reason)?;
        self.graph.resume_for(parent.as_ref()).map(Cursor::entry)
    }

    /// Pop the active skill and announce the return in the shared history.
    /// Returns the new active context, or `None` if the stack was empty.
    fn pop_skill(
        &self,
        state: &mut SessionState,
        from: &str,
        reason: Option<String>,
    ) -> Option<Option<SkillId>> {
        let popped = state.delegation_stack.pop()?;
        let parent = state.active_skill().cloned();
        let parent_label = match &parent {
            Some(p) => format!("skill '{p}'"),
            None => "the primary assistant".to_string(),
        };

        let mut content = format!("Skill '{popped}' finished; control returns to {parent_label}.");
        if let Some(reason) = &reason {
            content.push_str(&format!(" Reason: {reason}."));
        }
        let mut turn = Turn::system(content).with_data(json!({
            "event": "return",
            "skill": popped,
            "reason": reason,
        }));
        turn.step = Some(from.to_string());
        turn.skill = parent.clone();
        state.push_turn(turn);

        tracing::info!(
            session_id = %state.session_id,
            skill = popped.as_str(),
            depth = state.delegation_stack.depth(),
            "returned from skill"
        );
        self.event_bus.publish(EngineEvent::Returned {
            session_id: state.session_id.clone(),
            skill: popped.to_string(),
            depth: state.delegation_stack.depth(),
        });

        Some(parent)
    }

    async fn suspend(&self, mut run: Run, cursor: Cursor) -> Result<Outcome, EngineError> {
        run.state.active_action = None;
        run.state.pending_step = Some(PendingStep {
            step: cursor.step.clone(),
            origin: cursor.origin.clone(),
            origin_depth: cursor.origin.as_ref().map(|_| cursor.origin_depth),
            action: cursor.action.clone(),
        });
        self.commit(&mut run, Some(&cursor.step)).await?;

        tracing::info!(
            session_id = %run.state.session_id,
            step = cursor.step.as_str(),
            proposed_by = cursor.origin.as_deref().unwrap_or("-"),
            "suspended before gated step"
        );
        self.event_bus.publish(EngineEvent::Suspended {
            session_id: run.state.session_id.clone(),
            step: cursor.step.clone(),
            proposed_by: cursor.origin.clone(),
        });

        Ok(Outcome::Suspended {
            gated_step: cursor.step.clone(),
            proposed_action: ActionDescriptor {
                step: cursor.step,
                proposed_by: cursor.origin,
                action: cursor.action,
            },
        })
    }

    /// Record a failure turn on top of the last good state and commit it.
    async fn fail(
        &self,
        mut run: Run,
        kind: FailureKind,
        step: Option<String>,
        message: String,
    ) -> Result<Outcome, EngineError> {
        run.state.active_action = None;
        run.state.requested_actions.clear();
        run.state.pending_step = None;

        let content = match &step {
            Some(step) => format!("Step '{step}' failed: {message}"),
            None => format!("Execution failed: {message}"),
        };
        let mut turn = Turn::system(content).with_data(json!({
            "event": "failure",
            "kind": kind,
        }));
        turn.step = step.clone();
        turn.skill = run.state.active_skill().cloned();
        run.state.push_turn(turn);

        self.commit(&mut run, None).await?;

        tracing::warn!(
            session_id = %run.state.session_id,
            step = step.as_deref().unwrap_or("-"),
            error = message.as_str(),
            "step failed"
        );
        self.event_bus.publish(EngineEvent::Failed {
            session_id: run.state.session_id.clone(),
            step: step.clone(),
            error: message.clone(),
        });

        Ok(Outcome::Failed {
            error: ErrorDescriptor {
                kind,
                step,
                message,
            },
        })
    }
}

fn validate_session_id(session_id: &SessionId) -> Result<(), EngineError> {
    let id = session_id.as_str();
    if id.trim().is_empty() {
        return Err(EngineError::Validation("session id must not be empty".to_string()));
    }
    if id.len() > MAX_SESSION_ID_LEN {
        return Err(EngineError::Validation(format!(
            "session id exceeds {MAX_SESSION_ID_LEN} bytes"
        )));
    }
    Ok(())
}

impl<R: CheckpointRepository> SessionEngine for Engine<R> {
    async fn advance(&self, session_id: &SessionId, turn: UserTurn) -> Result<Outcome, EngineError> {
        validate_session_id(session_id)?;
        if turn.content.trim().is_empty() {
            return Err(EngineError::Validation("turn content must not be empty".to_string()));
        }

        let _guard = self.lock_session(session_id)?;

        let (mut state, version) = match self.checkpoint.load(session_id).await? {
            Some(cp) => (cp.state, cp.version),
            None => (SessionState::new(session_id.clone()), 0),
        };

        if let Some(pending) = &state.pending_step {
            return Err(EngineError::Validation(format!(
                "session '{session_id}' is awaiting a decision on step '{}'; release it first",
                pending.step
            )));
        }

        state.requested_actions.clear();
        state.active_action = None;
        let mut user_turn = turn.into_turn();
        user_turn.skill = state.active_skill().cloned();
        state.push_turn(user_turn);

        let entry = self.graph.entry_for(state.active_skill()).to_string();
        tracing::info!(
            session_id = %session_id,
            version,
            entry = entry.as_str(),
            "advancing session"
        );

        let mark = state.history.len();
        self.drive(
            Run {
                state,
                version,
                mark,
                executed: 0,
            },
            Cursor::entry(entry),
        )
        .await
    }

    async fn release(&self, session_id: &SessionId, decision: Decision) -> Result<Outcome, EngineError> {
        validate_session_id(session_id)?;
        if let Decision::Deny { reason } = &decision {
            if reason.trim().is_empty() {
                return Err(EngineError::Validation("denial reason must not be empty".to_string()));
            }
        }

        let _guard = self.lock_session(session_id)?;

        let Some(cp) = self.checkpoint.load(session_id).await? else {
            return Err(EngineError::Validation(format!("unknown session '{session_id}'")));
        };
        let mut state = cp.state;

        let Some(pending) = state.pending_step.take() else {
            tracing::debug!(session_id = %session_id, "release with nothing pending; ignoring");
            return Ok(Outcome::Completed { turns: Vec::new() });
        };

        let mark = state.history.len();
        let mut run = Run {
            state,
            version: cp.version,
            mark,
            executed: 0,
        };

        match self.interrupts.resolve(pending, &decision) {
            GateResolution::Execute {
                step,
                origin,
                action,
            } => {
                // The cleared pending step is durable before the handler runs,
                // so one approval executes the step at most once.
                self.commit(&mut run, Some(&step)).await?;

                tracing::info!(session_id = %session_id, step = step.as_str(), "gated step approved");
                self.event_bus.publish(EngineEvent::Released {
                    session_id: session_id.clone(),
                    step: step.clone(),
                    approved: true,
                });

                let cursor = Cursor {
                    step,
                    origin,
                    origin_depth: run.state.delegation_stack.depth(),
                    action,
                    approved: true,
                };
                self.drive(run, cursor).await
            }
            GateResolution::Reroute {
                origin,
                origin_depth,
                mut notice,
            } => {
                let denied_step = notice
                    .data
                    .as_ref()
                    .and_then(|d| d.get("denied_step"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();

                notice.step = Some(denied_step.clone());
                notice.skill = run.state.active_skill().cloned();
                run.state.push_turn(notice);
                run.state.requested_actions.clear();
                run.state.active_action = None;

                // A denied skill entry leaves the skill pushed above the step
                // that proposed it; that step reruns in its own context.
                if let Some(depth) = origin_depth {
                    while run.state.delegation_stack.depth() > depth {
                        let reason = format!("step '{denied_step}' was denied");
                        if self.pop_skill(&mut run.state, &denied_step, Some(reason)).is_none() {
                            break;
                        }
                    }
                }

                tracing::info!(
                    session_id = %session_id,
                    step = denied_step.as_str(),
                    reroute_to = origin.as_deref().unwrap_or("-"),
                    "gated step denied"
                );
                self.event_bus.publish(EngineEvent::Released {
                    session_id: session_id.clone(),
                    step: denied_step,
                    approved: false,
                });

                match origin {
                    Some(origin) => self.drive(run, Cursor::entry(origin)).await,
                    None => {
                        tracing::warn!(
                            session_id = %session_id,
                            "denied step has no proposing step; stopping"
                        );
                        self.commit(&mut run, None).await?;
                        Ok(Self::completed(run))
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors surfaced by `advance`/`release`. Step failures are not errors;
/// they come back as `Outcome::Failed`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed input, rejected before any state changed.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The checkpoint store failed or another writer won the race.
    #[error("persistence error: {0}")]
    Persistence(#[from] CheckpointError),

    /// Another call for this session is in flight in this process.
    #[error("session '{0}' is busy with another call")]
    SessionBusy(SessionId),
}

impl EngineError {
    /// Whether the call lost a race with another writer for the same session.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::SessionBusy(_) | EngineError::Persistence(CheckpointError::Conflict { .. })
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
