//! End-to-end engine behavior over an in-memory checkpoint store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use switchyard_core::engine::{CheckpointError, Engine, EngineError, SessionEngine};
use switchyard_core::graph::registry::{HandlerError, PartialUpdate, StepHandler, step_fn};
use switchyard_core::graph::routing::NextStep;
use switchyard_core::graph::{Graph, SkillDefinition};
use switchyard_core::repository::checkpoint::CheckpointRepository;
use switchyard_core::repository::memory::InMemoryCheckpointRepository;
use switchyard_types::checkpoint::{Checkpoint, SessionSummary};
use switchyard_types::config::EngineConfig;
use switchyard_types::error::RepositoryError;
use switchyard_types::event::EngineEvent;
use switchyard_types::outcome::{Decision, FailureKind, Outcome, UserTurn};
use switchyard_types::session::{SessionId, SessionState, TurnRole};

// ---------------------------------------------------------------------------
// Test repository: shared, with switchable save failures
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct TestRepo {
    inner: Arc<InMemoryCheckpointRepository>,
    fail_saves: Arc<AtomicBool>,
}

impl CheckpointRepository for TestRepo {
    async fn load_latest(&self, session_id: &SessionId) -> Result<Option<Checkpoint>, RepositoryError> {
        self.inner.load_latest(session_id).await
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(RepositoryError::Query("disk full".to_string()));
        }
        self.inner.save(checkpoint).await
    }

    async fn list_versions(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        self.inner.list_versions(session_id, limit).await
    }

    async fn prune(&self, session_id: &SessionId, keep: u32) -> Result<u64, RepositoryError> {
        self.inner.prune(session_id, keep).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, RepositoryError> {
        self.inner.list_sessions().await
    }
}

// ---------------------------------------------------------------------------
// Support-desk graph
// ---------------------------------------------------------------------------

fn assistant(state: &SessionState) -> Result<PartialUpdate, HandlerError> {
    let last = state
        .history
        .last()
        .ok_or_else(|| HandlerError::failed("empty history"))?;

    match last.role {
        TurnRole::Tool => {
            let reason = last
                .data
                .as_ref()
                .and_then(|d| d.get("reason"))
                .and_then(Value::as_str)
                .unwrap_or("no reason given");
            Ok(PartialUpdate::new().say(format!("Understood, I will not cancel it ({reason}).")))
        }
        TurnRole::System => Ok(PartialUpdate::new().say("Anything else I can help with?")),
        _ => {
            let text = last.content.to_lowercase();
            if text.contains("cancel") {
                Ok(PartialUpdate::new()
                    .say("Requesting cancellation of order A-12.")
                    .request("cancel", json!({"order": "A-12"})))
            } else if text.contains("flight") {
                Ok(PartialUpdate::new().push_skill("flights"))
            } else {
                Ok(PartialUpdate::new().say("Order A-12 is on its way."))
            }
        }
    }
}

/// Root assistant with a gated `cancel` step and a `flights` skill.
fn support_graph(cancels: Arc<AtomicUsize>) -> Graph {
    Graph::builder("assistant")
        .step("assistant", step_fn(assistant))
        .step(
            "cancel",
            step_fn(move |s: &SessionState| {
                cancels.fetch_add(1, Ordering::SeqCst);
                let order = s
                    .active_action
                    .as_ref()
                    .and_then(|a| a.payload.get("order"))
                    .and_then(Value::as_str)
                    .ok_or(HandlerError::MissingField("order".to_string()))?;
                Ok(PartialUpdate::new().say(format!("Cancelled order {order}.")))
            }),
        )
        .step(
            "flights",
            step_fn(|_| Ok(PartialUpdate::new().say("Flight desk: your flight is rebooked."))),
        )
        .on_action("assistant", "cancel", NextStep::step("cancel"))
        .edge("assistant", NextStep::End)
        .edge("cancel", NextStep::End)
        .edge("flights", NextStep::End)
        .gate("cancel")
        .skill(SkillDefinition::new("flights", "flights").describe("Handles flight changes."))
        .build()
        .unwrap()
}

fn support_engine() -> (Engine<TestRepo>, TestRepo, Arc<AtomicUsize>) {
    let cancels = Arc::new(AtomicUsize::new(0));
    let repo = TestRepo::default();
    let engine = Engine::new(
        Arc::new(support_graph(cancels.clone())),
        repo.clone(),
        &EngineConfig::default(),
    );
    (engine, repo, cancels)
}

fn sid() -> SessionId {
    SessionId::new("session-1")
}

async fn history_len(engine: &Engine<TestRepo>) -> usize {
    engine
        .session(&sid())
        .await
        .unwrap()
        .map(|s| s.history.len())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fresh_session_completes_with_one_turn() {
    let (engine, _, _) = support_engine();

    let outcome = engine
        .advance(&sid(), UserTurn::new("check my status"))
        .await
        .unwrap();

    let Outcome::Completed { turns } = outcome else {
        panic!("expected Completed, got {outcome:?}");
    };
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, TurnRole::Assistant);
    assert_eq!(turns[0].step.as_deref(), Some("assistant"));

    let state = engine.session(&sid()).await.unwrap().unwrap();
    assert_eq!(state.history.len(), 2);
    assert!(state.pending_step.is_none());
}

#[tokio::test]
async fn gated_cancel_suspends_then_approval_executes() {
    let (engine, _, cancels) = support_engine();

    let outcome = engine
        .advance(&sid(), UserTurn::new("please cancel my order"))
        .await
        .unwrap();
    let Outcome::Suspended {
        gated_step,
        proposed_action,
    } = outcome
    else {
        panic!("expected Suspended, got {outcome:?}");
    };
    assert_eq!(gated_step, "cancel");
    assert_eq!(proposed_action.proposed_by.as_deref(), Some("assistant"));
    assert_eq!(proposed_action.action.unwrap().payload["order"], "A-12");
    assert_eq!(cancels.load(Ordering::SeqCst), 0);

    let pending = engine.session(&sid()).await.unwrap().unwrap().pending_step.unwrap();
    assert_eq!(pending.step, "cancel");

    let outcome = engine.release(&sid(), Decision::Approve).await.unwrap();
    let Outcome::Completed { turns } = outcome else {
        panic!("expected Completed, got {outcome:?}");
    };
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].content, "Cancelled order A-12.");
    assert_eq!(cancels.load(Ordering::SeqCst), 1);

    let latest = engine.checkpoints().load(&sid()).await.unwrap().unwrap();
    assert!(latest.state.pending_step.is_none());
    assert!(latest.state.active_action.is_none());
}

#[tokio::test]
async fn denial_reroutes_to_proposing_step_with_reason() {
    let (engine, _, cancels) = support_engine();
    let mut events = engine.subscribe();

    engine
        .advance(&sid(), UserTurn::new("cancel it"))
        .await
        .unwrap();
    let outcome = engine
        .release(&sid(), Decision::deny("wrong item"))
        .await
        .unwrap();

    let Outcome::Completed { turns } = outcome else {
        panic!("expected Completed, got {outcome:?}");
    };
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, TurnRole::Tool);
    assert!(turns[0].content.contains("wrong item"));
    assert_eq!(turns[1].step.as_deref(), Some("assistant"));
    assert!(turns[1].content.contains("wrong item"));
    assert_eq!(cancels.load(Ordering::SeqCst), 0);

    // The first step started after the release is the proposing step.
    let mut after_release = None;
    let mut released = false;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::Released { approved, .. } => {
                assert!(!approved);
                released = true;
            }
            EngineEvent::StepStarted { step, .. } if released && after_release.is_none() => {
                after_release = Some(step);
            }
            _ => {}
        }
    }
    assert_eq!(after_release.as_deref(), Some("assistant"));

    let state = engine.session(&sid()).await.unwrap().unwrap();
    assert!(state.pending_step.is_none());
}

/// Root pushes `billing` unless the user just denied it; `billing` is gated.
fn gated_skill_graph() -> Graph {
    Graph::builder("root")
        .step(
            "root",
            step_fn(|s: &SessionState| {
                let denied = s
                    .history
                    .iter()
                    .rev()
                    .take_while(|t| t.role != TurnRole::User)
                    .any(|t| t.role == TurnRole::Tool);
                if denied {
                    Ok(PartialUpdate::new().say("ok, staying at root"))
                } else {
                    Ok(PartialUpdate::new().push_skill("billing"))
                }
            }),
        )
        .step("billing", step_fn(|_| Ok(PartialUpdate::new().say("invoice sent"))))
        .edge("root", NextStep::End)
        .edge("billing", NextStep::End)
        .gate("billing")
        .skill(SkillDefinition::new("billing", "billing").describe("Handles invoices."))
        .build()
        .unwrap()
}

#[tokio::test]
async fn denied_skill_entry_reruns_proposer_in_its_own_context() {
    let engine = Engine::new(
        Arc::new(gated_skill_graph()),
        InMemoryCheckpointRepository::new(),
        &EngineConfig::default(),
    );

    let outcome = engine.advance(&sid(), UserTurn::new("bill me")).await.unwrap();
    let Outcome::Suspended {
        gated_step,
        proposed_action,
    } = outcome
    else {
        panic!("expected Suspended, got {outcome:?}");
    };
    assert_eq!(gated_step, "billing");
    assert_eq!(proposed_action.proposed_by.as_deref(), Some("root"));
    let state = engine.session(&sid()).await.unwrap().unwrap();
    assert_eq!(state.delegation_stack.depth(), 1);

    let outcome = engine
        .release(&sid(), Decision::deny("no billing"))
        .await
        .unwrap();
    let turns = outcome.turns();
    assert_eq!(turns.len(), 3, "{turns:?}");

    assert_eq!(turns[0].role, TurnRole::Tool);
    assert_eq!(turns[0].skill.as_ref().map(|s| s.as_str()), Some("billing"));

    assert_eq!(turns[1].role, TurnRole::System);
    assert!(turns[1].content.contains("Skill 'billing' finished"));
    assert!(turns[1].content.contains("'billing' was denied"));
    assert!(turns[1].skill.is_none());

    assert_eq!(turns[2].content, "ok, staying at root");
    assert_eq!(turns[2].step.as_deref(), Some("root"));
    assert!(turns[2].skill.is_none());

    let state = engine.session(&sid()).await.unwrap().unwrap();
    assert!(state.delegation_stack.is_empty());
    assert!(state.pending_step.is_none());
    let returns = state
        .history
        .iter()
        .filter(|t| t.content.contains("finished; control returns"))
        .count();
    assert_eq!(returns, 1);

    // A fresh request pushes onto an empty stack again.
    engine.advance(&sid(), UserTurn::new("bill me after all")).await.unwrap();
    let state = engine.session(&sid()).await.unwrap().unwrap();
    assert_eq!(state.delegation_stack.depth(), 1);
}

#[tokio::test]
async fn denied_resume_step_does_not_reenter_finished_skill() {
    let survey_runs = Arc::new(AtomicUsize::new(0));
    let runs = survey_runs.clone();
    let graph = Graph::builder("root")
        .step("root", step_fn(|_| Ok(PartialUpdate::new().push_skill("survey"))))
        .step(
            "survey",
            step_fn(move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(PartialUpdate::new().say("survey done"))
            }),
        )
        .step("wrap_up", step_fn(|_| Ok(PartialUpdate::new().say("wrapped up"))))
        .edge("root", NextStep::End)
        .edge("survey", NextStep::End)
        .edge("wrap_up", NextStep::End)
        .gate("wrap_up")
        .skill(SkillDefinition::new("survey", "survey"))
        .resume_root_at("wrap_up")
        .build()
        .unwrap();
    let engine = Engine::new(
        Arc::new(graph),
        InMemoryCheckpointRepository::new(),
        &EngineConfig::default(),
    );

    let outcome = engine.advance(&sid(), UserTurn::new("hi")).await.unwrap();
    let Outcome::Suspended {
        gated_step,
        proposed_action,
    } = outcome
    else {
        panic!("expected Suspended, got {outcome:?}");
    };
    assert_eq!(gated_step, "wrap_up");
    assert!(proposed_action.proposed_by.is_none());

    let outcome = engine.release(&sid(), Decision::deny("skip it")).await.unwrap();
    let turns = outcome.turns();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, TurnRole::Tool);

    let state = engine.session(&sid()).await.unwrap().unwrap();
    assert!(state.delegation_stack.is_empty());
    assert!(state.pending_step.is_none());
    assert_eq!(survey_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn suspended_session_resumes_on_a_new_engine() {
    let cancels = Arc::new(AtomicUsize::new(0));
    let repo = TestRepo::default();

    let first = Engine::new(
        Arc::new(support_graph(cancels.clone())),
        repo.clone(),
        &EngineConfig::default(),
    );
    let outcome = first
        .advance(&sid(), UserTurn::new("please cancel my order"))
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Suspended { .. }));
    drop(first);

    let second = Engine::new(
        Arc::new(support_graph(cancels.clone())),
        repo.clone(),
        &EngineConfig::default(),
    );
    let outcome = second.release(&sid(), Decision::Approve).await.unwrap();
    let Outcome::Completed { turns } = outcome else {
        panic!("expected Completed, got {outcome:?}");
    };
    assert_eq!(turns.last().unwrap().content, "Cancelled order A-12.");
    assert_eq!(cancels.load(Ordering::SeqCst), 1);

    let state = second.session(&sid()).await.unwrap().unwrap();
    assert!(state.pending_step.is_none());
    assert_eq!(state.last_user_turn().unwrap().content, "please cancel my order");
}

#[tokio::test]
async fn skill_terminal_pops_back_to_root_in_same_call() {
    let (engine, _, _) = support_engine();
    let mut events = engine.subscribe();

    let outcome = engine
        .advance(&sid(), UserTurn::new("I need to change my flight"))
        .await
        .unwrap();
    assert!(outcome.is_completed());

    let state = engine.session(&sid()).await.unwrap().unwrap();
    assert!(state.delegation_stack.is_empty());

    let system: Vec<&str> = state
        .history
        .iter()
        .filter(|t| t.role == TurnRole::System)
        .map(|t| t.content.as_str())
        .collect();
    assert_eq!(system.len(), 2);
    assert!(system[0].contains("transferred to skill 'flights'"));
    assert!(system[1].contains("returns to the primary assistant"));

    let skill_turn = state
        .history
        .iter()
        .find(|t| t.content.starts_with("Flight desk"))
        .unwrap();
    assert_eq!(skill_turn.skill.as_ref().map(|s| s.as_str()), Some("flights"));

    let (mut pushes, mut pops) = (0, 0);
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::Delegated { depth, .. } => {
                pushes += 1;
                assert_eq!(depth, 1);
            }
            EngineEvent::Returned { depth, .. } => {
                pops += 1;
                assert_eq!(depth, 0);
            }
            _ => {}
        }
    }
    assert_eq!((pushes, pops), (1, 1));
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_approval_executes_at_most_once() {
    let (engine, _, cancels) = support_engine();

    engine.advance(&sid(), UserTurn::new("cancel")).await.unwrap();
    engine.release(&sid(), Decision::Approve).await.unwrap();
    let len = history_len(&engine).await;

    let again = engine.release(&sid(), Decision::Approve).await.unwrap();
    assert_eq!(again, Outcome::Completed { turns: vec![] });
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
    assert_eq!(history_len(&engine).await, len);
}

#[tokio::test]
async fn replaying_calls_yields_identical_state() {
    async fn run() -> SessionState {
        let (engine, _, _) = support_engine();
        engine.advance(&sid(), UserTurn::new("status?")).await.unwrap();
        engine.advance(&sid(), UserTurn::new("cancel please")).await.unwrap();
        engine.release(&sid(), Decision::deny("changed my mind")).await.unwrap();
        engine.advance(&sid(), UserTurn::new("flight change")).await.unwrap();
        engine.advance(&sid(), UserTurn::new("cancel")).await.unwrap();
        engine.release(&sid(), Decision::Approve).await.unwrap();
        engine.session(&sid()).await.unwrap().unwrap()
    }

    let first = run().await;
    let second = run().await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn history_never_shrinks() {
    let (engine, _, _) = support_engine();
    let mut last = 0;

    let calls: Vec<Result<Outcome, EngineError>> = vec![
        engine.advance(&sid(), UserTurn::new("hello")).await,
        engine.advance(&sid(), UserTurn::new("cancel")).await,
        engine.advance(&sid(), UserTurn::new("ignored while pending")).await,
        engine.release(&sid(), Decision::deny("no")).await,
        engine.release(&sid(), Decision::Approve).await,
        engine.advance(&sid(), UserTurn::new("flight")).await,
    ];

    for (i, call) in calls.into_iter().enumerate() {
        // The third call is rejected; the rest succeed.
        assert_eq!(call.is_err(), i == 2, "call {i}");
    }

    for turn in engine.session(&sid()).await.unwrap().unwrap().history {
        assert!(turn.seq > last);
        last = turn.seq;
    }
    assert_eq!(last as usize, history_len(&engine).await);
}

#[tokio::test]
async fn pop_on_empty_stack_is_a_noop() {
    let graph = Graph::builder("root")
        .step(
            "root",
            step_fn(|_| Ok(PartialUpdate::new().say("done").pop_skill(None))),
        )
        .edge("root", NextStep::End)
        .build()
        .unwrap();
    let engine = Engine::new(
        Arc::new(graph),
        InMemoryCheckpointRepository::new(),
        &EngineConfig::default(),
    );

    let outcome = engine.advance(&sid(), UserTurn::new("hi")).await.unwrap();
    assert_eq!(outcome.turns().len(), 1);

    let state = engine.session(&sid()).await.unwrap().unwrap();
    assert!(state.delegation_stack.is_empty());
    assert!(state.history.iter().all(|t| t.role != TurnRole::System));
}

#[tokio::test]
async fn first_declared_action_route_wins() {
    let graph = Graph::builder("planner")
        .step(
            "planner",
            step_fn(|_| {
                Ok(PartialUpdate::new()
                    .request("refund", json!({}))
                    .request("lookup", json!({"order": "A-12"})))
            }),
        )
        .step("lookup", step_fn(|_| Ok(PartialUpdate::new().say("looked up"))))
        .step("refund", step_fn(|_| Ok(PartialUpdate::new().say("refunded"))))
        .on_action("planner", "lookup", NextStep::step("lookup"))
        .on_action("planner", "refund", NextStep::step("refund"))
        .edge("lookup", NextStep::End)
        .edge("refund", NextStep::End)
        .build()
        .unwrap();
    let engine = Engine::new(
        Arc::new(graph),
        InMemoryCheckpointRepository::new(),
        &EngineConfig::default(),
    );

    let outcome = engine.advance(&sid(), UserTurn::new("go")).await.unwrap();
    let turns = outcome.turns();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].content, "looked up");
}

#[tokio::test]
async fn skill_await_keeps_context_for_next_input() {
    let graph = Graph::builder("root")
        .step("root", step_fn(|_| Ok(PartialUpdate::new().push_skill("survey"))))
        .step(
            "survey",
            step_fn(|s: &SessionState| {
                if s.scratch_get("asked").is_some() {
                    Ok(PartialUpdate::new()
                        .say("Thanks for the feedback.")
                        .pop_skill(Some("survey complete".to_string())))
                } else {
                    Ok(PartialUpdate::new()
                        .say("How did we do?")
                        .set("asked", json!(true)))
                }
            }),
        )
        .step("root_resume", step_fn(|_| Ok(PartialUpdate::new().say("Back at the desk."))))
        .edge("root", NextStep::End)
        .edge("survey", NextStep::Await)
        .edge("root_resume", NextStep::End)
        .skill(SkillDefinition::new("survey", "survey"))
        .resume_root_at("root_resume")
        .build()
        .unwrap();
    let engine = Engine::new(
        Arc::new(graph),
        InMemoryCheckpointRepository::new(),
        &EngineConfig::default(),
    );

    engine.advance(&sid(), UserTurn::new("hi")).await.unwrap();
    let state = engine.session(&sid()).await.unwrap().unwrap();
    assert_eq!(state.active_skill().map(|s| s.as_str()), Some("survey"));

    let outcome = engine.advance(&sid(), UserTurn::new("great")).await.unwrap();
    let contents: Vec<&str> = outcome.turns().iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents.len(), 3);
    assert_eq!(contents[0], "Thanks for the feedback.");
    assert!(contents[1].contains("survey complete"));
    assert_eq!(contents[2], "Back at the desk.");

    let state = engine.session(&sid()).await.unwrap().unwrap();
    assert!(state.delegation_stack.is_empty());
}

#[tokio::test]
async fn advance_while_suspended_is_rejected() {
    let (engine, _, _) = support_engine();
    engine.advance(&sid(), UserTurn::new("cancel")).await.unwrap();
    let len = history_len(&engine).await;

    let err = engine
        .advance(&sid(), UserTurn::new("hello?"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(history_len(&engine).await, len);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handler_error_is_recorded_and_surfaced() {
    let graph = Graph::builder("explode")
        .step("explode", step_fn(|_| Err(HandlerError::failed("lookup service down"))))
        .edge("explode", NextStep::End)
        .build()
        .unwrap();
    let engine = Engine::new(
        Arc::new(graph),
        InMemoryCheckpointRepository::new(),
        &EngineConfig::default(),
    );

    let outcome = engine.advance(&sid(), UserTurn::new("hi")).await.unwrap();
    let Outcome::Failed { error } = outcome else {
        panic!("expected Failed, got {outcome:?}");
    };
    assert_eq!(error.kind, FailureKind::Handler);
    assert_eq!(error.step.as_deref(), Some("explode"));
    assert!(error.message.contains("lookup service down"));

    let state = engine.session(&sid()).await.unwrap().unwrap();
    assert_eq!(state.history.len(), 2);
    let failure = &state.history[1];
    assert_eq!(failure.role, TurnRole::System);
    assert!(failure.content.contains("lookup service down"));
    assert_eq!(state.step_count, 0);
}

#[tokio::test]
async fn unrecognized_action_fails_and_discards_step_output() {
    let graph = Graph::builder("rogue")
        .step(
            "rogue",
            step_fn(|_| {
                Ok(PartialUpdate::new()
                    .say("teleporting now")
                    .set("mode", json!("warp"))
                    .request("teleport", json!({})))
            }),
        )
        .edge("rogue", NextStep::End)
        .build()
        .unwrap();
    let engine = Engine::new(
        Arc::new(graph),
        InMemoryCheckpointRepository::new(),
        &EngineConfig::default(),
    );

    let outcome = engine.advance(&sid(), UserTurn::new("go")).await.unwrap();
    let Outcome::Failed { error } = outcome else {
        panic!("expected Failed, got {outcome:?}");
    };
    assert_eq!(error.kind, FailureKind::Routing);
    assert!(error.message.contains("teleport"));

    let state = engine.session(&sid()).await.unwrap().unwrap();
    assert!(state.history.iter().all(|t| t.content != "teleporting now"));
    assert!(state.scratch_get("mode").is_none());
    assert!(state.requested_actions.is_empty());
}

#[tokio::test]
async fn runaway_loop_hits_step_limit() {
    let graph = Graph::builder("ping")
        .step("ping", step_fn(|_| Ok(PartialUpdate::new())))
        .step("pong", step_fn(|_| Ok(PartialUpdate::new())))
        .edge("ping", NextStep::step("pong"))
        .edge("pong", NextStep::step("ping"))
        .build()
        .unwrap();
    let config = EngineConfig {
        max_steps_per_call: 8,
        ..EngineConfig::default()
    };
    let engine = Engine::new(Arc::new(graph), InMemoryCheckpointRepository::new(), &config);

    let outcome = engine.advance(&sid(), UserTurn::new("go")).await.unwrap();
    let Outcome::Failed { error } = outcome else {
        panic!("expected Failed, got {outcome:?}");
    };
    assert_eq!(error.kind, FailureKind::StepLimit);

    let state = engine.session(&sid()).await.unwrap().unwrap();
    assert_eq!(state.step_count, 8);
}

#[tokio::test]
async fn persistence_failure_keeps_last_committed_state() {
    let (engine, repo, _) = support_engine();
    engine.advance(&sid(), UserTurn::new("hello")).await.unwrap();
    let before = engine.session(&sid()).await.unwrap().unwrap();

    repo.fail_saves.store(true, Ordering::SeqCst);
    let err = engine
        .advance(&sid(), UserTurn::new("status"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Persistence(CheckpointError::Repository(_))
    ));
    assert_eq!(engine.session(&sid()).await.unwrap().unwrap(), before);

    // The caller retries once the store is back.
    repo.fail_saves.store(false, Ordering::SeqCst);
    engine.advance(&sid(), UserTurn::new("status")).await.unwrap();
    assert_eq!(history_len(&engine).await, before.history.len() + 2);
}

#[tokio::test]
async fn gated_config_adds_gates() {
    let cancels = Arc::new(AtomicUsize::new(0));
    let config = EngineConfig {
        gated_steps: vec!["flights".to_string()],
        ..EngineConfig::default()
    };
    let engine = Engine::new(
        Arc::new(support_graph(cancels)),
        InMemoryCheckpointRepository::new(),
        &config,
    );
    assert!(engine.interrupts().is_gated("cancel"));
    assert!(engine.interrupts().is_gated("flights"));

    let outcome = engine.advance(&sid(), UserTurn::new("flight")).await.unwrap();
    assert!(matches!(outcome, Outcome::Suspended { ref gated_step, .. } if gated_step == "flights"));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

/// Waits before replying, so a second call can arrive mid-flight.
struct Slow;

impl StepHandler for Slow {
    async fn run(&self, _state: &SessionState) -> Result<PartialUpdate, HandlerError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(PartialUpdate::new().say("slow reply"))
    }
}

#[tokio::test]
async fn concurrent_calls_for_one_session_do_not_interleave() {
    let graph = Graph::builder("slow")
        .step("slow", Slow)
        .edge("slow", NextStep::End)
        .build()
        .unwrap();
    let engine = Engine::new(
        Arc::new(graph),
        InMemoryCheckpointRepository::new(),
        &EngineConfig::default(),
    );

    let other = SessionId::new("session-2");
    let (s1, s2) = (sid(), sid());
    let (a, b, c) = tokio::join!(
        engine.advance(&s1, UserTurn::new("one")),
        engine.advance(&s2, UserTurn::new("two")),
        engine.advance(&other, UserTurn::new("three")),
    );

    assert!(a.is_ok());
    let err = b.unwrap_err();
    assert!(matches!(err, EngineError::SessionBusy(_)));
    assert!(err.is_conflict());
    assert!(c.is_ok(), "other sessions are unaffected");
    assert_eq!(history_len_of(&engine, &sid()).await, 2);
}

async fn history_len_of(engine: &Engine<InMemoryCheckpointRepository>, id: &SessionId) -> usize {
    engine
        .session(id)
        .await
        .unwrap()
        .map(|s| s.history.len())
        .unwrap_or(0)
}

/// Writes a competing checkpoint mid-step, as another process would.
struct Intruder(TestRepo);

impl StepHandler for Intruder {
    async fn run(&self, state: &SessionState) -> Result<PartialUpdate, HandlerError> {
        let current = self
            .0
            .load_latest(&state.session_id)
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))?
            .map(|cp| cp.version)
            .unwrap_or(0);
        let rival = Checkpoint::next(state.clone(), current, None);
        self.0
            .save(&rival)
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))?;
        Ok(PartialUpdate::new().say("too late"))
    }
}

#[tokio::test]
async fn stale_writer_is_rejected_by_version_check() {
    let repo = TestRepo::default();
    let graph = Graph::builder("intrude")
        .step("intrude", Intruder(repo.clone()))
        .edge("intrude", NextStep::End)
        .build()
        .unwrap();
    let engine = Engine::new(Arc::new(graph), repo.clone(), &EngineConfig::default());

    let err = engine.advance(&sid(), UserTurn::new("hi")).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Persistence(CheckpointError::Conflict { expected: 0, actual: 1, .. })
    ));
    assert!(err.is_conflict());

    // Only the rival's checkpoint landed.
    assert_eq!(repo.inner.version_count(&sid()), 1);
    let stored = repo.inner.load_latest(&sid()).await.unwrap().unwrap();
    assert!(stored.state.history.iter().all(|t| t.content != "too late"));
}
