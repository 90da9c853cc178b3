//! Built-in support-desk graph driven by `syard`.
//!
//! Routing is keyword based so the engine can be exercised end to end
//! without a language model:
//!
//! - "status" / "where" -> `lookup_order`
//! - "cancel" -> `cancel_order` (gated)
//! - "refund" -> delegate to the `refunds` skill, whose `issue_refund` step
//!   is gated as well
//!
//! Order references are words starting with `#` (default `#1001`).

use serde_json::{Value, json};
use switchyard_core::graph::registry::{HandlerError, PartialUpdate, step_fn};
use switchyard_core::graph::routing::NextStep;
use switchyard_core::graph::{Graph, GraphError, SkillDefinition};
use switchyard_types::session::{SessionState, Turn, TurnRole};

pub const ASSISTANT: &str = "assistant";
pub const LOOKUP_ORDER: &str = "lookup_order";
pub const CANCEL_ORDER: &str = "cancel_order";
pub const REFUND_INTAKE: &str = "refund_intake";
pub const ISSUE_REFUND: &str = "issue_refund";
pub const REFUNDS: &str = "refunds";

const DEFAULT_ORDER: &str = "#1001";

pub fn build_graph() -> Result<Graph, GraphError> {
    Graph::builder(ASSISTANT)
        .step(ASSISTANT, step_fn(assistant))
        .step(LOOKUP_ORDER, step_fn(lookup_order))
        .step(CANCEL_ORDER, step_fn(cancel_order))
        .step(REFUND_INTAKE, step_fn(refund_intake))
        .step(ISSUE_REFUND, step_fn(issue_refund))
        .on_action(ASSISTANT, "lookup", NextStep::step(LOOKUP_ORDER))
        .on_action(ASSISTANT, "cancel", NextStep::step(CANCEL_ORDER))
        .edge(ASSISTANT, NextStep::End)
        .edge(LOOKUP_ORDER, NextStep::End)
        .edge(CANCEL_ORDER, NextStep::End)
        .on_action(REFUND_INTAKE, "refund", NextStep::step(ISSUE_REFUND))
        .edge(REFUND_INTAKE, NextStep::Await)
        .edge(ISSUE_REFUND, NextStep::End)
        .gate(CANCEL_ORDER)
        .gate(ISSUE_REFUND)
        .skill(
            SkillDefinition::new(REFUNDS, REFUND_INTAKE)
                .describe("Collects the refund amount and issues the refund."),
        )
        .resume_root_at(ASSISTANT)
        .build()
}

/// First `#`-prefixed word in `text`.
fn order_ref(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '#'))
        .find(|w| w.len() > 1 && w.starts_with('#'))
        .map(str::to_string)
}

fn current_order(state: &SessionState, text: &str) -> String {
    order_ref(text)
        .or_else(|| {
            state
                .scratch_get("order")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| DEFAULT_ORDER.to_string())
}

fn action_order(state: &SessionState) -> Result<String, HandlerError> {
    state
        .active_action
        .as_ref()
        .and_then(|a| a.payload.get("order"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| HandlerError::MissingField("order".to_string()))
}

fn last_turn(state: &SessionState) -> Result<&Turn, HandlerError> {
    state
        .history
        .last()
        .ok_or_else(|| HandlerError::failed("no turns to respond to"))
}

fn denial_reason(turn: &Turn) -> Option<&str> {
    turn.data
        .as_ref()
        .and_then(|d| d.get("reason"))
        .and_then(Value::as_str)
}

fn assistant(state: &SessionState) -> Result<PartialUpdate, HandlerError> {
    let last = last_turn(state)?;

    match last.role {
        TurnRole::Tool => {
            let reason = denial_reason(last).unwrap_or("no reason given");
            return Ok(PartialUpdate::new().say(format!(
                "Okay, I won't do that ({reason}). Tell me what you would like instead."
            )));
        }
        TurnRole::System => {
            return Ok(PartialUpdate::new().say("Is there anything else I can help with?"));
        }
        _ => {}
    }

    let text = last.content.to_lowercase();
    let order = current_order(state, &text);
    let update = PartialUpdate::new().set("order", json!(order));

    if text.contains("refund") {
        return Ok(update.push_skill(REFUNDS));
    }
    if text.contains("cancel") {
        return Ok(update
            .say(format!("I can cancel order {order}. This needs your approval."))
            .request("cancel", json!({ "order": order })));
    }
    if text.contains("status") || text.contains("where") {
        return Ok(update.request("lookup", json!({ "order": order })));
    }

    Ok(update.say(
        "I can check an order's status, cancel an order, or start a refund. Mention an order like #1001.",
    ))
}

fn lookup_order(state: &SessionState) -> Result<PartialUpdate, HandlerError> {
    let order = action_order(state)?;
    Ok(PartialUpdate::new()
        .say(format!("Order {order} shipped yesterday and should arrive on Friday."))
        .set("last_lookup", json!(order)))
}

fn cancel_order(state: &SessionState) -> Result<PartialUpdate, HandlerError> {
    let order = action_order(state)?;
    Ok(PartialUpdate::new()
        .say(format!("Order {order} has been cancelled."))
        .set("cancelled", json!(order)))
}

/// First number in `text`, accepting a leading `$`.
fn amount(text: &str) -> Option<f64> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_ascii_digit() && c != '.'))
        .find_map(|w| w.parse::<f64>().ok())
}

fn refund_intake(state: &SessionState) -> Result<PartialUpdate, HandlerError> {
    let last = last_turn(state)?;

    if last.role == TurnRole::Tool {
        let reason = denial_reason(last).unwrap_or("no reason given");
        return Ok(PartialUpdate::new()
            .say(format!("Refund not issued ({reason})."))
            .pop_skill(Some("refund denied".to_string())));
    }

    let text = last.content.to_lowercase();
    if text.contains("never mind") || text.contains("stop") {
        return Ok(PartialUpdate::new()
            .say("No problem, I've dropped the refund.")
            .pop_skill(Some("refund abandoned".to_string())));
    }

    let order = current_order(state, &text);
    match amount(&text).filter(|a| *a > 0.0) {
        Some(value) if last.role == TurnRole::User => Ok(PartialUpdate::new()
            .say(format!("I'll refund ${value:.2} for order {order} once approved."))
            .request("refund", json!({ "order": order, "amount": value }))),
        _ => Ok(PartialUpdate::new().say(format!("How much should be refunded for order {order}?"))),
    }
}

fn issue_refund(state: &SessionState) -> Result<PartialUpdate, HandlerError> {
    let order = action_order(state)?;
    let value = state
        .active_action
        .as_ref()
        .and_then(|a| a.payload.get("amount"))
        .and_then(Value::as_f64)
        .ok_or_else(|| HandlerError::MissingField("amount".to_string()))?;

    Ok(PartialUpdate::new()
        .say(format!("Refunded ${value:.2} for order {order}."))
        .set("refunded", json!({ "order": order, "amount": value })))
}
