//! Session subcommands: advance, approve/deny, show, history, sessions.

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use switchyard_core::engine::SessionEngine;
use switchyard_types::outcome::{Decision, Outcome, UserTurn};
use switchyard_types::session::{SessionId, Turn, TurnRole};

use crate::state::AppState;

/// Longest turn text shown in a table cell.
const CELL_WIDTH: usize = 72;

// ---------------------------------------------------------------------------
// Advance / release
// ---------------------------------------------------------------------------

pub async fn handle_advance(state: &AppState, session: &str, message: &str, json: bool) -> Result<()> {
    let session_id = SessionId::new(session);
    let outcome = state
        .engine
        .advance(&session_id, UserTurn::new(message))
        .await
        .with_context(|| format!("Failed to advance session '{session}'"))?;

    print_outcome(&session_id, &outcome, json)
}

pub async fn handle_release(
    state: &AppState,
    session: &str,
    decision: Decision,
    json: bool,
) -> Result<()> {
    let session_id = SessionId::new(session);
    let outcome = state
        .engine
        .release(&session_id, decision)
        .await
        .with_context(|| format!("Failed to release session '{session}'"))?;

    print_outcome(&session_id, &outcome, json)
}

fn print_outcome(session_id: &SessionId, outcome: &Outcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    println!();
    match outcome {
        Outcome::Completed { turns } => {
            if turns.is_empty() {
                println!("  {}", style("Nothing to do.").dim());
            }
            for turn in turns {
                print_turn(turn);
            }
        }
        Outcome::Suspended {
            gated_step,
            proposed_action,
        } => {
            println!(
                "  {} Waiting for approval to run '{}'",
                style("||").yellow().bold(),
                style(gated_step).cyan()
            );
            if let Some(origin) = &proposed_action.proposed_by {
                println!("  Proposed by: {origin}");
            }
            if let Some(action) = &proposed_action.action {
                println!("  Action: {} {}", style(&action.kind).bold(), action.payload);
            }
            println!();
            println!(
                "  Approve with {} or deny with {}",
                style(format!("syard approve {session_id}")).dim(),
                style(format!("syard deny {session_id} \"<reason>\"")).dim()
            );
        }
        Outcome::Failed { error } => {
            println!(
                "  {} {}",
                style("x").red().bold(),
                style(&error.message).red()
            );
            if let Some(step) = &error.step {
                println!("  Step: {step} ({:?})", error.kind);
            }
        }
    }
    println!();

    Ok(())
}

fn print_turn(turn: &Turn) {
    let label = match turn.role {
        TurnRole::User => style("you").bold(),
        TurnRole::Assistant => style("assistant").green().bold(),
        TurnRole::System => style("system").dim(),
        TurnRole::Tool => style("tool").yellow(),
    };
    let content = match turn.role {
        TurnRole::System => style(turn.content.as_str()).dim().to_string(),
        _ => turn.content.clone(),
    };
    println!("  {label}: {content}");
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

pub async fn handle_show(state: &AppState, session: &str, recent: usize, json: bool) -> Result<()> {
    let session_id = SessionId::new(session);
    let Some(checkpoint) = state
        .engine
        .checkpoints()
        .load(&session_id)
        .await
        .context("Failed to load session")?
    else {
        bail!("Session '{session}' not found");
    };
    let current = &checkpoint.state;

    if json {
        println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        return Ok(());
    }

    let stack: Vec<&str> = current.delegation_stack.iter().map(|s| s.as_str()).collect();

    println!();
    println!(
        "  {} Session '{}' (version {})",
        style("*").green().bold(),
        style(session).cyan(),
        checkpoint.version
    );
    println!("  Turns:       {}", current.history.len());
    println!("  Steps run:   {}", current.step_count);
    println!(
        "  Context:     {}",
        if stack.is_empty() {
            "root".to_string()
        } else {
            format!("root > {}", stack.join(" > "))
        }
    );
    match &current.pending_step {
        Some(pending) => println!(
            "  Pending:     {} {}",
            style(&pending.step).yellow().bold(),
            style("(awaiting approval)").dim()
        ),
        None => println!("  Pending:     -"),
    }
    if !current.scratch.is_empty() {
        let keys: Vec<&str> = current.scratch.keys().map(String::as_str).collect();
        println!("  Scratch:     {}", keys.join(", "));
    }
    println!(
        "  Updated:     {}",
        checkpoint.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    if current.history.is_empty() {
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Role"),
            Cell::new("Step"),
            Cell::new("Skill"),
            Cell::new("Content"),
        ]);

    let skip = current.history.len().saturating_sub(recent);
    for turn in current.history.iter().skip(skip) {
        table.add_row(vec![
            Cell::new(turn.seq),
            Cell::new(format!("{:?}", turn.role).to_lowercase()),
            Cell::new(turn.step.as_deref().unwrap_or("-")),
            Cell::new(turn.skill.as_ref().map(|s| s.as_str()).unwrap_or("-")),
            Cell::new(truncate(&turn.content, CELL_WIDTH)),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

pub async fn handle_history(state: &AppState, session: &str, limit: u32, json: bool) -> Result<()> {
    let session_id = SessionId::new(session);
    let versions = state
        .engine
        .checkpoints()
        .history(&session_id, limit)
        .await
        .context("Failed to list checkpoints")?;

    if json {
        let out: Vec<_> = versions
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id.to_string(),
                    "version": c.version,
                    "next_step": c.next_step,
                    "turns": c.state.history.len(),
                    "pending_step": c.state.pending_step.as_ref().map(|p| &p.step),
                    "created_at": c.created_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if versions.is_empty() {
        println!();
        println!("  No checkpoints for session '{session}'.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Version").fg(Color::Cyan),
            Cell::new("Next step"),
            Cell::new("Turns"),
            Cell::new("Pending"),
            Cell::new("Created"),
        ]);

    for c in &versions {
        let pending = match &c.state.pending_step {
            Some(p) => Cell::new(&p.step).fg(Color::Yellow),
            None => Cell::new("-"),
        };
        table.add_row(vec![
            Cell::new(c.version),
            Cell::new(c.next_step.as_deref().unwrap_or("-")),
            Cell::new(c.state.history.len()),
            pending,
            Cell::new(c.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

pub async fn handle_sessions(state: &AppState, json: bool) -> Result<()> {
    let sessions = state
        .engine
        .checkpoints()
        .sessions()
        .await
        .context("Failed to list sessions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!();
        println!("  No sessions yet.");
        println!(
            "  Start one with: {}",
            style("syard advance <session> \"<message>\"").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Session").fg(Color::Cyan),
            Cell::new("Version"),
            Cell::new("Turns"),
            Cell::new("Skill"),
            Cell::new("Pending"),
            Cell::new("Updated"),
        ]);

    for s in &sessions {
        let pending = match &s.pending_step {
            Some(step) => Cell::new(step).fg(Color::Yellow),
            None => Cell::new("-"),
        };
        table.add_row(vec![
            Cell::new(s.session_id.as_str()),
            Cell::new(s.version),
            Cell::new(s.turns),
            Cell::new(s.active_skill.as_deref().unwrap_or("-")),
            pending,
            Cell::new(s.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!(
        "  {}",
        style(format!("Data directory: {}", state.data_dir.display())).dim()
    );
    println!();

    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}
