//! Engine configuration types for Switchyard.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls which
//! steps are gated behind approval, loop limits, and storage settings.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Switchyard engine.
///
/// Loaded from `~/.switchyard/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Step names that require external approval before they run.
    /// Merged with the gates declared on the graph itself.
    #[serde(default)]
    pub gated_steps: Vec<String>,

    /// Maximum number of steps one `advance`/`release` call may execute.
    #[serde(default = "default_max_steps_per_call")]
    pub max_steps_per_call: u32,

    /// Capacity of the engine event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// SQLite database file name, relative to the data directory.
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Number of checkpoint versions retained per session (0 = keep all).
    #[serde(default = "default_checkpoint_retention")]
    pub checkpoint_retention: u32,
}

fn default_max_steps_per_call() -> u32 {
    64
}

fn default_event_capacity() -> usize {
    1024
}

fn default_database_file() -> String {
    "switchyard.db".to_string()
}

fn default_checkpoint_retention() -> u32 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gated_steps: Vec::new(),
            max_steps_per_call: default_max_steps_per_call(),
            event_capacity: default_event_capacity(),
            database_file: default_database_file(),
            checkpoint_retention: default_checkpoint_retention(),
        }
    }
}
