//! Session execution engine.
//!
//! - `checkpoint` -- versioned snapshots over a `CheckpointRepository`
//! - `executor` -- the `Engine` that runs `advance`/`release` calls

pub mod checkpoint;
pub mod executor;

pub use checkpoint::{CheckpointError, CheckpointManager};
pub use executor::{Engine, EngineError, SessionEngine};
