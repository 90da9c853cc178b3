//! Shared domain types for Switchyard.
//!
//! This crate contains the data model of the workflow engine: session state,
//! turns, checkpoints, outcomes, events, configuration, and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod outcome;
pub mod session;
