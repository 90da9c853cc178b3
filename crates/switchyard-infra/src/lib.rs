//! Infrastructure layer for Switchyard.
//!
//! Contains implementations of the repository traits defined in
//! `switchyard-core` (SQLite checkpoint storage) and the config/data
//! directory loaders used by the CLI.

pub mod config;
pub mod sqlite;
