//! Engine logic and repository trait definitions for Switchyard.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements. It depends only on `switchyard-types` -- never on
//! `switchyard-infra` or any database/IO crate.

pub mod engine;
pub mod event;
pub mod graph;
pub mod repository;
