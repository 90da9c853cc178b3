//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (switchyard-infra) implements. The core crate never depends on any
//! specific storage technology; `memory` is a process-local implementation
//! for tests and ephemeral runs.

pub mod checkpoint;
pub mod memory;
