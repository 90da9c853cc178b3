//! Application state wiring the engine to its storage.
//!
//! `Engine` is generic over the checkpoint repository; AppState pins it to
//! the SQLite implementation in the data directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use switchyard_core::engine::Engine;
use switchyard_infra::config::{load_engine_config, resolve_data_dir};
use switchyard_infra::sqlite::{DatabasePool, SqliteCheckpointRepository};

use crate::demo;

/// Concrete engine type used by the CLI.
pub type ConcreteEngine = Engine<SqliteCheckpointRepository>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Load config, open the checkpoint database, and build the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        let config = load_engine_config(&data_dir).await;

        let db_pool = DatabasePool::open(&data_dir, &config.database_file)
            .await
            .with_context(|| format!("failed to open checkpoint database in {}", data_dir.display()))?;

        let graph = demo::build_graph().context("demo graph is invalid")?;
        let engine = Engine::new(
            Arc::new(graph),
            SqliteCheckpointRepository::new(db_pool),
            &config,
        );

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");

        Ok(Self {
            engine: Arc::new(engine),
            data_dir,
        })
    }
}
