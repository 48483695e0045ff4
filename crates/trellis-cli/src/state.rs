//! Application state wiring the engine to its configured store.

use std::path::PathBuf;

use anyhow::Context;
use trellis_core::capability::BoxTextGenerator;
use trellis_core::workflow::Engine;
use trellis_infra::config::load_engine_config;
use trellis_infra::filesystem::resolve_data_dir;
use trellis_infra::store::{AnyRunStore, open_run_store};

use crate::demos::{self, TemplateGenerator};

pub type ConcreteEngine = Engine<AnyRunStore>;

/// Shared state for every command.
pub struct AppState {
    pub engine: ConcreteEngine,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Load configuration, open the run store and register the demo workflows.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        let config = load_engine_config(&data_dir).await;

        let store = open_run_store(&config.store, &data_dir)
            .await
            .with_context(|| format!("failed to open run store under {}", data_dir.display()))?;
        tracing::info!(backend = ?store.backend(), data_dir = %data_dir.display(), "run store ready");

        let engine = Engine::new(store, config);
        demos::register_all(&engine, BoxTextGenerator::new(TemplateGenerator))
            .context("failed to build demo workflows")?;

        Ok(Self { engine, data_dir })
    }
}
