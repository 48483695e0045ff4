//! Engine configuration types for Trellis.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls
//! scheduling limits, default deadlines, and the run store backend.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.trellis/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum steps of one run executing at once (None = unbounded).
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Deadline applied to steps that do not declare their own.
    #[serde(default)]
    pub default_step_timeout_secs: Option<u64>,

    /// Deadline for a whole run (start or resume call).
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Capacity of the broadcast channel carrying run events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Upper bound on `until`/`while` iterations for a single loop step.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_run_timeout_secs() -> u64 {
    1800
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_loop_iterations() -> u32 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            default_step_timeout_secs: None,
            run_timeout_secs: default_run_timeout_secs(),
            event_capacity: default_event_capacity(),
            max_loop_iterations: default_max_loop_iterations(),
            store: StoreConfig::default(),
        }
    }
}

/// Which run store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    File,
    Memory,
}

/// Run store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// SQLite URL; defaults to `sqlite://{data_dir}/trellis.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    /// Directory for the file backend; defaults to `{data_dir}/runs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runs_dir: Option<String>,
}
