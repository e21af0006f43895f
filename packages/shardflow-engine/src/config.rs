//! Run configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{EngineError, Result};
use crate::resources::{default_capacity, Resources};

/// Engine configuration: worker capacity plus the on-disk layout of a run.
/// Loadable from TOML; everything except the paths has a host-derived
/// default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_capacity")]
    pub capacity: Resources,
    /// Artifact store root
    pub store_dir: PathBuf,
    /// Run state database
    pub state_path: PathBuf,
    /// Parent of per-attempt scoped working directories
    pub scratch_root: PathBuf,
}

impl EngineConfig {
    /// Standard layout under one run directory.
    pub fn rooted_at(run_root: impl Into<PathBuf>) -> Self {
        let root = run_root.into();
        Self {
            capacity: default_capacity(),
            store_dir: root.join("store"),
            state_path: root.join("state.db"),
            scratch_root: root.join("scratch"),
        }
    }

    pub fn capacity(mut self, capacity: Resources) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(EngineError::config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }
}

/// How to start a run: fresh, or from persisted run state; and whether
/// teardown keeps the artifact store.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub resume: bool,
    pub keep_store: bool,
}

impl RunOptions {
    pub fn resume() -> Self {
        Self {
            resume: true,
            ..Self::default()
        }
    }

    pub fn keep_store(mut self) -> Self {
        self.keep_store = true;
        self
    }
}

/// Install the global tracing subscriber, honoring `RUST_LOG`. Safe to call
/// more than once (later calls are no-ops).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();
}
