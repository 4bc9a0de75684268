//! JSON state file for instances and their event logs

use crate::models::{DeploymentEvent, ServiceInstance};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub instance: ServiceInstance,
    pub events: Vec<DeploymentEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub records: Vec<PersistedRecord>,
}

impl PersistedState {
    pub fn new(records: Vec<PersistedRecord>) -> Self {
        Self {
            version: STATE_VERSION,
            records,
        }
    }
}

/// State file written atomically through a temp file
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let json = serde_json::to_vec_pretty(state).context("Failed to serialize state")?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
        file.write_all(&json).context("Failed to write state")?;
        file.sync_all().context("Failed to sync state file")?;

        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, self.path))?;

        debug!(path = %self.path.display(), records = state.records.len(), "State flushed to disk");
        Ok(())
    }

    /// Load the state file; a missing file is an empty state
    pub fn load(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            return Ok(PersistedState::new(Vec::new()));
        }

        let mut file = File::open(&self.path)
            .with_context(|| format!("Failed to open state file {:?}", self.path))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .context("Failed to read state file")?;

        let state: PersistedState =
            serde_json::from_slice(&data).context("Failed to deserialize state file")?;
        if state.version != STATE_VERSION {
            anyhow::bail!(
                "Unsupported state file version {} (expected {})",
                state.version,
                STATE_VERSION
            );
        }

        info!(path = %self.path.display(), records = state.records.len(), "Loaded state from disk");
        Ok(state)
    }
}
