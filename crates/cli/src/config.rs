//! Configuration management for the CLI

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::output::OutputFormat;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";

/// CLI configuration stored in `~/.config/fas/config.json`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// API endpoint URL
    pub api_url: Option<String>,
    /// Team used when `--team` is not given
    pub team: Option<String>,
    /// Default output format ("table" or "json")
    pub default_format: Option<String>,
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).context("Failed to read config file")?;

        serde_json::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs_next::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".config").join("fas").join("config.json"))
    }

    pub fn format(&self) -> Option<OutputFormat> {
        use clap::ValueEnum;
        self.default_format
            .as_deref()
            .and_then(|f| OutputFormat::from_str(f, true).ok())
    }
}

/// Effective settings after flags, environment and the config file
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub api_url: String,
    pub team: Option<String>,
    pub format: OutputFormat,
}

impl Settings {
    /// Flags (and their env vars) win over the config file
    pub fn resolve(
        api_url: Option<String>,
        team: Option<String>,
        format: Option<OutputFormat>,
        config: &Config,
    ) -> Self {
        Self {
            api_url: api_url
                .or_else(|| config.api_url.clone())
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            team: team.or_else(|| config.team.clone()),
            format: format.or_else(|| config.format()).unwrap_or_default(),
        }
    }

    pub fn team(&self) -> Result<&str> {
        self.team
            .as_deref()
            .context("No team set; pass --team, set FAS_TEAM or run `fas config set --team`")
    }
}
