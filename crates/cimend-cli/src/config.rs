//! `cimend.toml` loading and validation.
//!
//! Secrets never live in the file: it names the environment variables
//! holding them (`github.token_env`, `providers[].api_key_env`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use cimend_core::CoordinatorConfig;
use cimend_http::{ChatConfig, GitHubConfig};
use cimend_local::LocalSandboxConfig;
use serde::{Deserialize, Serialize};

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "cimend.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub interval_secs: u64,
    /// Most recent failed runs examined per repository and poll.
    pub lookback: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            lookback: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub coordinator: CoordinatorConfig,
    pub github: GitHubConfig,
    /// Model backends in priority order.
    pub providers: Vec<ChatConfig>,
    pub sandbox: LocalSandboxConfig,
    pub watch: WatchConfig,
}

impl CliConfig {
    /// Load `path`, or `./cimend.toml` if present, or the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path: Option<PathBuf> = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.is_file()),
        };
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Checks needed before remediating runs.
    pub fn validate(&self) -> Result<()> {
        self.coordinator
            .validate()
            .context("Invalid [coordinator] section")?;
        if self.providers.is_empty() {
            bail!("at least one [[providers]] entry is required");
        }
        let mut names = HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                bail!("duplicate provider name '{}'", provider.name);
            }
        }
        if self.sandbox.checkouts.is_empty() {
            bail!("[sandbox.checkouts] must map at least one owner/name to a local checkout");
        }
        if self.watch.interval_secs == 0 {
            bail!("watch.interval_secs must be greater than zero");
        }
        Ok(())
    }
}
