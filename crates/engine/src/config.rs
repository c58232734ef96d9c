//! qaflow configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Top-level configuration shared by the daemon and the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QaflowConfig {
    /// Store directory path (database and artifacts)
    pub store_path: PathBuf,

    /// Run engine policy
    pub engine: EngineSettings,

    /// Browser session configuration
    pub browser: BrowserSettings,

    /// HTTP API configuration
    pub server: ServerSettings,
}

impl Default for QaflowConfig {
    fn default() -> Self {
        Self {
            store_path: qaflow_common::default_store_path(),
            engine: EngineSettings::default(),
            browser: BrowserSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Per-step execution timeout in seconds
    pub step_timeout_secs: u64,

    /// Keep executing after a failed step
    pub continue_on_failure: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            step_timeout_secs: 5,
            continue_on_failure: false,
        }
    }
}

impl EngineSettings {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Base URL that `Go to` paths are resolved against
    pub base_url: String,

    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,

    /// Node.js binary used to host the Playwright bridge
    pub node_binary: String,

    /// Override for the Playwright browser cache directory
    pub browsers_path: Option<PathBuf>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            node_binary: "node".to_string(),
            browsers_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// HTTP listen address
    pub listen: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7420".to_string(),
        }
    }
}

impl QaflowConfig {
    /// Load configuration from file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> EngineResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self =
                toml::from_str(&content).map_err(|e| EngineError::Config(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> EngineResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Get the artifact root
    pub fn artifacts_path(&self) -> PathBuf {
        self.store_path.join("artifacts")
    }
}
