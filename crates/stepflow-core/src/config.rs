//! Engine configuration.
//!
//! Loaded from a YAML file (all fields optional):
//!
//! ```yaml
//! workers: 4
//! poll_interval_ms: 1000
//! max_idle_backoff_ms: 5000
//! job_timeout_secs: 3600
//! max_nesting_depth: 4
//! sandbox:
//!   timeout_ms: 30000
//!   fuel: 10000000000
//!   max_memory_bytes: 268435456
//!   max_buffer_bytes: 10485760
//!   http_timeout_secs: 30
//!   url_allow_list: ["https://", "http://"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent poll/claim/execute loops.
    pub workers: usize,
    pub poll_interval_ms: u64,
    /// Upper bound for the idle backoff between empty polls.
    pub max_idle_backoff_ms: u64,
    /// Default job deadline; the `timeout_job_seconds` setting overrides it.
    pub job_timeout_secs: u64,
    /// Maximum depth of synchronous workflow triggers issued from modules.
    pub max_nesting_depth: u32,
    pub sandbox: SandboxConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 1000,
            max_idle_backoff_ms: 5000,
            job_timeout_secs: 3600,
            max_nesting_depth: 4,
            sandbox: SandboxConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock limit for one module invocation.
    pub timeout_ms: u64,
    /// Instruction budget for one module invocation.
    pub fuel: u64,
    pub max_memory_bytes: usize,
    /// Cap on any buffered result handed to a guest, and on captured stdout/stderr.
    pub max_buffer_bytes: usize,
    pub http_timeout_secs: u64,
    /// URL prefixes guests may reach. Schemes other than http/https are always refused.
    pub url_allow_list: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            fuel: 10_000_000_000,
            max_memory_bytes: 256 * 1024 * 1024,
            max_buffer_bytes: 10 * 1024 * 1024,
            http_timeout_secs: 30,
            url_allow_list: vec!["https://".to_string(), "http://".to_string()],
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse config YAML: {}", e))
    }

    /// Load a configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path, e))?;
        Self::from_yaml(&content)
    }

    /// Load `path` if given, else the per-user config file if it exists,
    /// else the defaults.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match default_config_path() {
            Some(found) if found.is_file() => {
                tracing::debug!("Using config file {}", found.display());
                Self::from_file(&found.to_string_lossy())
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_idle_backoff(&self) -> Duration {
        Duration::from_millis(self.max_idle_backoff_ms.max(self.poll_interval_ms).max(1))
    }
}

/// `<config dir>/stepflow/config.yaml`, e.g. `~/.config/stepflow/config.yaml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("stepflow").join("config.yaml"))
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
