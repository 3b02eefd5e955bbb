//! Settings and configuration module
//!
//! Provides unified engine configuration with:
//! - Builder pattern
//! - JSON loading
//! - Environment overrides

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::browser::BypassTimeouts;
use crate::transport::{HeaderEntry, RetryPolicy};

pub const ENV_PYTHON: &str = "ROMSOURCE_PYTHON";
pub const ENV_JAVA: &str = "ROMSOURCE_JAVA";
pub const ENV_MAX_RETRIES: &str = "ROMSOURCE_MAX_RETRIES";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value '{value}' for {name}")]
    InvalidEnv { name: &'static str, value: String },
}

/// External runtimes used by `java` and `python` sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    pub python: String,
    pub java: String,
    /// Bound on a single adapter call, including capability round trips.
    pub call_timeout_seconds: u64,
    /// Bound on creating a private environment and installing dependencies.
    pub setup_timeout_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            java: "java".to_string(),
            call_timeout_seconds: 60,
            setup_timeout_seconds: 600,
        }
    }
}

impl RuntimeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_seconds)
    }
}

/// Where the connectivity stage probes. Without a target the host reports
/// connectivity itself through `StaticConnectivity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectivityConfig {
    pub probe_target: Option<String>,
    pub probe_timeout_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_target: None,
            probe_timeout_ms: 3_000,
        }
    }
}

impl ConnectivityConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Compared against a manifest's `minAppVersion` at install time.
    pub app_version: String,
    /// Identifying headers added to every request that lacks them.
    pub default_headers: Vec<HeaderEntry>,
    pub retry: RetryPolicy,
    pub default_timeout_seconds: u64,
    pub bypass: BypassTimeouts,
    pub runtime: RuntimeConfig,
    pub connectivity: ConnectivityConfig,
    /// Installed sources live in `<sources_dir>/<id>`.
    pub sources_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_version: crate::VERSION.to_string(),
            default_headers: vec![
                HeaderEntry::new("User-Agent", format!("romsource/{}", crate::VERSION)),
                HeaderEntry::new("Accept", "application/json, text/html;q=0.9, */*;q=0.8"),
            ],
            retry: RetryPolicy::default(),
            default_timeout_seconds: 30,
            bypass: BypassTimeouts::default(),
            runtime: RuntimeConfig::default(),
            connectivity: ConnectivityConfig::default(),
            sources_dir: PathBuf::from("sources"),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }

    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `ROMSOURCE_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(python) = lookup(ENV_PYTHON).filter(|value| !value.trim().is_empty()) {
            self.runtime.python = python;
        }
        if let Some(java) = lookup(ENV_JAVA).filter(|value| !value.trim().is_empty()) {
            self.runtime.java = java;
        }
        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            self.retry.max_retries =
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnv {
                        name: ENV_MAX_RETRIES,
                        value: raw.clone(),
                    })?;
        }
        Ok(self)
    }
}

/// Fluent builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.config.app_version = version.into();
        self
    }

    /// Add or replace a default header. Names compare case-insensitively.
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let entry = HeaderEntry::new(name, value);
        self.config
            .default_headers
            .retain(|existing| !existing.name.eq_ignore_ascii_case(&entry.name));
        self.config.default_headers.push(entry);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout_seconds = timeout.as_secs().max(1);
        self
    }

    pub fn with_bypass_timeouts(mut self, timeouts: BypassTimeouts) -> Self {
        self.config.bypass = timeouts;
        self
    }

    pub fn with_python(mut self, executable: impl Into<String>) -> Self {
        self.config.runtime.python = executable.into();
        self
    }

    pub fn with_java(mut self, executable: impl Into<String>) -> Self {
        self.config.runtime.java = executable.into();
        self
    }

    pub fn with_runtime_timeout(mut self, timeout: Duration) -> Self {
        self.config.runtime.call_timeout_seconds = timeout.as_secs().max(1);
        self
    }

    pub fn with_probe_target(mut self, target: impl Into<String>) -> Self {
        self.config.connectivity.probe_target = Some(target.into());
        self
    }

    pub fn with_sources_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.sources_dir = dir.into();
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}
