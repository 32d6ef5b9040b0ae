//! Process configuration
//!
//! Loaded from an optional YAML/JSON file, then overridden by environment
//! variables. Defaults are safe for a single-box run against the in-process
//! transport.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Which transport backend to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Redis Streams broker
    Redis,
    /// In-process transport
    #[default]
    Local,
}

/// Git credential and identity settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Logging sink settings (consumed by the binary's subscriber setup)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub console: bool,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            console: true,
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Limits for the information-acquisition helpers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InformationConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests_per_iteration: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
    #[serde(default = "default_max_http_bytes")]
    pub max_http_bytes: usize,
    #[serde(default = "default_max_snippet_chars")]
    pub max_snippet_chars: usize,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default)]
    pub deny_hosts: Vec<String>,
    #[serde(default)]
    pub deny_hosts_file: Option<PathBuf>,
    #[serde(default = "default_artifact_subdir")]
    pub artifact_subdir: String,
}

impl Default for InformationConfig {
    fn default() -> Self {
        Self {
            max_requests_per_iteration: default_max_requests(),
            max_file_bytes: default_max_file_bytes(),
            max_http_bytes: default_max_http_bytes(),
            max_snippet_chars: default_max_snippet_chars(),
            http_timeout_ms: default_http_timeout_ms(),
            deny_hosts: Vec::new(),
            deny_hosts_file: None,
            artifact_subdir: default_artifact_subdir(),
        }
    }
}

fn default_max_requests() -> usize {
    8
}

fn default_max_file_bytes() -> usize {
    256 * 1024
}

fn default_max_http_bytes() -> usize {
    512 * 1024
}

fn default_max_snippet_chars() -> usize {
    20_000
}

fn default_http_timeout_ms() -> u64 {
    15_000
}

fn default_artifact_subdir() -> String {
    "acquisitions".to_string()
}

/// Top-level Ensemble configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Directory under which project checkouts live
    #[serde(default = "default_project_base")]
    pub project_base: PathBuf,

    #[serde(default)]
    pub git: GitConfig,

    /// Allow repo mutations against the process's own working directory
    #[serde(default)]
    pub allow_workspace_git: bool,

    /// Extension deny-list for repo mutations (merged with per-call overrides)
    #[serde(default)]
    pub blocked_exts: Vec<String>,

    /// Write diagnostic artifacts for mutation fallbacks
    #[serde(default = "default_true")]
    pub write_diagnostics: bool,

    #[serde(default = "default_request_stream")]
    pub request_stream: String,

    #[serde(default = "default_response_stream")]
    pub response_stream: String,

    #[serde(default)]
    pub transport: TransportKind,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default)]
    pub redis_password: Option<String>,

    /// Base URL of the external task dashboard, if one is attached
    #[serde(default)]
    pub dashboard_url: Option<String>,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default, rename = "information_requests")]
    pub information: InformationConfig,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        // All fields carry serde defaults; an empty document is a full config.
        serde_json::from_value(serde_json::json!({}))
            .unwrap_or_else(|_| unreachable!("empty config must deserialize"))
    }
}

fn default_project_base() -> PathBuf {
    PathBuf::from("./projects")
}

fn default_request_stream() -> String {
    "ensemble:requests".to_string()
}

fn default_response_stream() -> String {
    "ensemble:events".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

/// Configuration load failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

impl EnsembleConfig {
    /// Load from a YAML or JSON file (sniffed by extension), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                let is_json = path.extension().is_some_and(|e| e == "json");
                if is_json {
                    serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    })?
                } else {
                    serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    })?
                }
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides for the settings operators change per deployment
    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("ENSEMBLE_TRANSPORT") {
            match value.to_ascii_lowercase().as_str() {
                "redis" => self.transport = TransportKind::Redis,
                "local" => self.transport = TransportKind::Local,
                _ => {}
            }
        }
        if let Ok(value) = std::env::var("ENSEMBLE_REDIS_URL") {
            self.redis_url = value;
        }
        if let Ok(value) = std::env::var("ENSEMBLE_REDIS_PASSWORD") {
            self.redis_password = Some(value);
        }
        if let Ok(value) = std::env::var("ENSEMBLE_DASHBOARD_URL") {
            self.dashboard_url = Some(value);
        }
        if let Ok(value) = std::env::var("ENSEMBLE_PROJECT_BASE") {
            self.project_base = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("ENSEMBLE_REQUEST_STREAM") {
            self.request_stream = value;
        }
        if let Ok(value) = std::env::var("ENSEMBLE_RESPONSE_STREAM") {
            self.response_stream = value;
        }
        if let Ok(value) = std::env::var("ENSEMBLE_ALLOW_WORKSPACE_GIT") {
            self.allow_workspace_git = matches!(value.as_str(), "1" | "true" | "yes");
        }
        if let Ok(value) = std::env::var("ENSEMBLE_LOG_LEVEL") {
            self.log.level = value;
        }
    }

    /// Redis URL with the configured password spliced into the userinfo
    /// section when one is set separately from the URL.
    pub fn effective_redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) if !self.redis_url.contains('@') => {
                match self.redis_url.split_once("://") {
                    Some((scheme, rest)) => format!("{scheme}://:{password}@{rest}"),
                    None => self.redis_url.clone(),
                }
            }
            _ => self.redis_url.clone(),
        }
    }
}
