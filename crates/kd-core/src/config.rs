use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::store::InstancePolicy;

/// Top-level configuration loaded from `~/.kindling/config.toml`.
///
/// Every section is optional; missing sections and fields fall back to
/// their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub environments: EnvironmentsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
}

impl Config {
    /// Load config from `~/.kindling/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.daemon.validate()?;
        self.tools.validate()?;
        self.terminal.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".kindling")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub log_json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "daemon.host must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::Validation(
                "daemon.port must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_daemon_host() -> String {
    "127.0.0.1".into()
}
fn default_daemon_port() -> u16 {
    5000
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentsConfig {
    #[serde(default)]
    pub policy: InstancePolicy,
}

/// External command-line tools driven by the provisioning workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default = "default_docker")]
    pub docker: String,
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    #[serde(default = "default_istioctl")]
    pub istioctl: String,
    /// Istio profile installed when an environment asks for a mesh.
    #[serde(default = "default_mesh_profile")]
    pub mesh_profile: String,
    /// Directory for transient cluster-config documents (system temp dir when unset).
    #[serde(default)]
    pub config_dir: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            docker: default_docker(),
            kubectl: default_kubectl(),
            istioctl: default_istioctl(),
            mesh_profile: default_mesh_profile(),
            config_dir: None,
        }
    }
}

impl ToolsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let binaries = [
            ("tools.kind", &self.kind),
            ("tools.docker", &self.docker),
            ("tools.kubectl", &self.kubectl),
            ("tools.istioctl", &self.istioctl),
        ];
        for (key, value) in binaries {
            if value.trim().is_empty() {
                return Err(ConfigError::Validation(format!("{key} must not be empty")));
            }
        }
        Ok(())
    }

    pub fn config_dir(&self) -> PathBuf {
        self.config_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }
}

fn default_kind() -> String {
    "kind".into()
}
fn default_docker() -> String {
    "docker".into()
}
fn default_kubectl() -> String {
    "kubectl".into()
}
fn default_istioctl() -> String {
    "istioctl".into()
}
fn default_mesh_profile() -> String {
    "demo".into()
}

// ---------------------------------------------------------------------------
// Terminal settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Shell executed inside the control-plane container.
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            term: default_term(),
            default_cols: default_cols(),
            default_rows: default_rows(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl TerminalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_cols == 0 || self.default_rows == 0 {
            return Err(ConfigError::Validation(
                "terminal.default_cols and terminal.default_rows must be non-zero".to_string(),
            ));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Validation(
                "terminal.max_sessions must be at least 1".to_string(),
            ));
        }
        if self.shell.trim().is_empty() {
            return Err(ConfigError::Validation(
                "terminal.shell must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_shell() -> String {
    "/bin/bash".into()
}
fn default_term() -> String {
    "xterm-color".into()
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_max_sessions() -> usize {
    64
}
