use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Top-level server settings, loaded from TOML.
///
/// Every field has a default, so an empty (or missing) file is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address of the HTTP/WebSocket API.
    pub bind: SocketAddr,
    /// Browser origins allowed by CORS. Empty disables the CORS layer.
    pub cors_origins: Vec<String>,
    pub cluster: ClusterConfig,
    pub exec: ExecConfig,
    pub portforward: PortForwardConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            cors_origins: Vec::new(),
            cluster: ClusterConfig::default(),
            exec: ExecConfig::default(),
            portforward: PortForwardConfig::default(),
        }
    }
}

/// Which cluster to talk to.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Kubeconfig context. `None` uses the current context.
    pub context: Option<String>,
    /// Explicit kubeconfig path. `None` follows `$KUBECONFIG` / in-cluster rules.
    pub kubeconfig: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Shell used when an exec request does not name one.
    pub default_shell: String,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            default_shell: "/bin/sh".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortForwardConfig {
    /// Interface the local end of each forward listens on.
    pub listen_address: IpAddr,
    /// How long `start` waits for a session to become ready.
    pub ready_timeout_secs: u64,
    /// Upper bound on concurrently registered sessions. `None` is unbounded.
    pub max_sessions: Option<usize>,
}

impl Default for PortForwardConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ready_timeout_secs: 10,
            max_sessions: None,
        }
    }
}

impl PortForwardConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

impl Settings {
    /// Load settings from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let settings: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        settings.validate()?;
        Ok(Some(settings))
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    /// `$XDG_CONFIG_HOME/kubedeck/config.toml` (or the platform equivalent).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kubedeck").join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.portforward.ready_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "portforward.ready_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.portforward.max_sessions == Some(0) {
            return Err(ConfigError::Invalid(
                "portforward.max_sessions must be greater than zero when set".into(),
            ));
        }
        if self.exec.default_shell.trim().is_empty() {
            return Err(ConfigError::Invalid("exec.default_shell must not be empty".into()));
        }
        Ok(())
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(detail) => write!(f, "Invalid config: {}", detail),
        }
    }
}

impl std::error::Error for ConfigError {}
