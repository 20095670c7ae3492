//! Agent configuration
//!
//! Handles:
//! - Report cadence and management endpoint settings
//! - Bootstrap file locations per OS family
//! - Loading from an optional TOML file, validated through a builder
//!
//! Every value goes through [`AgentConfigBuilder::build`]. An out-of-range or
//! unknown field is rejected when the config is constructed.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable overriding the config file location
pub const CONFIG_ENV_VAR: &str = "CLOUDINIT_AGENT_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Validated agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    report_interval: Duration,
    tick_interval: Duration,
    report_port: u16,
    report_path: String,
    request_timeout: Duration,
    command_timeout: Duration,
    linux_bootstrap_path: PathBuf,
    windows_bootstrap_path: PathBuf,
    linux_hostname_path: PathBuf,
    use_sudo: bool,
}

/// On-disk shape of the config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    report_interval_secs: Option<u64>,
    tick_interval_secs: Option<u64>,
    report_port: Option<u16>,
    report_path: Option<String>,
    request_timeout_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
    linux_bootstrap_path: Option<PathBuf>,
    windows_bootstrap_path: Option<PathBuf>,
    linux_hostname_path: Option<PathBuf>,
    use_sudo: Option<bool>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(60),
            tick_interval: Duration::from_secs(1),
            report_port: 1880,
            report_path: "/api/client/upload".to_string(),
            request_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            linux_bootstrap_path: PathBuf::from("/etc/cloud/cloudinit"),
            windows_bootstrap_path: PathBuf::from(r"C:\cloud\cloudinit-base.ini"),
            linux_hostname_path: PathBuf::from("/etc/hostname"),
            use_sudo: true,
        }
    }
}

impl AgentConfig {
    #[cfg(test)]
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// Load config from `$CLOUDINIT_AGENT_CONFIG` or the OS config directory.
    /// A missing file yields the defaults.
    pub async fn load() -> Result<Self, ConfigError> {
        match Self::config_file_path() {
            Some(path) if path.exists() => Self::load_from(&path).await,
            Some(path) => {
                info!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            None => {
                info!("No config directory on this platform, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load and validate a specific TOML file
    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "Loading config file");
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        AgentConfigBuilder::from_file(file).build()
    }

    /// Config file location: env override first, then `<config_dir>/cloudinit-agent/config.toml`
    pub fn config_file_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Some(PathBuf::from(path));
        }
        let mut path = dirs::config_dir()?;
        path.push("cloudinit-agent");
        path.push("config.toml");
        Some(path)
    }

    pub fn report_interval(&self) -> Duration {
        self.report_interval
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn report_port(&self) -> u16 {
        self.report_port
    }

    pub fn report_path(&self) -> &str {
        &self.report_path
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn linux_bootstrap_path(&self) -> &Path {
        &self.linux_bootstrap_path
    }

    pub fn windows_bootstrap_path(&self) -> &Path {
        &self.windows_bootstrap_path
    }

    pub fn linux_hostname_path(&self) -> &Path {
        &self.linux_hostname_path
    }

    pub fn use_sudo(&self) -> bool {
        self.use_sudo
    }
}

/// Builder for [`AgentConfig`]; unset fields keep their defaults
#[derive(Debug, Default)]
pub struct AgentConfigBuilder {
    file: ConfigFile,
}

impl AgentConfigBuilder {
    fn from_file(file: ConfigFile) -> Self {
        Self { file }
    }

    pub fn build(self) -> Result<AgentConfig, ConfigError> {
        let defaults = AgentConfig::default();
        let f = self.file;

        let report_interval = match f.report_interval_secs {
            Some(0) => return Err(invalid("report_interval_secs", "must be greater than 0")),
            Some(secs) => Duration::from_secs(secs),
            None => defaults.report_interval,
        };

        let tick_interval = match f.tick_interval_secs {
            Some(0) => return Err(invalid("tick_interval_secs", "must be greater than 0")),
            Some(secs) => Duration::from_secs(secs),
            None => defaults.tick_interval,
        };
        if tick_interval > report_interval {
            return Err(invalid(
                "tick_interval_secs",
                "must not exceed report_interval_secs",
            ));
        }

        let report_port = match f.report_port {
            Some(0) => return Err(invalid("report_port", "must not be 0")),
            Some(port) => port,
            None => defaults.report_port,
        };

        let report_path = match f.report_path {
            Some(path) if !path.starts_with('/') => {
                return Err(invalid("report_path", "must start with '/'"))
            }
            Some(path) => path,
            None => defaults.report_path,
        };

        let request_timeout = match f.request_timeout_secs {
            Some(0) => return Err(invalid("request_timeout_secs", "must be greater than 0")),
            Some(secs) => Duration::from_secs(secs),
            None => defaults.request_timeout,
        };

        let command_timeout = match f.command_timeout_secs {
            Some(0) => return Err(invalid("command_timeout_secs", "must be greater than 0")),
            Some(secs) => Duration::from_secs(secs),
            None => defaults.command_timeout,
        };

        Ok(AgentConfig {
            report_interval,
            tick_interval,
            report_port,
            report_path,
            request_timeout,
            command_timeout,
            linux_bootstrap_path: non_empty_path(
                "linux_bootstrap_path",
                f.linux_bootstrap_path,
                defaults.linux_bootstrap_path,
            )?,
            windows_bootstrap_path: non_empty_path(
                "windows_bootstrap_path",
                f.windows_bootstrap_path,
                defaults.windows_bootstrap_path,
            )?,
            linux_hostname_path: non_empty_path(
                "linux_hostname_path",
                f.linux_hostname_path,
                defaults.linux_hostname_path,
            )?,
            use_sudo: f.use_sudo.unwrap_or(defaults.use_sudo),
        })
    }
}

#[cfg(test)]
impl AgentConfigBuilder {
    pub fn report_interval_secs(mut self, secs: u64) -> Self {
        self.file.report_interval_secs = Some(secs);
        self
    }

    pub fn tick_interval_secs(mut self, secs: u64) -> Self {
        self.file.tick_interval_secs = Some(secs);
        self
    }

    pub fn report_port(mut self, port: u16) -> Self {
        self.file.report_port = Some(port);
        self
    }

    pub fn report_path(mut self, path: impl Into<String>) -> Self {
        self.file.report_path = Some(path.into());
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.file.request_timeout_secs = Some(secs);
        self
    }

    pub fn command_timeout_secs(mut self, secs: u64) -> Self {
        self.file.command_timeout_secs = Some(secs);
        self
    }

    pub fn linux_bootstrap_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file.linux_bootstrap_path = Some(path.into());
        self
    }

    pub fn windows_bootstrap_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file.windows_bootstrap_path = Some(path.into());
        self
    }

    pub fn linux_hostname_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file.linux_hostname_path = Some(path.into());
        self
    }

    pub fn use_sudo(mut self, use_sudo: bool) -> Self {
        self.file.use_sudo = Some(use_sudo);
        self
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn non_empty_path(
    field: &'static str,
    value: Option<PathBuf>,
    default: PathBuf,
) -> Result<PathBuf, ConfigError> {
    match value {
        Some(path) if path.as_os_str().is_empty() => Err(invalid(field, "must not be empty")),
        Some(path) => Ok(path),
        None => Ok(default),
    }
}
