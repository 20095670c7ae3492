//! Platform probing for provisioning
//!
//! Detects once at startup:
//! - The OS family, which selects the provisioner variant
//! - Whether the provisioning commands for that family are in PATH
//! - Whether the agent already runs as root (no `sudo` prefix needed)

use std::fmt;
use tokio::process::Command;
use tracing::{debug, warn};

/// OS family as far as provisioning is concerned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    Windows,
    Other(String),
}

impl OsFamily {
    pub fn detect() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Self {
        match os.to_lowercase().as_str() {
            "linux" => OsFamily::Linux,
            "windows" => OsFamily::Windows,
            other => OsFamily::Other(other.to_string()),
        }
    }

    /// Commands the provisioner for this family relies on
    pub fn required_commands(&self) -> &'static [&'static str] {
        match self {
            OsFamily::Linux => &["hostname", "hostnamectl", "chpasswd"],
            OsFamily::Windows => &["hostname", "wmic", "net"],
            OsFamily::Other(_) => &[],
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::Linux => write!(f, "linux"),
            OsFamily::Windows => write!(f, "windows"),
            OsFamily::Other(os) => write!(f, "{}", os),
        }
    }
}

/// Availability of one command
#[derive(Debug, Clone)]
pub struct CapabilityInfo {
    pub command: &'static str,
    pub available: bool,
}

/// Result of startup probing
#[derive(Debug, Clone)]
pub struct ProvisioningCapabilities {
    pub family: OsFamily,
    pub commands: Vec<CapabilityInfo>,
    pub is_root: bool,
}

impl ProvisioningCapabilities {
    pub async fn detect() -> Self {
        let family = OsFamily::detect();
        debug!(os = %family, "Detecting provisioning capabilities...");

        let mut commands = Vec::new();
        for &command in family.required_commands() {
            let available = command_exists(command).await;
            if !available {
                warn!(command, "Provisioning command not found in PATH, fallbacks only");
            }
            commands.push(CapabilityInfo { command, available });
        }

        let available_count = commands.iter().filter(|c| c.available).count();
        debug!("Detected {}/{} provisioning commands", available_count, commands.len());

        Self {
            family,
            commands,
            is_root: is_root(),
        }
    }

    pub fn missing(&self) -> Vec<&'static str> {
        self.commands
            .iter()
            .filter(|c| !c.available)
            .map(|c| c.command)
            .collect()
    }
}

/// Check if a command exists in PATH
async fn command_exists(command: &str) -> bool {
    let check = if cfg!(target_os = "windows") {
        Command::new("where").arg(command).output().await
    } else {
        Command::new("which").arg(command).output().await
    };

    match check {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}
