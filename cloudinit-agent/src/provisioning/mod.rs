//! Guest provisioning from management-plane directives
//!
//! A directive carries the instance id (applied as hostname) and the
//! administrator credential. Application goes through the [`OsProvisioner`]
//! selected once at startup:
//! - hostname: compared with the current one, renamed only when it differs
//! - credential: always re-applied, it cannot be read back for comparison
//! - bootstrap file: rewritten so boot-time tooling sees the same identity
//!
//! The instance id must be a plain hostname label and the credential a single
//! line; anything else is rejected before a command is built. The bootstrap
//! file doubles as the applied marker, so a rename still pending a reboot is
//! not repeated after a restart.
//!
//! Failures are logged and leave the engine in `Failed`; the next directive
//! starts over from `Configuring`.

mod linux;
mod windows;

pub use linux::LinuxProvisioner;
pub use windows::WindowsProvisioner;

use crate::capabilities::{OsFamily, ProvisioningCapabilities};
use crate::config::AgentConfig;
use crate::execution::{CommandError, CommandRunner, CommandSpec, ExecutionResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Longest hostname label accepted as an instance id
const MAX_INSTANCE_ID_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("`{command}` exited with {exit_code:?}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not determine the current hostname")]
    HostnameUnavailable,
}

impl ProvisionError {
    pub(crate) fn from_result(spec: &CommandSpec, result: &ExecutionResult) -> Self {
        ProvisionError::CommandFailed {
            command: spec.to_string(),
            exit_code: result.exit_code,
            stderr: result.stderr.trim().to_string(),
        }
    }
}

/// Instance identity and credential returned by the management endpoint
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ProvisioningDirective {
    #[serde(rename = "vm_uuid", default)]
    pub instance_id: String,
    #[serde(rename = "vm_pass", default)]
    pub credential: String,
}

impl ProvisioningDirective {
    #[cfg(test)]
    pub fn new(instance_id: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            credential: credential.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.instance_id.is_empty() && !self.credential.is_empty()
    }

    /// Why the directive cannot be applied as-is, if anything
    pub fn validate(&self) -> Result<(), &'static str> {
        if !is_valid_instance_id(&self.instance_id) {
            return Err("instance id must be 1-63 ASCII letters, digits or '-'");
        }
        if self.credential.chars().any(char::is_control) {
            return Err("credential must not contain control characters");
        }
        Ok(())
    }
}

fn is_valid_instance_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_INSTANCE_ID_LEN
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

impl fmt::Debug for ProvisioningDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningDirective")
            .field("instance_id", &self.instance_id)
            .field("credential", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Unconfigured,
    Configuring,
    Configured,
    Failed,
}

/// Marker of the last directive applied successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedProvisioningState {
    pub instance_id: String,
    pub applied_at: DateTime<Utc>,
}

/// OS-specific provisioning operations
#[async_trait]
pub trait OsProvisioner: Send + Sync {
    fn family(&self) -> OsFamily;

    async fn current_hostname(&self) -> Result<String, ProvisionError>;

    /// Whether `current` already satisfies the `target` hostname
    fn hostname_matches(&self, current: &str, target: &str) -> bool {
        current == target
    }

    /// Identity recorded in the bootstrap file by an earlier run
    async fn load_applied_state(&self) -> Option<AppliedProvisioningState>;

    async fn set_hostname(&self, instance_id: &str) -> Result<(), ProvisionError>;

    async fn set_credential(&self, credential: &str) -> Result<(), ProvisionError>;

    async fn write_bootstrap_file(
        &self,
        instance_id: &str,
        credential: &str,
    ) -> Result<(), ProvisionError>;
}

/// Applies directives through the platform provisioner
pub struct ProvisioningEngine {
    provisioner: Option<Box<dyn OsProvisioner>>,
    platform: String,
    state: ProvisioningState,
    last_applied: Option<AppliedProvisioningState>,
    /// Last hostname set successfully, possibly still pending a reboot
    renamed_to: Option<String>,
    marker_loaded: bool,
}

impl ProvisioningEngine {
    pub fn new(provisioner: Box<dyn OsProvisioner>) -> Self {
        Self {
            platform: provisioner.family().to_string(),
            provisioner: Some(provisioner),
            state: ProvisioningState::Unconfigured,
            last_applied: None,
            renamed_to: None,
            marker_loaded: false,
        }
    }

    /// Engine for a platform with no provisioner; every directive fails
    pub fn unsupported(platform: impl Into<String>) -> Self {
        Self {
            provisioner: None,
            platform: platform.into(),
            state: ProvisioningState::Unconfigured,
            last_applied: None,
            renamed_to: None,
            marker_loaded: false,
        }
    }

    /// Select the provisioner variant from startup probing
    pub fn for_platform(
        caps: &ProvisioningCapabilities,
        config: &AgentConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        match &caps.family {
            OsFamily::Linux => Self::new(Box::new(LinuxProvisioner::new(
                runner,
                config.linux_bootstrap_path(),
                config.linux_hostname_path(),
                config.use_sudo() && !caps.is_root,
            ))),
            OsFamily::Windows => Self::new(Box::new(WindowsProvisioner::new(
                runner,
                config.windows_bootstrap_path(),
            ))),
            OsFamily::Other(os) => {
                warn!(os = %os, "Provisioning not supported on this OS, telemetry only");
                Self::unsupported(os.clone())
            }
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    pub fn last_applied(&self) -> Option<&AppliedProvisioningState> {
        self.last_applied.as_ref()
    }

    /// Apply one directive. Never fails outward; the outcome is the returned state.
    pub async fn apply(&mut self, directive: &ProvisioningDirective) -> ProvisioningState {
        if !directive.is_complete() {
            warn!("Directive has an empty instance id or credential, skipping");
            return self.state;
        }
        if let Err(reason) = directive.validate() {
            warn!(reason, "Directive rejected, skipping");
            return self.state;
        }

        let Some(provisioner) = self.provisioner.as_deref() else {
            warn!(os = %self.platform, "Unsupported OS, provisioning skipped");
            self.state = ProvisioningState::Failed;
            return self.state;
        };

        if !self.marker_loaded {
            self.marker_loaded = true;
            if let Some(applied) = provisioner.load_applied_state().await {
                info!(
                    instance_id = %applied.instance_id,
                    applied_at = %applied.applied_at,
                    "Found identity applied by an earlier run"
                );
                self.renamed_to = Some(applied.instance_id.clone());
                self.last_applied = Some(applied);
            }
        }

        self.state = ProvisioningState::Configuring;
        info!(os = %self.platform, instance_id = %directive.instance_id, "Applying provisioning directive");

        let mut failed = false;

        match ensure_hostname(provisioner, &directive.instance_id, self.renamed_to.as_deref()).await
        {
            Ok(()) => self.renamed_to = Some(directive.instance_id.clone()),
            Err(e) => {
                error!(error = %e, "Hostname step failed");
                failed = true;
            }
        }

        match provisioner.set_credential(&directive.credential).await {
            Ok(()) => info!("Administrator credential applied"),
            Err(e) => {
                error!(error = %e, "Credential step failed");
                failed = true;
            }
        }

        match provisioner
            .write_bootstrap_file(&directive.instance_id, &directive.credential)
            .await
        {
            Ok(()) => info!("Bootstrap file written"),
            Err(e) => {
                error!(error = %e, "Bootstrap file step failed");
                failed = true;
            }
        }

        if failed {
            self.state = ProvisioningState::Failed;
            warn!(instance_id = %directive.instance_id, "Provisioning failed, will retry on next directive");
        } else {
            self.state = ProvisioningState::Configured;
            self.last_applied = Some(AppliedProvisioningState {
                instance_id: directive.instance_id.clone(),
                applied_at: Utc::now(),
            });
            info!(instance_id = %directive.instance_id, "Provisioning complete");
        }
        self.state
    }
}

/// Rename unless the host already has, or is pending, the target name
async fn ensure_hostname(
    provisioner: &dyn OsProvisioner,
    instance_id: &str,
    renamed_to: Option<&str>,
) -> Result<(), ProvisionError> {
    let current = provisioner.current_hostname().await?;
    if provisioner.hostname_matches(&current, instance_id) {
        info!(hostname = %current, "Hostname already set, no change needed");
        return Ok(());
    }
    if renamed_to.is_some_and(|applied| provisioner.hostname_matches(applied, instance_id)) {
        info!(current = %current, target = %instance_id, "Rename already applied, effective after reboot");
        return Ok(());
    }

    info!(current = %current, target = %instance_id, "Renaming host");
    provisioner.set_hostname(instance_id).await
}

/// Hostname from the `hostname` command, falling back to the hostname syscall
pub(crate) async fn query_hostname(runner: &dyn CommandRunner) -> Result<String, ProvisionError> {
    let spec = CommandSpec::new("hostname", Vec::<String>::new());
    match runner.run(&spec).await {
        Ok(result) if result.success && !result.first_line().is_empty() => {
            return Ok(result.first_line().to_string());
        }
        Ok(result) => warn!(exit_code = ?result.exit_code, "`hostname` returned nothing usable"),
        Err(e) => warn!(error = %e, "`hostname` command failed"),
    }

    let fallback = gethostname::gethostname().to_string_lossy().trim().to_string();
    if fallback.is_empty() {
        Err(ProvisionError::HostnameUnavailable)
    } else {
        Ok(fallback)
    }
}

/// `/etc/cloud/cloudinit` content
pub fn render_linux_bootstrap(instance_id: &str, credential: &str) -> String {
    format!("hostname: {}\npassword: {}\n", instance_id, credential)
}

/// `cloudinit-base.ini` content (CRLF line endings)
pub fn render_windows_bootstrap(instance_id: &str, credential: &str) -> String {
    [
        "[Configuration]".to_string(),
        format!("hostname={}", instance_id),
        format!("password={}", credential),
        String::new(),
        "[Users]".to_string(),
        format!("root={}", credential),
        format!("user={}", credential),
        String::new(),
    ]
    .join("\r\n")
}

/// Instance id from `/etc/cloud/cloudinit` content
pub fn parse_linux_bootstrap(content: &str) -> Option<String> {
    bootstrap_hostname(content, "hostname:")
}

/// Instance id from `cloudinit-base.ini` content
pub fn parse_windows_bootstrap(content: &str) -> Option<String> {
    bootstrap_hostname(content, "hostname=")
}

fn bootstrap_hostname(content: &str, key: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.trim().strip_prefix(key))
        .map(str::trim)
        .filter(|id| is_valid_instance_id(id))
        .map(str::to_string)
}

/// Applied marker from an existing bootstrap file; none if missing or unreadable
pub(crate) async fn read_applied_state(
    path: &Path,
    parse: fn(&str) -> Option<String>,
) -> Option<AppliedProvisioningState> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No previous bootstrap file");
            return None;
        }
    };
    let instance_id = parse(&content)?;
    let applied_at = tokio::fs::metadata(path)
        .await
        .and_then(|meta| meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Some(AppliedProvisioningState {
        instance_id,
        applied_at,
    })
}

/// Write a bootstrap file, creating its directory; owner-only on Unix
pub(crate) async fn write_bootstrap(path: &Path, content: &str) -> Result<(), ProvisionError> {
    let io_err = |source| ProvisionError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
    }
    tokio::fs::write(path, content).await.map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io_err)?;
    }

    info!(path = %path.display(), "Bootstrap configuration written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::fake::FakeRunner;

    fn linux_engine(runner: Arc<FakeRunner>, dir: &Path) -> ProvisioningEngine {
        ProvisioningEngine::new(Box::new(LinuxProvisioner::new(
            runner,
            dir.join("cloud").join("cloudinit"),
            dir.join("hostname"),
            true,
        )))
    }

    #[test]
    fn test_directive_parsing_and_redaction() {
        let directive: ProvisioningDirective =
            serde_json::from_str(r#"{"vm_uuid":"vm-42","vm_pass":"X"}"#).unwrap();
        assert_eq!(directive, ProvisioningDirective::new("vm-42", "X"));
        assert!(directive.is_complete());
        assert!(!format!("{:?}", directive).contains("\"X\""));

        let partial: ProvisioningDirective = serde_json::from_str(r#"{"vm_uuid":"vm-42"}"#).unwrap();
        assert!(!partial.is_complete());
    }

    #[test]
    fn test_bootstrap_renderers() {
        assert_eq!(
            render_linux_bootstrap("vm-42", "X"),
            "hostname: vm-42\npassword: X\n"
        );
        assert_eq!(
            render_windows_bootstrap("vm-42", "X"),
            "[Configuration]\r\nhostname=vm-42\r\npassword=X\r\n\r\n[Users]\r\nroot=X\r\nuser=X\r\n"
        );
    }

    #[tokio::test]
    async fn test_idempotent_provisioning() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new("localhost"));
        let mut engine = linux_engine(runner.clone(), dir.path());
        let directive = ProvisioningDirective::new("vm-42", "X");

        assert_eq!(engine.apply(&directive).await, ProvisioningState::Configured);
        assert_eq!(engine.apply(&directive).await, ProvisioningState::Configured);

        assert_eq!(runner.count("hostnamectl set-hostname vm-42"), 1);
        assert_eq!(runner.count("chpasswd"), 2);
        assert_eq!(runner.hostname(), "vm-42");
        assert_eq!(engine.last_applied().unwrap().instance_id, "vm-42");

        let written = tokio::fs::read_to_string(dir.path().join("cloud").join("cloudinit"))
            .await
            .unwrap();
        assert_eq!(written, "hostname: vm-42\npassword: X\n");
    }

    #[test]
    fn test_directive_validation() {
        assert!(ProvisioningDirective::new("vm-42", "X").validate().is_ok());
        assert!(ProvisioningDirective::new("6f1c2a9e-0b7d-4e55-9a7c-3d2f1e0c8b41", "p@ss w0rd;&|")
            .validate()
            .is_ok());
        assert!(ProvisioningDirective::new("x&del /q C:\\*", "p").validate().is_err());
        assert!(ProvisioningDirective::new("vm;Stop-Computer", "p").validate().is_err());
        assert!(ProvisioningDirective::new("a".repeat(64), "p").validate().is_err());
        assert!(ProvisioningDirective::new("vm-42", "x\nadmin:owned").validate().is_err());
        assert!(ProvisioningDirective::new("vm-42", "x\r").validate().is_err());
    }

    #[tokio::test]
    async fn test_multiline_credential_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new("localhost"));
        let mut engine = linux_engine(runner.clone(), dir.path());

        let state = engine
            .apply(&ProvisioningDirective::new("vm-42", "x\nadmin:owned"))
            .await;

        assert_eq!(state, ProvisioningState::Unconfigured);
        assert!(runner.calls().is_empty());
        assert!(!dir.path().join("cloud").join("cloudinit").exists());
    }

    #[test]
    fn test_bootstrap_parsers() {
        assert_eq!(
            parse_linux_bootstrap(&render_linux_bootstrap("vm-42", "X")).as_deref(),
            Some("vm-42")
        );
        assert_eq!(
            parse_windows_bootstrap(&render_windows_bootstrap("vm-42", "X")).as_deref(),
            Some("vm-42")
        );
        assert_eq!(parse_linux_bootstrap("password: X\n"), None);
        assert_eq!(parse_windows_bootstrap("[Configuration]\r\nhostname=a&b\r\n"), None);
    }

    #[tokio::test]
    async fn test_bootstrap_file_marks_earlier_application() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new("localhost"));
        let mut engine = linux_engine(runner.clone(), dir.path());
        engine.apply(&ProvisioningDirective::new("vm-42", "X")).await;

        // Restarted agent on a host whose rename has not taken effect
        let restarted_runner = Arc::new(FakeRunner::new("localhost"));
        let mut restarted = linux_engine(restarted_runner.clone(), dir.path());
        let state = restarted.apply(&ProvisioningDirective::new("vm-42", "X")).await;

        assert_eq!(state, ProvisioningState::Configured);
        assert_eq!(restarted_runner.count("hostnamectl"), 0);
        assert_eq!(restarted_runner.count("chpasswd"), 1);
        assert_eq!(restarted.last_applied().unwrap().instance_id, "vm-42");

        // A different id is still applied
        restarted.apply(&ProvisioningDirective::new("vm-43", "X")).await;
        assert_eq!(restarted_runner.count("hostnamectl set-hostname vm-43"), 1);
    }

    #[tokio::test]
    async fn test_incomplete_directive_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new("localhost"));
        let mut engine = linux_engine(runner.clone(), dir.path());

        let state = engine.apply(&ProvisioningDirective::new("", "X")).await;
        assert_eq!(state, ProvisioningState::Unconfigured);
        let state = engine.apply(&ProvisioningDirective::new("vm-42", "")).await;
        assert_eq!(state, ProvisioningState::Unconfigured);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_os_fails_without_commands() {
        let mut engine = ProvisioningEngine::unsupported("freebsd");
        let state = engine.apply(&ProvisioningDirective::new("vm-42", "X")).await;
        assert_eq!(state, ProvisioningState::Failed);
        assert!(engine.last_applied().is_none());
    }

    #[tokio::test]
    async fn test_failed_step_then_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new("localhost").fail_on("chpasswd"));
        let mut engine = linux_engine(runner.clone(), dir.path());
        let directive = ProvisioningDirective::new("vm-42", "X");

        assert_eq!(engine.apply(&directive).await, ProvisioningState::Failed);
        // Remaining steps still ran
        assert_eq!(runner.hostname(), "vm-42");
        assert!(dir.path().join("cloud").join("cloudinit").exists());
        assert!(engine.last_applied().is_none());

        runner.clear_failures();
        assert_eq!(engine.apply(&directive).await, ProvisioningState::Configured);
        assert_eq!(runner.count("hostnamectl"), 1);
    }
}
