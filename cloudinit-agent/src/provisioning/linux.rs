//! Linux provisioner: hostnamectl, /etc/hostname fallback, chpasswd

use super::{
    parse_linux_bootstrap, query_hostname, read_applied_state, render_linux_bootstrap,
    write_bootstrap, AppliedProvisioningState, OsProvisioner, ProvisionError,
};
use crate::capabilities::OsFamily;
use crate::execution::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub struct LinuxProvisioner {
    runner: Arc<dyn CommandRunner>,
    bootstrap_path: PathBuf,
    hostname_path: PathBuf,
    use_sudo: bool,
}

impl LinuxProvisioner {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        bootstrap_path: impl AsRef<Path>,
        hostname_path: impl AsRef<Path>,
        use_sudo: bool,
    ) -> Self {
        Self {
            runner,
            bootstrap_path: bootstrap_path.as_ref().to_path_buf(),
            hostname_path: hostname_path.as_ref().to_path_buf(),
            use_sudo,
        }
    }

    fn privileged(&self, spec: CommandSpec) -> CommandSpec {
        if self.use_sudo {
            spec.elevated()
        } else {
            spec
        }
    }

    /// Rewrite the hostname file, then apply it with the legacy `hostname` command
    async fn legacy_set_hostname(&self, instance_id: &str) -> Result<(), ProvisionError> {
        tokio::fs::write(&self.hostname_path, format!("{}\n", instance_id))
            .await
            .map_err(|source| ProvisionError::Io {
                path: self.hostname_path.clone(),
                source,
            })?;

        let spec = self.privileged(CommandSpec::new("hostname", [instance_id]));
        let result = self.runner.run(&spec).await?;
        if !result.success {
            return Err(ProvisionError::from_result(&spec, &result));
        }
        Ok(())
    }
}

#[async_trait]
impl OsProvisioner for LinuxProvisioner {
    fn family(&self) -> OsFamily {
        OsFamily::Linux
    }

    async fn current_hostname(&self) -> Result<String, ProvisionError> {
        query_hostname(self.runner.as_ref()).await
    }

    async fn load_applied_state(&self) -> Option<AppliedProvisioningState> {
        read_applied_state(&self.bootstrap_path, parse_linux_bootstrap).await
    }

    async fn set_hostname(&self, instance_id: &str) -> Result<(), ProvisionError> {
        let spec = self.privileged(CommandSpec::new(
            "hostnamectl",
            ["set-hostname", instance_id],
        ));

        match self.runner.run(&spec).await {
            Ok(result) if result.success => {
                info!(hostname = %instance_id, "Hostname set with hostnamectl");
                return Ok(());
            }
            Ok(result) => warn!(
                exit_code = ?result.exit_code,
                stderr = %result.stderr.trim(),
                "hostnamectl failed, falling back to hostname file"
            ),
            Err(e) => warn!(error = %e, "hostnamectl unavailable, falling back to hostname file"),
        }

        self.legacy_set_hostname(instance_id).await?;
        info!(hostname = %instance_id, "Hostname set with legacy method");
        Ok(())
    }

    async fn set_credential(&self, credential: &str) -> Result<(), ProvisionError> {
        let spec = self
            .privileged(CommandSpec::new("chpasswd", Vec::<String>::new()))
            .with_stdin(format!("root:{}", credential))
            .sensitive();

        let result = self.runner.run(&spec).await?;
        if !result.success {
            return Err(ProvisionError::from_result(&spec, &result));
        }
        Ok(())
    }

    async fn write_bootstrap_file(
        &self,
        instance_id: &str,
        credential: &str,
    ) -> Result<(), ProvisionError> {
        write_bootstrap(
            &self.bootstrap_path,
            &render_linux_bootstrap(instance_id, credential),
        )
        .await
    }
}
