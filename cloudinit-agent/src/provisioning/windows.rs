//! Windows provisioner: wmic rename with a PowerShell fallback, `net user`

use super::{
    parse_windows_bootstrap, query_hostname, read_applied_state, render_windows_bootstrap,
    write_bootstrap, AppliedProvisioningState, OsProvisioner, ProvisionError,
};
use crate::capabilities::OsFamily;
use crate::execution::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub struct WindowsProvisioner {
    runner: Arc<dyn CommandRunner>,
    bootstrap_path: PathBuf,
}

impl WindowsProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>, bootstrap_path: impl AsRef<Path>) -> Self {
        Self {
            runner,
            bootstrap_path: bootstrap_path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl OsProvisioner for WindowsProvisioner {
    fn family(&self) -> OsFamily {
        OsFamily::Windows
    }

    async fn current_hostname(&self) -> Result<String, ProvisionError> {
        query_hostname(self.runner.as_ref()).await
    }

    async fn load_applied_state(&self) -> Option<AppliedProvisioningState> {
        read_applied_state(&self.bootstrap_path, parse_windows_bootstrap).await
    }

    /// NetBIOS names are case-insensitive
    fn hostname_matches(&self, current: &str, target: &str) -> bool {
        current.to_lowercase() == target.to_lowercase()
    }

    async fn set_hostname(&self, instance_id: &str) -> Result<(), ProvisionError> {
        // Runs through cmd so %computername% is expanded
        let wmic = CommandSpec::new(
            "cmd",
            [
                "/C",
                "wmic",
                "computersystem",
                "where",
                "name='%computername%'",
                "rename",
                instance_id,
            ],
        );

        match self.runner.run(&wmic).await {
            Ok(result) if result.success => {
                info!(hostname = %instance_id, "Hostname set with wmic, effective after reboot");
                return Ok(());
            }
            Ok(result) => warn!(
                exit_code = ?result.exit_code,
                stderr = %result.stderr.trim(),
                "wmic rename failed, falling back to Rename-Computer"
            ),
            Err(e) => warn!(error = %e, "wmic unavailable, falling back to Rename-Computer"),
        }

        let rename = CommandSpec::new(
            "powershell",
            [
                "-NoProfile",
                "-NonInteractive",
                "-Command",
                "Rename-Computer",
                "-NewName",
                instance_id,
                "-Force",
            ],
        );
        let result = self.runner.run(&rename).await?;
        if !result.success {
            return Err(ProvisionError::from_result(&rename, &result));
        }
        info!(hostname = %instance_id, "Hostname set with Rename-Computer, effective after reboot");
        Ok(())
    }

    async fn set_credential(&self, credential: &str) -> Result<(), ProvisionError> {
        let spec = CommandSpec::new("net", ["user", "administrator", credential]).sensitive();
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
            &render_windows_bootstrap(instance_id, credential),
        )
        .await
    }
}
