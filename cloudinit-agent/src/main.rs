//! Cloudinit Agent - guest-side telemetry and provisioning agent
//!
//! Runs inside a hypervisor-managed VM and:
//! - Samples host metrics and reports per-cycle increments every minute
//! - Finds the management endpoint from each interface's gateway
//! - Applies hostname and administrator credential directives returned by it
//! - Persists the applied identity into the OS bootstrap configuration

mod agent;
mod capabilities;
mod config;
mod delta;
mod discovery;
mod execution;
mod metrics;
mod provisioning;
mod reporter;
mod scheduler;

use agent::Agent;
use anyhow::{Context, Result};
use capabilities::ProvisioningCapabilities;
use config::AgentConfig;
use execution::SystemCommandRunner;
use metrics::SysinfoSource;
use provisioning::ProvisioningEngine;
use reporter::HttpReporter;
use scheduler::{Scheduler, SystemClock};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cloudinit_agent=info")),
        )
        .init();

    info!("🤖 Cloudinit Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load()
        .await
        .context("Failed to load agent configuration")?;

    let caps = ProvisioningCapabilities::detect().await;
    let missing = caps.missing();
    if !missing.is_empty() {
        warn!(os = %caps.family, missing = ?missing, "Some provisioning commands are unavailable");
    }
    info!(os = %caps.family, root = caps.is_root, "Provisioning capabilities detected");

    let runner = Arc::new(SystemCommandRunner::new(config.command_timeout()));
    let engine = ProvisioningEngine::for_platform(&caps, &config, runner);

    let interfaces = discovery::enumerate_interfaces()
        .await
        .context("Failed to enumerate network interfaces")?;
    info!("Found {} network interfaces", interfaces.len());

    let reporter = HttpReporter::new(config.request_timeout(), config.report_path())
        .context("Failed to build HTTP client")?;

    let mut agent = Agent::new(
        Box::new(SysinfoSource::new()),
        interfaces,
        Box::new(reporter),
        engine,
        config.report_port(),
    );
    let mut scheduler = Scheduler::new(SystemClock, config.report_interval(), config.tick_interval());

    tokio::select! {
        _ = scheduler.run(&mut agent) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received, stopping");
        }
    }

    Ok(())
}
