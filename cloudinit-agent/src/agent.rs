//! One report cycle: sample, delta, discover, report, provision
//!
//! Targets are reported to sequentially. A directive returned by a target is
//! applied before the next target is contacted.

use crate::delta::DeltaTracker;
use crate::discovery::{discover_targets, NetworkInterface};
use crate::metrics::MetricsSource;
use crate::provisioning::{ProvisioningEngine, ProvisioningState};
use crate::reporter::{ReportOutcome, Reporter};
use crate::scheduler::CycleRunner;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// What happened during one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub targets: usize,
    pub accepted: usize,
    pub recoverable_failures: usize,
    pub directives_applied: usize,
    pub started_at: DateTime<Utc>,
}

pub struct Agent {
    source: Box<dyn MetricsSource>,
    tracker: DeltaTracker,
    interfaces: Vec<NetworkInterface>,
    reporter: Box<dyn Reporter>,
    engine: ProvisioningEngine,
    report_port: u16,
}

impl Agent {
    pub fn new(
        source: Box<dyn MetricsSource>,
        interfaces: Vec<NetworkInterface>,
        reporter: Box<dyn Reporter>,
        engine: ProvisioningEngine,
        report_port: u16,
    ) -> Self {
        Self {
            source,
            tracker: DeltaTracker::new(),
            interfaces,
            reporter,
            engine,
            report_port,
        }
    }

    #[cfg(test)]
    pub fn engine(&self) -> &ProvisioningEngine {
        &self.engine
    }
}

#[async_trait]
impl CycleRunner for Agent {
    async fn run_cycle(&mut self) -> Result<CycleSummary> {
        let mut summary = CycleSummary {
            started_at: Utc::now(),
            ..CycleSummary::default()
        };

        let metrics = self
            .source
            .sample()
            .await
            .context("Failed to sample host metrics")?;
        let snapshot = self.tracker.observe(&metrics);

        let targets = discover_targets(&self.interfaces, self.report_port);
        summary.targets = targets.len();
        if targets.is_empty() {
            warn!("No management endpoint found on any interface");
        }

        for target in &targets {
            let outcome = self.reporter.report(target, &snapshot).await;
            match &outcome {
                ReportOutcome::Accepted(_) => summary.accepted += 1,
                o if o.is_recoverable() => summary.recoverable_failures += 1,
                _ => {}
            }

            let Some(directive) = outcome.directive() else {
                continue;
            };
            if self.engine.apply(directive).await == ProvisioningState::Configured {
                summary.directives_applied += 1;
                if let Some(applied) = self.engine.last_applied() {
                    info!(
                        instance_id = %applied.instance_id,
                        applied_at = %applied.applied_at,
                        nic = %target.mac,
                        "Directive applied"
                    );
                }
            }
        }

        info!(
            targets = summary.targets,
            accepted = summary.accepted,
            recoverable_failures = summary.recoverable_failures,
            directives_applied = summary.directives_applied,
            provisioning = ?self.engine.state(),
            started_at = %summary.started_at,
            "Report cycle complete"
        );
        Ok(summary)
    }
}
