//! Incremental snapshots of the cumulative traffic counters
//!
//! Only `network_u`, `network_d` and `flu_usage` are cumulative. Every other
//! field of `HostMetrics` is reported as the instantaneous value it was sampled at.

use crate::metrics::HostMetrics;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// The cumulative counters carried from one cycle to the next
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    pub network_u: u64,
    pub network_d: u64,
    pub flu_usage: u64,
}

impl From<&HostMetrics> for TrafficCounters {
    fn from(metrics: &HostMetrics) -> Self {
        Self {
            network_u: metrics.network_u,
            network_d: metrics.network_d,
            flu_usage: metrics.flu_usage,
        }
    }
}

/// A `HostMetrics` whose traffic counters hold per-cycle increments.
/// Serializes to exactly the `HostMetrics` wire shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaSnapshot {
    metrics: HostMetrics,
}

impl DeltaSnapshot {
    pub fn metrics(&self) -> &HostMetrics {
        &self.metrics
    }
}

/// Field-wise `current - previous` on the traffic counters, clamped at 0.
/// Without a previous sample the increments are 0.
pub fn compute_delta(previous: Option<&TrafficCounters>, current: &HostMetrics) -> DeltaSnapshot {
    let mut metrics = current.clone();

    match previous {
        Some(prev) => {
            metrics.network_u = clamped_delta("network_u", prev.network_u, current.network_u);
            metrics.network_d = clamped_delta("network_d", prev.network_d, current.network_d);
            metrics.flu_usage = clamped_delta("flu_usage", prev.flu_usage, current.flu_usage);
        }
        None => {
            metrics.network_u = 0;
            metrics.network_d = 0;
            metrics.flu_usage = 0;
        }
    }

    DeltaSnapshot { metrics }
}

fn clamped_delta(field: &'static str, previous: u64, current: u64) -> u64 {
    if current < previous {
        warn!(
            field,
            previous, current, "Counter went backwards (reset or interface change), reporting 0"
        );
    }
    current.saturating_sub(previous)
}

/// Owns the previous counters and carries them forward between cycles
#[derive(Debug, Default)]
pub struct DeltaTracker {
    previous: Option<TrafficCounters>,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the increment since the last observation and remember `current`
    pub fn observe(&mut self, current: &HostMetrics) -> DeltaSnapshot {
        let snapshot = compute_delta(self.previous.as_ref(), current);
        self.previous = Some(TrafficCounters::from(current));

        debug!(
            network_u = snapshot.metrics.network_u,
            network_d = snapshot.metrics.network_d,
            flu_usage = snapshot.metrics.flu_usage,
            "Computed traffic delta"
        );
        snapshot
    }

    #[cfg(test)]
    pub fn previous(&self) -> Option<&TrafficCounters> {
        self.previous.as_ref()
    }
}
