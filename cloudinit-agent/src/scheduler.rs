//! Fixed-cadence cycle driver
//!
//! A short ticker polls [`Scheduler::is_due`]; a cycle runs when at least the
//! cadence has passed since the start of the last successful one. Overrunning
//! cycles are followed immediately by the next one, with no catch-up.

use crate::agent::CycleSummary;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Source of monotonic time
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// One complete sample → report → provision pass
#[async_trait]
pub trait CycleRunner: Send {
    async fn run_cycle(&mut self) -> Result<CycleSummary>;
}

pub struct Scheduler<C: Clock = SystemClock> {
    clock: C,
    cadence: Duration,
    tick: Duration,
    last_cycle: Option<Instant>,
}

impl<C: Clock> Scheduler<C> {
    pub fn new(clock: C, cadence: Duration, tick: Duration) -> Self {
        Self {
            clock,
            cadence,
            tick,
            last_cycle: None,
        }
    }

    /// Start time of the last successful cycle
    #[cfg(test)]
    pub fn last_cycle(&self) -> Option<Instant> {
        self.last_cycle
    }

    pub fn is_due(&self) -> bool {
        match self.last_cycle {
            None => true,
            Some(last) => self.clock.now().saturating_duration_since(last) >= self.cadence,
        }
    }

    /// Run one cycle if due. A failed cycle leaves the schedule untouched so
    /// the next tick retries it.
    pub async fn tick<R>(&mut self, runner: &mut R) -> Option<CycleSummary>
    where
        R: CycleRunner + ?Sized,
    {
        if !self.is_due() {
            return None;
        }

        let started = self.clock.now();
        match runner.run_cycle().await {
            Ok(summary) => {
                self.last_cycle = Some(started);
                let elapsed = self.clock.now().saturating_duration_since(started);
                if elapsed >= self.cadence {
                    info!(
                        elapsed_secs = elapsed.as_secs(),
                        "Cycle overran the cadence, next one starts immediately"
                    );
                }
                Some(summary)
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Cycle aborted, retrying on next tick");
                None
            }
        }
    }

    /// Drive cycles forever
    pub async fn run<R>(&mut self, runner: &mut R)
    where
        R: CycleRunner + ?Sized,
    {
        info!(
            cadence_secs = self.cadence.as_secs(),
            tick_ms = self.tick.as_millis() as u64,
            "Starting report loop"
        );

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Some(summary) = self.tick(runner).await {
                debug!(?summary, "Cycle finished");
            }
        }
    }
}
