//! Process lifecycle: start the tier loops, stop them in order.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{LoopState, TierScheduler};
use crate::manager::CollectorManager;
use crate::tier::UpdateTier;

/// Owns the collector manager and the background tier loops.
pub struct Application {
    manager: Arc<CollectorManager>,
    shutdown: CancellationToken,
    schedulers: Vec<Arc<TierScheduler<Arc<CollectorManager>>>>,
    tasks: JoinSet<UpdateTier>,
    grace: Duration,
    timeout: Duration,
}

impl Application {
    /// `shutdown` is the process-wide signal; a tier loop that keeps failing
    /// cancels it.
    pub fn new(manager: Arc<CollectorManager>, shutdown: CancellationToken) -> Self {
        let grace = manager.settings().shutdown_grace();
        let timeout = manager.settings().shutdown_timeout();
        Self {
            manager,
            shutdown,
            schedulers: Vec::new(),
            tasks: JoinSet::new(),
            grace,
            timeout,
        }
    }

    pub fn manager(&self) -> &Arc<CollectorManager> {
        &self.manager
    }

    /// Get the shutdown token for external use.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// State of every started tier loop.
    pub fn loop_states(&self) -> Vec<(UpdateTier, LoopState)> {
        self.schedulers.iter().map(|s| (s.tier(), s.state())).collect()
    }

    /// Run the initial collection if configured, then spawn one loop per
    /// tier. A tier without active collectors still gets a loop; its rounds
    /// are no-ops.
    ///
    /// Returns early without spawning anything if shutdown is requested
    /// during the initial collection.
    pub async fn start(&mut self) {
        let sequential = self.manager.settings().sequential_startup;

        if sequential {
            tokio::select! {
                _ = self.manager.collect_initial() => {}
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested during initial collection");
                    return;
                }
            }
        }

        for tier in UpdateTier::ALL {
            if self.manager.active_count(tier) == 0 {
                debug!(tier = %tier, "Starting tier loop without active collectors");
            }

            let scheduler = Arc::new(
                TierScheduler::new(self.manager.clone(), tier, self.shutdown.clone())
                    .with_initial_delay(sequential),
            );
            let task = scheduler.clone();
            self.tasks.spawn(async move {
                task.run().await;
                tier
            });
            self.schedulers.push(scheduler);
        }

        info!(loops = self.schedulers.len(), "Tier loops started");
    }

    /// Stop every tier loop.
    ///
    /// 1. Signal stop to every loop and to the rest of the process.
    /// 2. Give running rounds the grace period to finish.
    /// 3. Abort what is left; aborting a loop aborts its in-flight collectors.
    /// 4. Wait a bounded time for the aborted loops to unwind.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let total_loops = self.tasks.len();
        let mut graceful_stops = 0;
        let mut forced_terminations = 0;

        info!(
            loops = total_loops,
            grace_secs = self.grace.as_secs_f64(),
            "Stopping tier loops"
        );
        self.shutdown.cancel();
        for scheduler in &self.schedulers {
            scheduler.stop();
        }

        let deadline = tokio::time::Instant::now() + self.grace;
        while !self.tasks.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    forced_terminations = self.tasks.len();
                    warn!(
                        remaining = forced_terminations,
                        "Grace period elapsed, cancelling tier loops"
                    );
                    self.tasks.abort_all();
                    break;
                }
                result = self.tasks.join_next() => {
                    match result {
                        Some(Ok(tier)) => {
                            debug!(tier = %tier, "Tier loop stopped gracefully");
                            graceful_stops += 1;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Tier loop failed during shutdown");
                            forced_terminations += 1;
                        }
                        None => break,
                    }
                }
            }
        }

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(self.timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result
                    && !e.is_cancelled()
                {
                    warn!(error = %e, "Tier loop failed while cancelling");
                }
            }
        })
        .await;

        let stragglers = self.tasks.len();
        if drained.is_err() {
            warn!(
                stragglers,
                timeout_secs = self.timeout.as_secs_f64(),
                "Tier loops still running after shutdown timeout, leaving them behind"
            );
            self.tasks.detach_all();
        }

        let report = ShutdownReport {
            total_loops,
            graceful_stops,
            forced_terminations,
            stragglers,
        };
        info!(
            total = report.total_loops,
            graceful = report.graceful_stops,
            forced = report.forced_terminations,
            stragglers = report.stragglers,
            "Shutdown complete"
        );
        report
    }
}

/// Report from a shutdown operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tier loops running when shutdown started.
    pub total_loops: usize,
    /// Loops that finished within the grace period.
    pub graceful_stops: usize,
    /// Loops aborted after the grace period, or that failed.
    pub forced_terminations: usize,
    /// Aborted loops that had not unwound when the shutdown timeout passed.
    pub stragglers: usize,
}

impl ShutdownReport {
    /// Check if all loops stopped gracefully.
    pub fn all_graceful(&self) -> bool {
        self.forced_terminations == 0 && self.stragglers == 0
    }
}
