//! Tier scheduling.
//!
//! One loop per tier: collect, sleep the tier interval, repeat. Sleeping is
//! done in short slices so a stop request is noticed within a second.

mod lifecycle;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use lifecycle::{Application, ShutdownReport};

use crate::Result;
use crate::manager::CollectorManager;
use crate::tier::UpdateTier;

/// Consecutive failed rounds after which the process is asked to shut down.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Longest uninterrupted sleep between stop checks.
pub const SLEEP_SLICE: Duration = Duration::from_secs(1);

/// Work driven by a tier loop.
#[async_trait]
pub trait TierRunner: Send + Sync + 'static {
    async fn collect_tier(&self, tier: UpdateTier) -> Result<()>;

    fn tier_interval(&self, tier: UpdateTier) -> Duration;
}

#[async_trait]
impl TierRunner for Arc<CollectorManager> {
    async fn collect_tier(&self, tier: UpdateTier) -> Result<()> {
        CollectorManager::collect_tier(self, tier).await
    }

    fn tier_interval(&self, tier: UpdateTier) -> Duration {
        self.get_tier_interval(tier)
    }
}

/// Lifecycle state of a tier loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::Running => write!(f, "running"),
            LoopState::Stopping => write!(f, "stopping"),
            LoopState::Stopped => write!(f, "stopped"),
        }
    }
}

/// The perpetual loop for one tier.
pub struct TierScheduler<R> {
    runner: R,
    tier: UpdateTier,
    /// Process-wide shutdown signal. Cancelled here only on escalation.
    shutdown: CancellationToken,
    /// Stop signal for this loop; a child of `shutdown`.
    stop: CancellationToken,
    initial_delay: bool,
    finished: AtomicBool,
}

impl<R: TierRunner> TierScheduler<R> {
    pub fn new(runner: R, tier: UpdateTier, shutdown: CancellationToken) -> Self {
        let stop = shutdown.child_token();
        Self {
            runner,
            tier,
            shutdown,
            stop,
            initial_delay: false,
            finished: AtomicBool::new(false),
        }
    }

    /// Wait one interval before the first round.
    pub fn with_initial_delay(mut self, initial_delay: bool) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn tier(&self) -> UpdateTier {
        self.tier
    }

    pub fn state(&self) -> LoopState {
        if self.finished.load(Ordering::Acquire) {
            LoopState::Stopped
        } else if self.stop.is_cancelled() {
            LoopState::Stopping
        } else {
            LoopState::Running
        }
    }

    /// Ask the loop to exit after its current round or sleep slice.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub async fn run(self: Arc<Self>) {
        let interval = self.runner.tier_interval(self.tier);
        info!(tier = %self.tier, interval_secs = interval.as_secs(), "Tier loop started");

        let mut consecutive_failures = 0u32;
        let mut proceed = !self.initial_delay || self.sleep(interval).await;

        while proceed && !self.stop.is_cancelled() {
            match self.runner.collect_tier(self.tier).await {
                Ok(()) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        tier = %self.tier,
                        error = %e,
                        consecutive_failures,
                        "Tier collection failed"
                    );
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        error!(
                            tier = %self.tier,
                            critical = true,
                            consecutive_failures,
                            "Tier keeps failing, requesting shutdown"
                        );
                        self.shutdown.cancel();
                    }
                }
            }
            proceed = self.sleep(interval).await;
        }

        self.finished.store(true, Ordering::Release);
        info!(tier = %self.tier, "Tier loop stopped");
    }

    /// Sleep for `duration` in slices. Returns `false` if stopped meanwhile.
    async fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.stop.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep((deadline - now).min(SLEEP_SLICE)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::AtomicU32;

    struct CountingRunner {
        rounds: AtomicU32,
        fail: bool,
        interval: Duration,
    }

    impl CountingRunner {
        fn new(fail: bool, interval: Duration) -> Arc<Self> {
            Arc::new(Self {
                rounds: AtomicU32::new(0),
                fail,
                interval,
            })
        }
    }

    #[async_trait]
    impl TierRunner for Arc<CountingRunner> {
        async fn collect_tier(&self, _tier: UpdateTier) -> Result<()> {
            self.rounds.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::other("round failed"))
            } else {
                Ok(())
            }
        }

        fn tier_interval(&self, _tier: UpdateTier) -> Duration {
            self.interval
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_repeats_every_interval() {
        let runner = CountingRunner::new(false, Duration::from_secs(60));
        let token = CancellationToken::new();
        let scheduler = Arc::new(TierScheduler::new(runner.clone(), UpdateTier::Fast, token));
        let handle = tokio::spawn(scheduler.clone().run());

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(runner.rounds.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.state(), LoopState::Running);

        scheduler.stop();
        assert_eq!(scheduler.state(), LoopState::Stopping);
        handle.await.unwrap();
        assert_eq!(scheduler.state(), LoopState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_noticed_within_a_slice() {
        let runner = CountingRunner::new(false, Duration::from_secs(900));
        let scheduler = Arc::new(TierScheduler::new(
            runner,
            UpdateTier::Slow,
            CancellationToken::new(),
        ));
        let handle = tokio::spawn(scheduler.clone().run());

        tokio::time::sleep(Duration::from_secs(10)).await;
        let stopped_at = Instant::now();
        scheduler.stop();
        handle.await.unwrap();
        assert!(Instant::now() - stopped_at <= SLEEP_SLICE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay_skips_first_round() {
        let runner = CountingRunner::new(false, Duration::from_secs(60));
        let scheduler = Arc::new(
            TierScheduler::new(runner.clone(), UpdateTier::Medium, CancellationToken::new())
                .with_initial_delay(true),
        );
        let handle = tokio::spawn(scheduler.clone().run());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runner.rounds.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(runner.rounds.load(Ordering::SeqCst), 1);

        scheduler.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_request_shutdown() {
        let runner = CountingRunner::new(true, Duration::from_secs(1));
        let token = CancellationToken::new();
        let scheduler = Arc::new(TierScheduler::new(
            runner.clone(),
            UpdateTier::Fast,
            token.clone(),
        ));

        tokio::spawn(scheduler.clone().run()).await.unwrap();

        assert!(token.is_cancelled());
        assert_eq!(runner.rounds.load(Ordering::SeqCst), MAX_CONSECUTIVE_FAILURES);
        assert_eq!(scheduler.state(), LoopState::Stopped);
    }
}
