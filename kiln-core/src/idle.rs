//! Idle tracking and the watchdog that asks the server to shut down once no
//! request has arrived for the configured window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Time of the most recent inbound request.
#[derive(Debug)]
pub struct ActivityClock {
    origin: Instant,
    last_millis: AtomicU64,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(now, Ordering::Relaxed);
    }

    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    /// Inactivity window after which the service shuts down. Zero disables.
    pub timeout: Duration,
    /// How often the watchdog checks the clock.
    pub poll: Duration,
}

impl IdlePolicy {
    pub const DEFAULT_POLL: Duration = Duration::from_secs(60);

    pub fn from_minutes(minutes: u64) -> Self {
        Self {
            timeout: Duration::from_secs(minutes.saturating_mul(60)),
            poll: Self::DEFAULT_POLL,
        }
    }

    pub fn with_poll(self, poll: Duration) -> Self {
        Self { poll, ..self }
    }

    pub fn enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    pub fn timeout_minutes(&self) -> u64 {
        self.timeout.as_secs() / 60
    }
}

/// Resolves once the clock has been idle for at least `policy.timeout`.
/// Never resolves when the policy is disabled.
pub async fn wait_for_idle(clock: &ActivityClock, policy: IdlePolicy) -> Duration {
    if !policy.enabled() {
        return std::future::pending().await;
    }
    let mut ticker = time::interval_at(Instant::now() + policy.poll, policy.poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let idle = clock.idle();
        if idle >= policy.timeout {
            return idle;
        }
        tracing::trace!(idle_secs = idle.as_secs(), "watchdog tick");
    }
}

/// Spawns the watchdog. It cancels `shutdown` when the idle window elapses
/// and exits early if `shutdown` is cancelled by someone else.
pub fn spawn_watchdog(
    clock: Arc<ActivityClock>,
    policy: IdlePolicy,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    if policy.enabled() {
        tracing::info!(
            timeout_minutes = policy.timeout_minutes(),
            "idle watchdog enabled: auto-shutdown after inactivity"
        );
    } else {
        tracing::info!("idle watchdog disabled");
    }
    tokio::spawn(async move {
        tokio::select! {
            idle = wait_for_idle(&clock, policy) => {
                tracing::warn!(
                    idle_minutes = idle.as_secs() / 60,
                    timeout_minutes = policy.timeout_minutes(),
                    "idle timeout reached, shutting down"
                );
                shutdown.cancel();
            }
            _ = shutdown.cancelled() => {}
        }
    })
}
