//! Resilience utilities: retry backoff, rate limiting, bounded waits.
//!
//! - [`RetryConfig`]: backoff schedules for transient failures
//! - [`RateLimiter`]: token bucket throttling transfer writes
//! - [`wait_until`] / [`sleep_or_shutdown`]: every wait in the agent is
//!   bounded and observes shutdown, so a stop request is seen within one
//!   poll interval
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use region_agent::resilience::{wait_until, RateLimiter, RateLimitConfig, WaitOutcome};
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await;
//!
//! let (_tx, mut shutdown) = tokio::sync::watch::channel(false);
//! let outcome = wait_until(
//!     || async { Some(()) },
//!     Duration::from_millis(10),
//!     Duration::from_secs(1),
//!     &mut shutdown,
//! )
//! .await;
//! assert_eq!(outcome, WaitOutcome::Ready(()));
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Backoff schedule for retrying a failed operation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts. `usize::MAX` retries forever.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Ceiling for the backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (1.0 = fixed delay).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retry forever with the same delay. Used for reconnecting to an
    /// unreachable source region.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
        }
    }

    /// Infinite retry with exponential backoff from `initial`, capped at
    /// 5 minutes. Used for transfer rescans.
    ///
    /// ```text
    /// Attempt  Delay (initial = 1s)
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 10+      300s
    /// ```
    pub fn daemon(initial: Duration) -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: initial,
            max_delay: Duration::from_secs(300).max(initial),
            backoff_factor: 2.0,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exp = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exp);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    pub fn is_exhausted(&self, attempt: usize) -> bool {
        attempt >= self.max_attempts
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket settings: `refill_rate` tokens per second, at most
/// `burst_size` banked.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 ops/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Acquire a permit, blocking until one is available. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Returns `true` if a permit was available.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}

// =============================================================================
// Bounded waits
// =============================================================================

/// Result of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome<T = ()> {
    /// The condition produced a value.
    Ready(T),
    TimedOut,
    Shutdown,
}

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Sleep for `duration`, returning early with `true` if shutdown is signalled.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if is_shutdown(shutdown) {
        return true;
    }
    tokio::select! {
        biased;
        changed = shutdown.changed() => {
            // A dropped sender means the owner is gone; treat as shutdown.
            changed.is_err() || is_shutdown(shutdown)
        }
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Poll `condition` every `poll` until it yields a value, `timeout`
/// elapses, or shutdown is signalled.
///
/// The condition is evaluated at least once, even with a zero timeout.
pub async fn wait_until<T, F, Fut>(
    mut condition: F,
    poll: Duration,
    timeout: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> WaitOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if is_shutdown(shutdown) {
            return WaitOutcome::Shutdown;
        }
        if let Some(value) = condition().await {
            return WaitOutcome::Ready(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        let nap = poll.min(deadline - now);
        if sleep_or_shutdown(nap, shutdown).await {
            return WaitOutcome::Shutdown;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fixed_backoff() {
        let config = RetryConfig::fixed(Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(50), Duration::from_secs(10));
        assert!(!config.is_exhausted(1_000_000));
    }

    #[test]
    fn test_daemon_backoff_caps() {
        let config = RetryConfig::daemon(Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(300));
        assert_eq!(config.delay_for_attempt(10_000), Duration::from_secs(300));
    }

    #[test]
    fn test_testing_exhausts() {
        let config = RetryConfig::testing();
        assert!(!config.is_exhausted(2));
        assert!(config.is_exhausted(3));
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(10));
    }

    #[test]
    fn test_rate_limiter_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 3,
            refill_rate: 1,
        });
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.config().burst_size, 3);
    }

    #[test]
    fn test_rate_limiter_zero_is_clamped() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 0,
            refill_rate: 0,
        });
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_wait_until_ready() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let outcome = wait_until(
            move || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    (n >= 2).then_some(n)
                }
            },
            Duration::from_millis(1),
            Duration::from_secs(5),
            &mut rx,
        )
        .await;
        assert_eq!(outcome, WaitOutcome::Ready(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let (_tx, mut rx) = watch::channel(false);
        let outcome = wait_until(
            || async { None::<()> },
            Duration::from_millis(5),
            Duration::from_millis(20),
            &mut rx,
        )
        .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_wait_until_observes_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        });
        let outcome = wait_until(
            || async { None::<()> },
            Duration::from_secs(60),
            Duration::from_secs(120),
            &mut rx,
        )
        .await;
        assert_eq!(outcome, WaitOutcome::Shutdown);
    }

    #[tokio::test]
    async fn test_sleep_or_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        assert!(!sleep_or_shutdown(Duration::from_millis(1), &mut rx).await);
        tx.send(true).unwrap();
        assert!(sleep_or_shutdown(Duration::from_secs(60), &mut rx).await);
    }

    #[tokio::test]
    async fn test_sleep_or_shutdown_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(sleep_or_shutdown(Duration::from_secs(60), &mut rx).await);
    }
}
