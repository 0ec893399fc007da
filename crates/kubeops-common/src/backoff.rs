//! Exponential backoff with jitter.
//!
//! [`BackoffPolicy`] is a stateful retry counter: every call to
//! [`BackoffPolicy::wait_on_error`] bumps the counter and sleeps for
//! `policy(retries)`. The default policy is `min(2^retries, cap)` seconds plus
//! a random jitter in `[0, jitter)` so that replicas recovering from the same
//! API outage do not reconnect in lockstep.
//!
//! # Example
//!
//! ```ignore
//! use kubeops_common::backoff::{BackoffConfig, BackoffPolicy, WaitOutcome};
//!
//! let backoff = BackoffPolicy::new(&BackoffConfig::default());
//! if backoff.wait_on_error(&err, &token).await == WaitOutcome::Cancelled {
//!     return;
//! }
//! ```

use std::fmt::Display;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for the exponential backoff applied after failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Upper bound of the exponential part of the delay
    pub max_delay: Duration,
    /// Random jitter window added on top of the exponential delay
    pub jitter: Duration,
    /// Quiet period after which a watcher clears its retry counter
    pub stability_window: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_delay: Duration::from_secs(60),
            jitter: Duration::from_millis(1000),
            stability_window: Duration::from_secs(30),
        }
    }
}

/// Result of a cancellable backoff wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The full delay elapsed
    Elapsed,
    /// The token was cancelled before the delay elapsed
    Cancelled,
}

type DelayFn = dyn Fn(u32) -> Duration + Send + Sync;

/// Stateful exponential backoff.
pub struct BackoffPolicy {
    retries: AtomicU32,
    policy: Arc<DelayFn>,
}

impl BackoffPolicy {
    /// Create a policy using `min(2^retries, max_delay) + jitter`
    pub fn new(config: &BackoffConfig) -> Self {
        let max_delay = config.max_delay;
        let jitter = config.jitter;
        Self::with_policy(move |retries| exponential_delay(retries, max_delay, jitter))
    }

    /// Create a policy with a custom delay function
    pub fn with_policy<F>(policy: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self {
            retries: AtomicU32::new(0),
            policy: Arc::new(policy),
        }
    }

    /// Number of consecutive failures since the last clear
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Delay the policy prescribes for the given retry count
    pub fn delay_for(&self, retries: u32) -> Duration {
        (self.policy)(retries)
    }

    /// Reset the retry counter
    pub fn clear(&self) {
        self.retries.store(0, Ordering::SeqCst);
    }

    /// Record a failure and sleep for the resulting delay.
    ///
    /// Returns [`WaitOutcome::Cancelled`] as soon as `token` is cancelled.
    pub async fn wait_on_error<E: Display + ?Sized>(
        &self,
        error: &E,
        token: &CancellationToken,
    ) -> WaitOutcome {
        let retries = self
            .retries
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        let delay = self.delay_for(retries);

        warn!(
            error = %error,
            retries = retries,
            delay_ms = delay.as_millis() as u64,
            "Backing off before retry"
        );

        tokio::select! {
            _ = token.cancelled() => WaitOutcome::Cancelled,
            _ = tokio::time::sleep(delay) => WaitOutcome::Elapsed,
        }
    }
}

impl std::fmt::Debug for BackoffPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffPolicy")
            .field("retries", &self.retries())
            .finish_non_exhaustive()
    }
}

/// `min(2^retries, max_delay)` plus a random jitter in `[0, jitter)`
pub fn exponential_delay(retries: u32, max_delay: Duration, jitter: Duration) -> Duration {
    let exp_secs = 2u64.saturating_pow(retries);
    let base = Duration::from_secs(exp_secs).min(max_delay);

    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}
