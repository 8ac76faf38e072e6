//! Waiting with exponential backoff and jitter.
//!
//! Every asynchronous transition the installer observes (CRD establishment,
//! pod readiness, custom resource install status) goes through
//! [`wait_for`]. The check is called immediately, then again with
//! exponentially growing, jittered spacing until it succeeds, returns an
//! error marked with [`Error::permanent`], runs out of time, or the caller
//! cancels.
//!
//! # Example
//!
//! ```ignore
//! use trident_common::retry::{wait_for, BackoffConfig};
//!
//! let crd = wait_for(
//!     &BackoffConfig::polling(K8S_TIMEOUT),
//!     &cancel,
//!     "wait for CRD established",
//!     || async { check_established(&client).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, K8S_TIMEOUT};

/// Configuration for exponential backoff.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the second check
    pub initial_interval: Duration,
    /// Growth factor applied to the delay after every failed check
    pub multiplier: f64,
    /// Upper bound for a single delay
    pub max_interval: Duration,
    /// Total time after which the wait gives up
    pub max_elapsed: Duration,
    /// Spread of the jitter: 0.1 means +/-10% of the delay
    pub randomization_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: K8S_TIMEOUT,
            randomization_factor: 0.5,
        }
    }
}

impl BackoffConfig {
    /// Backoff used when polling cluster state: 5s growing by 1.414 up to 15s
    pub fn polling(timeout: Duration) -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            multiplier: 1.414,
            max_interval: Duration::from_secs(15),
            max_elapsed: timeout,
            randomization_factor: 0.1,
        }
    }

    /// Same config with a different total time budget
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    fn jittered(&self, interval: Duration) -> Duration {
        let spread = self.randomization_factor.clamp(0.0, 1.0);
        if spread == 0.0 {
            return interval;
        }
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        Duration::from_secs_f64(interval.as_secs_f64() * factor)
    }

    fn next_interval(&self, interval: Duration) -> Duration {
        Duration::from_secs_f64(
            (interval.as_secs_f64() * self.multiplier).min(self.max_interval.as_secs_f64()),
        )
    }
}

/// Call `check` until it succeeds, with exponential backoff between calls.
///
/// Returns the check's value on success. A check error wrapped with
/// [`Error::permanent`] stops the loop at once and is returned unwrapped.
/// Once `max_elapsed` has passed the loop fails with [`Error::Timeout`]
/// carrying the last check error; the final sleep is clipped to the
/// remaining budget, so the call returns no later than `max_elapsed` plus
/// one check. Cancelling `cancel` interrupts a sleep and fails with
/// [`Error::Cancelled`].
pub async fn wait_for<F, Fut, T>(
    config: &BackoffConfig,
    cancel: &CancellationToken,
    operation: &str,
    mut check: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let start = Instant::now();
    let mut interval = config.initial_interval;
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(operation));
        }

        attempt += 1;
        let err = match check().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = %operation, attempt, "Condition met");
                }
                return Ok(value);
            }
            Err(Error::Permanent { source }) => {
                warn!(
                    operation = %operation,
                    attempt,
                    error = %source,
                    "Permanent failure, not retrying"
                );
                return Err(*source);
            }
            Err(e) => e,
        };

        let elapsed = start.elapsed();
        if elapsed >= config.max_elapsed {
            warn!(
                operation = %operation,
                attempt,
                elapsed_secs = elapsed.as_secs_f64(),
                error = %err,
                "Giving up after time budget"
            );
            return Err(Error::Timeout {
                operation: operation.to_string(),
                elapsed,
                last_error: Box::new(err),
            });
        }

        let delay = config
            .jittered(interval)
            .min(config.max_elapsed - elapsed);

        debug!(
            operation = %operation,
            attempt,
            error = %err,
            delay_ms = delay.as_millis(),
            "Condition not met, waiting"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(operation)),
            _ = tokio::time::sleep(delay) => {}
        }

        interval = config.next_interval(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_elapsed: Duration) -> BackoffConfig {
        BackoffConfig {
            initial_interval: Duration::from_millis(1),
            multiplier: 2.0,
            max_interval: Duration::from_millis(10),
            max_elapsed,
            randomization_factor: 0.1,
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let cancel = CancellationToken::new();
        let result = wait_for(&fast(Duration::from_secs(1)), &cancel, "op", || async {
            Ok::<_, Error>(42)
        })
        .await;
        assert_eq!(result.ok(), Some(42));
    }

    #[tokio::test]
    async fn test_succeeds_on_nth_call_after_exactly_n_calls() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result = wait_for(&fast(Duration::from_secs(5)), &cancel, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(Error::not_ready("pod", "not yet"))
                } else {
                    Ok("ready")
                }
            }
        })
        .await;

        assert_eq!(result.ok(), Some("ready"));
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_times_out_wrapping_last_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();
        let budget = Duration::from_millis(50);
        let started = std::time::Instant::now();

        let result: Result<(), Error> = wait_for(&fast(budget), &cancel, "wait for CRD", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                Err(Error::not_ready("CRD", format!("attempt {n}")))
            }
        })
        .await;

        // Checks are instant, so the budget plus scheduling slack bounds the wait
        assert!(started.elapsed() < budget + Duration::from_millis(500));
        let last = count.load(Ordering::SeqCst) - 1;
        match result {
            Err(Error::Timeout {
                operation,
                last_error,
                ..
            }) => {
                assert_eq!(operation, "wait for CRD");
                assert!(last_error.to_string().contains(&format!("attempt {last}")));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result: Result<(), Error> = wait_for(&fast(Duration::from_secs(5)), &cancel, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::permanent(Error::TerminalState {
                    status: "Error".to_string(),
                    message: "operator gave up".to_string(),
                }))
            }
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::TerminalState { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let config = BackoffConfig {
            initial_interval: Duration::from_secs(30),
            ..fast(Duration::from_secs(60))
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<(), Error> = wait_for(&config, &cancel, "wait for pod", || async {
            Err(Error::not_ready("pod", "pending"))
        })
        .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(result, Err(Error::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_already_cancelled_never_checks() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), Error> = wait_for(&fast(Duration::from_secs(1)), &cancel, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(matches!(result, Err(Error::Cancelled { .. })));
    }

    #[test]
    fn test_interval_growth_is_capped() {
        let config = BackoffConfig::polling(K8S_TIMEOUT);
        let mut interval = config.initial_interval;
        for _ in 0..10 {
            interval = config.next_interval(interval);
        }
        assert_eq!(interval, Duration::from_secs(15));
    }

    #[test]
    fn test_jitter_stays_within_randomization_factor() {
        let config = BackoffConfig::polling(K8S_TIMEOUT);
        for _ in 0..100 {
            let d = config.jittered(Duration::from_secs(10));
            assert!(d >= Duration::from_millis(8_900) && d <= Duration::from_millis(11_100));
        }
    }
}
