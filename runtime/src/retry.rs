//! Exponential backoff for transient failures.
//!
//! [`RetryPolicy`] spaces out outbox publication attempts and consumer
//! requeues ([`RetryPolicy::delay_for_attempt`]); [`retry_while`] re-runs a
//! startup step such as connecting to the service database until it succeeds
//! or fails for good.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Exponential backoff configuration.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one before giving up
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// `initial_delay * multiplier ^ attempt`, capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = attempt.min(64) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }

        Duration::from_millis(delay_ms as u64)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub const fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
        }
    }
}

/// Run `operation` until it succeeds, fails with an error `is_transient`
/// rejects, or `max_retries` retries are used up.
///
/// ```rust
/// use loyalty_runtime::retry::{RetryPolicy, retry_while};
///
/// # async fn example() -> Result<(), String> {
/// let migrated = retry_while(
///     RetryPolicy::default(),
///     "migrate",
///     || async { Ok::<_, String>(4) },
///     |err: &String| err.starts_with("connection"),
/// )
/// .await?;
/// assert_eq!(migrated, 4);
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns the first permanent error, or the error of the final attempt.
pub async fn retry_while<F, Fut, T, E, P>(
    policy: RetryPolicy,
    step: &str,
    mut operation: F,
    is_transient: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retries = 0;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    tracing::info!(step, retries, "Succeeded after retrying");
                }
                return Ok(value);
            },
            Err(err) => err,
        };

        if !is_transient(&err) || retries >= policy.max_retries {
            tracing::error!(step, retries, error = %err, "Giving up");
            return Err(err);
        }

        let delay = policy.delay_for_attempt(retries);
        tracing::warn!(step, retries, delay_ms = delay.as_millis(), error = %err, "Retrying");
        sleep(delay).await;
        retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_retries: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(1))
            .build()
    }

    #[test]
    fn delays_double_from_the_initial_delay() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(250))
            .max_delay(Duration::from_secs(60))
            .build();

        let delays: Vec<_> = (0..4).map(|n| policy.delay_for_attempt(n)).collect();
        assert_eq!(
            delays,
            [250, 500, 1000, 2000].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn delays_never_exceed_the_cap() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(5))
            .max_delay(Duration::from_secs(300))
            .build();
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = &AtomicU32::new(0);
        let result = retry_while(
            quick(3),
            "connect",
            || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err("connection refused".to_string()),
                    _ => Ok("pool"),
                }
            },
            |err: &String| err.starts_with("connection"),
        )
        .await;

        assert_eq!(result, Ok("pool"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_returns_at_once() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry_while(
            quick(5),
            "migrate",
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("syntax error at or near \"TABLE\"".to_string())
            },
            |err: &String| err.starts_with("connection"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn last_error_is_returned_when_retries_run_out() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry_while(
            quick(2),
            "connect",
            || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(format!("connection reset ({n})"))
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(result, Err("connection reset (2)".to_string()));
    }
}
