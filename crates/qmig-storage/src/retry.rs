use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Attempt budget and backoff shared by source fetches and target writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_step: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): proportional to the attempt number, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff_step
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails non-retryably, or the attempt budget is spent.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, C>(&self, mut op: F, classify: C) -> Result<T, Retried<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDisposition,
        E: fmt::Display,
    {
        let budget = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if classify(&error) == RetryDisposition::NonRetryable {
                        return Err(Retried {
                            attempts: attempt,
                            exhausted: false,
                            error,
                        });
                    }
                    if attempt >= budget {
                        return Err(Retried {
                            attempts: attempt,
                            exhausted: true,
                            error,
                        });
                    }
                    let delay = self.delay_for_attempt(attempt);
                    warn!(attempt, budget, delay_ms = delay.as_millis() as u64, %error, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Final error of a retried operation.
#[derive(Debug)]
pub struct Retried<E> {
    pub attempts: u32,
    /// True when every attempt failed retryably; false when a non-retryable error stopped early.
    pub exhausted: bool,
    pub error: E,
}

impl<E: fmt::Display> fmt::Display for Retried<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempt(s))", self.error, self.attempts)
    }
}

impl<E> std::error::Error for Retried<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
