// Exponential backoff retry - shared by any fallible async operation
//
// delay(attempt) = min(max_delay, initial_delay * multiplier^(attempt-1)),
// with ±15% random jitter applied to each sleep.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Jitter applied to every computed delay, as a fraction of the delay.
pub const JITTER_FRACTION: f64 = 0.15;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Backoff delay before the retry following `attempt` (1-based),
    /// without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Run `operation` until it succeeds or the policy's attempts are
/// exhausted, sleeping the jittered backoff delay between attempts. The
/// closure receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts => {
                let base = policy.delay_for_attempt(attempt);
                let jitter = rand::thread_rng()
                    .gen_range((1.0 - JITTER_FRACTION)..=(1.0 + JITTER_FRACTION));
                let delay = base.mul_f64(jitter);
                warn!(
                    "{}: attempt {}/{} failed ({}), retrying in {:?}",
                    label, attempt, policy.max_attempts, err, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
