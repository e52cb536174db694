// Retry strategy implementation with exponential backoff and jitter

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Default number of attempts for job-store write-backs
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Calculate the delay before the next retry attempt
    /// Returns None once the attempt budget is spent
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Get the maximum number of attempts
    fn max_attempts(&self) -> u32;

    /// Check if more retries are allowed
    fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts()
    }
}

/// Exponential backoff retry strategy with jitter
/// Sequence with a 50ms base: 50ms, 150ms, 450ms, 1.35s, ... capped
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    jitter_factor: f64,
    max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 50,
            max_delay_ms: 5_000,
            jitter_factor: 0.1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new exponential backoff strategy with custom values
    pub fn with_config(
        base_delay_ms: u64,
        max_delay_ms: u64,
        jitter_factor: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Calculate exponential delay without jitter
    fn calculate_base_delay(&self, attempt: u32) -> u64 {
        // Formula: base * 3^attempt, capped at max_delay
        let factor = 3_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Add random jitter so stalled write-backs do not retry in lockstep
    fn add_jitter_ms(&self, base_delay_ms: u64) -> u64 {
        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        if jitter_range_ms == 0 {
            return base_delay_ms;
        }

        let mut rng = rand::thread_rng();
        base_delay_ms + rng.gen_range(0..=jitter_range_ms)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }

        let delay_ms = self.add_jitter_ms(self.calculate_base_delay(attempt));
        Some(Duration::from_millis(delay_ms))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Run `operation` until it succeeds or the strategy gives up
///
/// The last error is returned when every attempt failed.
pub async fn retry_with<S, F, Fut, T, E>(strategy: &S, mut operation: F) -> Result<T, E>
where
    S: RetryStrategy + ?Sized,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => match strategy.next_delay(attempt) {
                Some(delay) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = strategy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(e),
            },
        }
    }
}
