use crate::cancel::CancelToken;
use crate::config::RetryPolicy;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff schedule derived from a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Cancelled,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Total attempts allowed: the first try plus `max_retries`.
    pub fn max_attempts(&self) -> u32 {
        self.policy.max_retries.saturating_add(1)
    }

    pub fn has_attempts_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    /// Delay before retry `retry_index` (0-based):
    /// `retry_delay * backoff_multiplier^retry_index`.
    pub fn delay(&self, retry_index: u32) -> Duration {
        let factor = self
            .policy
            .backoff_multiplier
            .powi(i32::try_from(retry_index).unwrap_or(i32::MAX));
        let nanos = (self.policy.retry_delay().as_nanos() as f64 * factor).round();
        if nanos.is_finite() && nanos < u64::MAX as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            Duration::MAX
        }
    }

    /// Sleeps for the retry delay unless the token is cancelled first.
    pub async fn wait(&self, retry_index: u32, cancel: &CancelToken) -> WaitOutcome {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        let delay = self.delay(retry_index);
        debug!("backoff retry_index={retry_index} delay_ms={}", delay.as_millis());
        tokio::select! {
            _ = tokio::time::sleep(delay) => WaitOutcome::Elapsed,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        }
    }
}
