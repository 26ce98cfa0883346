//! Polling with exponential backoff.

use std::future::Future;
use std::time::Duration;

use dustlink_core::config::PollSettings;
use dustlink_core::{Error, Result};
use tracing::debug;

/// Outcome of a single poll attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus<T> {
    Ready(T),
    Pending,
}

/// Delay schedule: `min(initial * factor^attempt, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Backoff {
    pub fn from_settings(settings: &PollSettings) -> Self {
        Self {
            initial: Duration::from_millis(settings.initial_delay_ms),
            max: Duration::from_millis(settings.max_delay_ms),
            factor: settings.backoff_factor.max(1.0),
        }
    }

    /// Delay to wait after attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.initial.as_millis() as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_settings(&PollSettings::default())
    }
}

/// Call `attempt_fn` until it reports `Ready`, an error, or `max_attempts`
/// attempts have been made. Sleeps between attempts, never after the last.
pub async fn poll_until<T, F, Fut>(
    step: u8,
    max_attempts: u32,
    backoff: &Backoff,
    mut attempt_fn: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollStatus<T>>>,
{
    for attempt in 0..max_attempts {
        if let PollStatus::Ready(value) = attempt_fn(attempt).await? {
            return Ok(value);
        }

        if attempt + 1 < max_attempts {
            let delay = backoff.delay(attempt);
            debug!(
                step,
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Not ready yet, waiting before retry"
            );
            tokio::time::sleep(delay).await;
        }
    }

    Err(Error::PollExhausted {
        step,
        attempts: max_attempts,
    })
}
