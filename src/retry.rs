//! Retry policy for evaluator calls.
//!
//! RESILIENT mode retries transient provider failures with exponential
//! backoff and then degrades to a failed record; STRICT mode turns any
//! unrecovered failure into an evaluation-wide error. Zombie bookkeeping
//! for fire circle lives with the circle state, not here.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::error::Result;
use crate::evaluation::types::ErrorKind;

/// Retry configuration for a single evaluator call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries after the initial attempt
    pub max_retries: u32,
    /// Base delay used for exponential backoff
    pub base_delay_ms: u64,
    /// Backoff multiplier applied per retry attempt
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 200,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Disable retries entirely.
    pub fn none() -> Self {
        Self::new(0)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt as i32);
        let millis = (self.base_delay_ms as f64 * factor).round().max(0.0) as u64;
        Duration::from_millis(millis)
    }
}

/// Run `op` with retries on transient failures.
///
/// Only error kinds the provider could plausibly recover from (network,
/// HTTP status, timeout) are retried; parse failures and refusals are
/// deterministic and returned immediately.
pub async fn with_retries<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let kind = ErrorKind::from_error(&error);
                if attempt >= config.max_retries || !kind.is_retryable() {
                    return Err(error);
                }
                let delay = config.delay_for_attempt(attempt);
                debug!(attempt, kind = %kind, delay_ms = delay.as_millis() as u64, "retrying evaluator call");
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
