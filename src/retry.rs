//! Retry logic with exponential backoff for speed tests.
//!
//! Attempts and the sleeps between them both race a stop signal, so a
//! shutdown request never waits out a backoff or starts another attempt.

use crate::resilience::NetworkQuality;
use log::{debug, warn};
use rand::Rng;
use std::error::Error;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Default number of retry attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (in milliseconds).
pub const DEFAULT_BASE_DELAY_MS: u64 = 5000;

/// Default growth per attempt.
pub const DEFAULT_MULTIPLIER: f64 = 1.5;

/// Default upper bound of the random jitter (in milliseconds).
pub const DEFAULT_JITTER_MS: u64 = 1000;

/// Maximum delay cap for exponential backoff (in milliseconds).
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Random jitter added to each delay, up to this many milliseconds.
    pub jitter_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            jitter_ms: DEFAULT_JITTER_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), without jitter.
    ///
    /// `base * multiplier^(attempt - 1)`, with the base doubled on poor
    /// networks.
    pub fn base_delay_for_attempt(
        &self,
        attempt: u32,
        quality: NetworkQuality,
    ) -> f64 {
        let mut base = self.base_delay_ms as f64;
        if quality == NetworkQuality::Poor {
            base *= 2.0;
        }

        let exponent = attempt.saturating_sub(1) as i32;
        base * self.multiplier.powi(exponent)
    }

    /// Delay before retry number `attempt` (1-based), jitter included and
    /// capped at `max_delay_ms`.
    pub fn delay_for_attempt(
        &self,
        attempt: u32,
        quality: NetworkQuality,
    ) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.jitter_ms) as f64
        } else {
            0.0
        };

        let delay_ms = (self.base_delay_for_attempt(attempt, quality) + jitter)
            .min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryResult<T> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed after all retries.
    Failed {
        /// The last error that occurred.
        last_error: Box<dyn Error + Send + Sync>,
        /// Number of attempts made.
        attempts: u32,
    },
    /// A stop was requested before the operation could finish.
    Aborted {
        /// Number of attempts started.
        attempts: u32,
    },
}

/// Resolves once the stop flag is set, or never if the sender is gone.
pub async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Execute an async operation with retry logic and exponential backoff.
///
/// `f` receives the 1-based attempt number. A stop request observed while
/// an attempt is in flight or during a backoff sleep ends the loop with
/// [`RetryResult::Aborted`]; the in-flight attempt is dropped.
pub async fn retry_async<T, E, F, Fut>(
    config: &RetryConfig,
    quality: NetworkQuality,
    operation_name: &str,
    stop: &mut watch::Receiver<bool>,
    mut f: F,
) -> RetryResult<T>
where
    E: Error + Send + Sync + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let total_attempts = config.max_retries + 1;
    let mut last_error: Option<Box<dyn Error + Send + Sync>> = None;

    for attempt in 1..=total_attempts {
        if *stop.borrow() {
            return RetryResult::Aborted { attempts: attempt - 1 };
        }

        if attempt > 1 {
            let delay = config.delay_for_attempt(attempt - 1, quality);
            debug!(
                "{}: Retry attempt {}/{} after {:?} delay",
                operation_name,
                attempt - 1,
                config.max_retries,
                delay
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_for_stop(stop) => {
                    debug!("{}: Stop requested during backoff", operation_name);
                    return RetryResult::Aborted { attempts: attempt - 1 };
                }
            }
        }

        let result = tokio::select! {
            result = f(attempt) => result,
            _ = wait_for_stop(stop) => {
                debug!("{}: Stop requested during attempt {}", operation_name, attempt);
                return RetryResult::Aborted { attempts: attempt };
            }
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{}: Succeeded on attempt {}", operation_name, attempt);
                }
                return RetryResult::Success(value);
            }
            Err(e) => {
                if attempt < total_attempts {
                    warn!("{}: Attempt {} failed: {}", operation_name, attempt, e);
                } else {
                    warn!(
                        "{}: All {} attempts failed. Last error: {}",
                        operation_name, total_attempts, e
                    );
                }
                last_error = Some(Box::new(e));
            }
        }
    }

    match last_error {
        Some(last_error) => {
            RetryResult::Failed { last_error, attempts: total_attempts }
        }
        None => RetryResult::Aborted { attempts: 0 },
    }
}
