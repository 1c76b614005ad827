//! Bounded polling and fixed-interval retry helpers
//!
//! Every readiness check in the crate goes through [`wait_for`] instead of
//! hand-rolling its own poll loop: a fixed poll interval, a hard deadline,
//! and a distinct timeout error instead of hanging. One-shot operations that
//! may fail transiently use [`retry_fixed`].

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::Error;

/// Default poll interval for readiness checks (2 seconds)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default deadline for readiness checks (2 minutes)
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(120);

/// Bounds for a polling loop: how often to poll and how long to keep trying.
#[derive(Clone, Copy, Debug)]
pub struct PollConfig {
    /// Hard deadline for the whole wait
    pub timeout: Duration,
    /// Time between poll attempts
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_POLL_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl PollConfig {
    /// Create a config with the given deadline and the default interval
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// Poll until a condition is met or the deadline expires.
///
/// The poll function returns `Ok(Some(T))` when ready, `Ok(None)` to keep
/// waiting, or `Err(msg)` for a transient poll failure (logged and retried).
/// Expiring the deadline yields [`Error::Timeout`] naming what was waited
/// for, never an indefinite hang.
pub async fn wait_for<T, F, Fut>(
    description: &str,
    config: &PollConfig,
    mut poll_fn: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, String>>,
{
    let start = Instant::now();

    // Always poll at least once, even with a zero timeout.
    loop {
        match poll_fn().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {
                debug!(target = %description, "not ready yet, polling again");
            }
            Err(e) => {
                warn!(target = %description, error = %e, "poll attempt failed, retrying");
            }
        }

        if start.elapsed() > config.timeout {
            return Err(Error::Timeout {
                what: description.to_string(),
                elapsed: start.elapsed(),
            });
        }

        tokio::time::sleep(config.interval).await;
    }
}

/// Execute an async operation up to `max_attempts` times with a fixed
/// interval between attempts.
///
/// Exhausting the attempts returns the last error; the caller decides
/// whether that escalates to fatal.
pub async fn retry_fixed<F, Fut, T, E>(
    max_attempts: u32,
    interval: Duration,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    debug_assert!(max_attempts > 0);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "operation failed after max attempts"
                    );
                    return Err(e);
                }

                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "operation failed, retrying"
                );

                tokio::time::sleep(interval).await;
            }
        }
    }
}
