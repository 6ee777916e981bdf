//! Helpers shared by the runner, the HPC adapters and the cancellation controller.

use log::{info, warn};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use crate::errors::Result;

/// How long and how often to retry store calls that fail for connectivity reasons.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_wait: Duration,
    pub retry_interval: Duration,
}

impl RetryPolicy {
    pub fn from_minutes(wait_for_healthy_store_minutes: f64) -> Self {
        Self {
            max_wait: Duration::from_secs_f64(wait_for_healthy_store_minutes.max(0.0) * 60.0),
            retry_interval: Duration::from_secs(10),
        }
    }

    /// Fail on the first error.
    pub fn no_retries() -> Self {
        Self {
            max_wait: Duration::ZERO,
            retry_interval: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_minutes(20.0)
    }
}

/// Execute a store call, retrying connectivity failures until `policy.max_wait` elapses.
///
/// Errors that are not connectivity failures are returned immediately.
pub fn send_with_retries<T, F>(mut api_call: F, policy: &RetryPolicy) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let start = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match api_call() {
            Ok(value) => {
                if attempts > 1 {
                    info!("Store reachable again after {} attempts", attempts);
                }
                return Ok(value);
            }
            Err(e) if e.is_connectivity() => {
                if start.elapsed() + policy.retry_interval > policy.max_wait {
                    warn!(
                        "Giving up on store after {} attempts over {:.1}s: {}",
                        attempts,
                        start.elapsed().as_secs_f64(),
                        e
                    );
                    return Err(e);
                }
                warn!(
                    "Store unavailable (attempt {}), retrying in {:?}: {}",
                    attempts, policy.retry_interval, e
                );
                thread::sleep(policy.retry_interval);
            }
            Err(e) => return Err(e),
        }
    }
}

/// A command that runs its argument through the shell, like `bash -c`.
pub fn shell_command() -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg("-c");
    cmd
}

/// Sleep for `duration` in slices of at most `slice`, stopping early when `interrupted`
/// returns true. Returns true if the sleep was interrupted.
pub fn sleep_sliced<F>(duration: Duration, slice: Duration, mut interrupted: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + duration;
    let slice = if slice.is_zero() {
        Duration::from_millis(100)
    } else {
        slice
    };
    loop {
        if interrupted() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(slice.min(deadline - now));
    }
}
