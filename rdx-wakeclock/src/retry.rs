//! Bounded retry for transient collaborator failures.
//!
//! The interval between attempts is fixed; `attempts` is the total number of
//! tries, never less than one.

use crate::config::RetryConfig;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::warn;

/// Retries a blocking operation, sleeping the current thread between attempts.
/// Only errors for which `transient` returns true are retried.
pub(crate) fn blocking<T, E: Display>(
    policy: RetryConfig,
    what: &str,
    transient: impl Fn(&E) -> bool,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && transient(&err) => {
                warn!(%err, attempt, attempts, "{} failed, retrying", what);
                attempt += 1;
                pause(policy.interval());
            }
            Err(err) => return Err(err),
        }
    }
}

/// Sleeps the current thread. On a multi-threaded tokio runtime the worker
/// first hands its other tasks off, so a waiting alarm does not stall the rest.
fn pause(interval: Duration) {
    match Handle::try_current() {
        Ok(runtime) if runtime.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| std::thread::sleep(interval))
        }
        _ => std::thread::sleep(interval),
    }
}

/// Async counterpart of [`blocking`]; waits on the tokio timer between attempts.
pub(crate) async fn backoff<T, E, F, Fut>(
    policy: RetryConfig,
    what: &str,
    transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && transient(&err) => {
                warn!(%err, attempt, attempts, "{} failed, retrying", what);
                attempt += 1;
                tokio::time::sleep(policy.interval()).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const FAST: RetryConfig = RetryConfig {
        attempts: 3,
        interval_ms: 0,
    };

    #[test]
    fn stops_after_the_configured_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), String> = blocking(FAST, "op", |_| true, || {
            calls.set(calls.get() + 1);
            Err("down".to_string())
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), String> = blocking(FAST, "op", |_| false, || {
            calls.set(calls.get() + 1);
            Err("corrupt".to_string())
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_retry_runs_on_a_runtime_worker() {
        let policy = RetryConfig {
            attempts: 2,
            interval_ms: 1,
        };
        let mut calls = 0;
        let result: Result<u32, String> = blocking(policy, "op", |_| true, || {
            calls += 1;
            if calls == 1 {
                Err("down".to_string())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn async_retry_recovers() {
        let mut remaining = 2;
        let result: Result<u32, String> = backoff(FAST, "op", |_| true, || {
            let outcome = if remaining == 0 {
                Ok(7)
            } else {
                remaining -= 1;
                Err("down".to_string())
            };
            async move { outcome }
        })
        .await;
        assert_eq!(result, Ok(7));
    }
}
