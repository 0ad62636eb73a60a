//! Hard-deadline wrapper for async operations.
//!
//! `tokio::time::timeout` drops the future it wraps and therefore depends on
//! that future giving up promptly. Some clients block inside `poll` or ignore
//! cancellation, so the guard runs the operation as its own task and only ever
//! waits on the deadline. On expiry the task is aborted and left behind; if it
//! eventually finishes, its result is discarded.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

/// Runs `operation` with a hard deadline.
///
/// Returns the operation's value if it succeeds before `timeout`. An error,
/// a panic, or the deadline firing all produce `fallback` plus a warning.
/// The caller never waits longer than `timeout` (plus scheduling jitter).
pub async fn run_with_timeout<T, E, F>(label: &str, timeout: Duration, fallback: T, operation: F) -> T
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
{
    // Spawned eagerly so the operation makes progress even before we poll.
    let mut handle = tokio::spawn(operation);

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(value))) => value,
        Ok(Ok(Err(e))) => {
            warn!(label, error = %e, "Operation failed, using fallback");
            fallback
        }
        Ok(Err(join_error)) => {
            warn!(label, error = %join_error, "Operation task aborted, using fallback");
            fallback
        }
        Err(_elapsed) => {
            // Request cancellation but do not wait for it to be acknowledged.
            handle.abort();
            warn!(
                label,
                timeout_ms = timeout.as_millis() as u64,
                "Operation timed out, abandoning"
            );
            fallback
        }
    }
}

/// Fire-and-forget: runs `task` in the background under a deadline.
///
/// Failures and timeouts are logged and never reach the caller. The returned
/// handle may be ignored; dropping it does not cancel the task.
pub fn spawn_detached<E, F>(label: &'static str, timeout: Duration, task: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move { run_with_timeout(label, timeout, (), task).await })
}
