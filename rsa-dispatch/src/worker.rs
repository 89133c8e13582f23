//! Handoff of adapter work to other threads.
//!
//! Async adapter calls run in place, with panics caught at the await point.
//! Blocking SDK calls run on Tokio's blocking pool. Browser-session work runs
//! on a dedicated named thread that owns a single-threaded runtime, so
//! everything touching that session stays on one thread. In both cases the
//! caller awaits the result without blocking other dispatches, and a worker
//! that panics or overruns its time budget becomes a typed error.
//!
//! ```text
//! dispatcher ──catch_unwind────▶ adapter future (same task)
//! dispatcher ──spawn_blocking──▶ blocking pool ──JoinHandle──▶ dispatcher
//! dispatcher ──thread::spawn───▶ session thread (current_thread rt) ──oneshot──▶ dispatcher
//! ```

use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::broker::BrokerId;
use crate::error::DispatchError;

/// Await `fut` in place, bounded by `timeout`, turning a panic into an error.
pub async fn run_guarded<T, Fut>(
    broker: BrokerId,
    operation: &'static str,
    timeout: Duration,
    fut: Fut,
) -> Result<T, DispatchError>
where
    Fut: Future<Output = T>,
{
    match tokio::time::timeout(timeout, AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(payload)) => {
            let reason = panic_message(payload);
            tracing::error!(broker = %broker, operation, reason = %reason, "Adapter call panicked");
            Err(DispatchError::Worker {
                broker,
                operation,
                reason,
            })
        }
        Err(_) => {
            tracing::warn!(broker = %broker, operation, "Adapter call timed out");
            Err(DispatchError::Timeout {
                broker,
                operation,
                seconds: timeout.as_secs(),
            })
        }
    }
}

/// Run `f` on the blocking pool, bounded by `timeout`.
pub async fn run_blocking<T, F>(
    broker: BrokerId,
    operation: &'static str,
    timeout: Duration,
    f: F,
) -> Result<T, DispatchError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join_error)) => {
            let reason = if join_error.is_panic() {
                panic_message(join_error.into_panic())
            } else {
                join_error.to_string()
            };
            tracing::error!(broker = %broker, operation, reason = %reason, "Blocking worker failed");
            Err(DispatchError::Worker {
                broker,
                operation,
                reason,
            })
        }
        Err(_) => {
            // The pool thread cannot be interrupted and finishes on its own
            tracing::warn!(broker = %broker, operation, "Blocking worker timed out");
            Err(DispatchError::Timeout {
                broker,
                operation,
                seconds: timeout.as_secs(),
            })
        }
    }
}

/// Run the future built by `f` on a dedicated thread with its own runtime.
///
/// `f` is called on the new thread, so the future it returns does not need
/// to be `Send`.
pub async fn run_on_session_thread<T, F, Fut>(
    broker: BrokerId,
    operation: &'static str,
    timeout: Duration,
    f: F,
) -> Result<T, DispatchError>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel::<Result<T, String>>();

    let spawned = std::thread::Builder::new()
        .name(format!("rsa-{broker}-session"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = tx.send(Err(format!("failed to start session runtime: {e}")));
                    return;
                }
            };
            let value = runtime.block_on(f());
            let _ = tx.send(Ok(value));
        });

    if let Err(e) = spawned {
        return Err(DispatchError::Worker {
            broker,
            operation,
            reason: format!("failed to spawn session thread: {e}"),
        });
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(reason))) => Err(DispatchError::Worker {
            broker,
            operation,
            reason,
        }),
        Ok(Err(_)) => {
            tracing::error!(broker = %broker, operation, "Session thread exited without a result");
            Err(DispatchError::Worker {
                broker,
                operation,
                reason: "session thread terminated unexpectedly".into(),
            })
        }
        Err(_) => {
            tracing::warn!(broker = %broker, operation, "Session thread timed out");
            Err(DispatchError::Timeout {
                broker,
                operation,
                seconds: timeout.as_secs(),
            })
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
