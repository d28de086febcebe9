//! Bounded wait on a background worker thread.
//!
//! The worker is abandoned on expiry, never killed: a fragment stuck in a
//! tight loop holds no revocable yield point, and a forced teardown of a live
//! interpreter is not safe. The surrounding container's process-level kill is
//! the hard backstop. The runner only needs the guarantee that *it* returns
//! promptly.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Run `f` on a fresh thread and wait at most `budget` for it to finish.
///
/// Returns `Some(T)` on completion within the budget, `None` on expiry (the
/// thread keeps running until it finishes on its own) and `None` when the
/// worker panics before sending its result.
pub fn run_with_timeout<F, T>(f: F, budget: Duration) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel::<T>();

    let spawned = thread::Builder::new()
        .name("code-action-worker".to_string())
        .spawn(move || {
            let result = f();
            // Send fails when the receiver gave up waiting; nothing to do.
            let _ = tx.send(result);
        });
    if spawned.is_err() {
        return None;
    }

    match rx.recv_timeout(budget) {
        Ok(result) => Some(result),
        Err(mpsc::RecvTimeoutError::Timeout) => None,
        Err(mpsc::RecvTimeoutError::Disconnected) => None,
    }
}
