//! Deadline-bounded host queries.

use crossbeam_channel::RecvTimeoutError;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Run `query` on a helper thread and wait at most `timeout` for its result.
///
/// Returns `None` if the deadline passes, the thread cannot be spawned, or
/// the query panics. A query that overruns keeps running detached; its
/// result is discarded.
pub fn run_bounded<T, F>(label: &str, timeout: Duration, query: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(1);

    let spawned = thread::Builder::new()
        .name(format!("query-{}", label))
        .spawn(move || {
            let _ = tx.send(query());
        });

    if let Err(e) = spawned {
        warn!("Could not spawn {} query thread: {}", label, e);
        return None;
    }

    match rx.recv_timeout(timeout) {
        Ok(value) => Some(value),
        Err(RecvTimeoutError::Timeout) => {
            warn!("{} query timed out after {:?}", label, timeout);
            None
        }
        Err(RecvTimeoutError::Disconnected) => {
            warn!("{} query thread exited without a result", label);
            None
        }
    }
}
