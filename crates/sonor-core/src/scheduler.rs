//! Receiver scheduler
//!
//! Receivers are partitioned into contiguous batches and each batch runs
//! as one unit of work on its own worker thread. Ranges never overlap, so
//! workers share nothing mutable beyond the sink. Cancellation is
//! cooperative: the token is polled before each batch is launched and
//! between receivers inside a batch; in-flight receivers always finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::pathfinder::PathFinder;
use crate::sink::PathSink;

/// Poll-only cooperative cancellation flag, cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Run every receiver of the finder's scene through the sink.
///
/// Blocks until all batches complete, the token cancels the run, or the
/// configured join timeout elapses; a timeout is logged, not raised, and
/// results already pushed remain valid.
pub fn run<S: PathSink + 'static>(finder: &PathFinder, sink: Arc<S>, token: &CancellationToken) {
    let receiver_count = finder.scene().receivers().len();
    if receiver_count == 0 {
        return;
    }
    let threads = finder.config().effective_threads();
    let batch_size = receiver_count.div_ceil(threads);

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let mut handles = Vec::new();
    let mut batch_count = 0;
    let mut start = 0;
    while start < receiver_count {
        if token.is_cancelled() {
            break;
        }
        let end = (start + batch_size).min(receiver_count);
        let worker_finder = finder.clone();
        let worker_sink = sink.clone();
        let worker_token = token.clone();
        let worker_done = done_tx.clone();
        debug!(start, end, "launching receiver batch");
        handles.push(std::thread::spawn(move || {
            for receiver_id in start..end {
                if worker_token.is_cancelled() {
                    break;
                }
                worker_finder.compute_receiver(receiver_id, &*worker_sink, &worker_token);
            }
            // Receiver side may be gone after a join timeout
            let _ = worker_done.send(());
        }));
        batch_count += 1;
        start = end;
    }
    drop(done_tx);

    let deadline = finder
        .config()
        .join_timeout_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut completed = 0;
    while completed < batch_count {
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    warn!(
                        completed,
                        total = batch_count,
                        "timeout elapsed before worker pool termination"
                    );
                    return;
                }
                match done_rx.recv_timeout(deadline - now) {
                    Ok(()) => completed += 1,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        warn!(
                            completed,
                            total = batch_count,
                            "timeout elapsed before worker pool termination"
                        );
                        return;
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match done_rx.recv() {
                Ok(()) => completed += 1,
                Err(_) => break,
            },
        }
    }
    for handle in handles {
        let _ = handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_starts_clear() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        // Clones observe the shared flag
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }
}
