//! Cancellable progress tokens for long-running wallet activity.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::watch;

/// Tracks one long-running pass over the chain: either a full rescan or a
/// routine head update, distinguished by which slot on the orchestrator
/// holds the token.
///
/// Progress is a `(sequence, end_sequence)` pair observers can poll.
/// Aborting raises a flag the running task checks between blocks; the
/// aborter then awaits the task's completion signal, so an abort never
/// returns while a store transaction is still being applied.
pub struct ScanState {
    started_at: Instant,
    sequence: AtomicU64,
    end_sequence: AtomicU64,
    aborted: AtomicBool,
    done: watch::Sender<bool>,
}

impl ScanState {
    pub fn new(sequence: u64, end_sequence: u64) -> Self {
        let (done, _) = watch::channel(false);
        ScanState {
            started_at: Instant::now(),
            sequence: AtomicU64::new(sequence),
            end_sequence: AtomicU64::new(end_sequence),
            aborted: AtomicBool::new(false),
            done,
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn end_sequence(&self) -> u64 {
        self.end_sequence.load(Ordering::Acquire)
    }

    pub(crate) fn set_range(&self, sequence: u64, end_sequence: u64) {
        self.sequence.store(sequence, Ordering::Release);
        self.end_sequence.store(end_sequence, Ordering::Release);
    }

    /// Records that all blocks up to `sequence` have been applied.
    pub fn signal(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Resolves the completion signal. Idempotent.
    pub fn signal_complete(&self) {
        self.done.send_replace(true);
    }

    /// Waits until [`ScanState::signal_complete`] has been called.
    pub async fn wait(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|complete| *complete).await;
    }

    /// Raises the abort flag and waits for the running task to settle.
    pub async fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    #[tokio::test]
    async fn abort_waits_for_completion() {
        let state = Arc::new(ScanState::new(0, 10));
        assert!(!state.is_aborted());

        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while !state.is_aborted() {
                    tokio::task::yield_now().await;
                }
                state.signal(4);
                state.signal_complete();
            })
        };

        state.abort().await;
        assert!(state.is_aborted());
        assert_eq!(state.sequence(), 4);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn wait_returns_immediately_once_complete() {
        let state = ScanState::new(3, 9);
        state.signal_complete();
        state.wait().await;
        assert_eq!(state.sequence(), 3);
        assert_eq!(state.end_sequence(), 9);
    }
}
