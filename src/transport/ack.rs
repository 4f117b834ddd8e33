//! Acknowledgement tracking for FWD frames.
//!
//! A writer registers a fresh sequence number, transmits a frame carrying it
//! and suspends until the remote's ACK resolves that sequence.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::core::{Error, Result};

struct AckState {
    next_seq: u16,
    waiters: HashMap<u16, oneshot::Sender<()>>,
    stopped: bool,
}

/// Pending ACKs of one transport.
pub struct AckWaiter {
    state: Mutex<AckState>,
}

impl Default for AckWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl AckWaiter {
    /// Create a waiter whose sequence numbers start at a random value.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AckState {
                next_seq: rand::random(),
                waiters: HashMap::new(),
                stopped: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AckState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a sequence, run `action` with it and wait for [`done`](Self::done).
    ///
    /// Dropping the returned future removes the pending entry, so an
    /// enclosing timeout cancels the wait cleanly.
    pub async fn wait<F, Fut>(&self, action: F) -> Result<()>
    where
        F: FnOnce(u16) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let (seq, rx) = {
            let mut state = self.lock();
            if state.stopped {
                return Err(Error::ClosedPipe);
            }
            let seq = state.next_seq;
            state.next_seq = seq.wrapping_add(1);
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(seq, tx);
            (seq, rx)
        };
        let _entry = PendingEntry { waiter: self, seq };

        action(seq).await?;
        rx.await.map_err(|_| Error::ClosedPipe)
    }

    /// Resolve `seq`. Unknown sequences are ignored.
    pub fn done(&self, seq: u16) {
        if let Some(tx) = self.lock().waiters.remove(&seq) {
            let _ = tx.send(());
        }
    }

    /// Fail every pending and future wait with [`Error::ClosedPipe`].
    pub fn stop_all(&self) {
        let mut state = self.lock();
        state.stopped = true;
        // Dropping the senders wakes the receivers with an error.
        state.waiters.clear();
    }

    /// Number of outstanding waits.
    pub fn pending(&self) -> usize {
        self.lock().waiters.len()
    }
}

struct PendingEntry<'a> {
    waiter: &'a AckWaiter,
    seq: u16,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.waiter.lock().waiters.remove(&self.seq);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_wait_resolved_by_done() {
        let waiter = Arc::new(AckWaiter::new());
        let (seq_tx, seq_rx) = oneshot::channel();

        let w = waiter.clone();
        let handle = tokio::spawn(async move {
            w.wait(|seq| async move {
                let _ = seq_tx.send(seq);
                Ok(())
            })
            .await
        });

        let seq = seq_rx.await.unwrap();
        waiter.done(seq);
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(waiter.pending(), 0);
    }

    #[test]
    fn test_done_without_waiter() {
        let waiter = AckWaiter::new();
        waiter.done(0);
        waiter.done(u16::MAX);
        assert_eq!(waiter.pending(), 0);
    }

    #[tokio::test]
    async fn test_sequences_increment() {
        let waiter = AckWaiter::new();
        let mut seen = Vec::new();
        for _ in 0..3 {
            let fut = waiter.wait(|seq| {
                seen.push(seq);
                async { Ok(()) }
            });
            // Nobody acks, so cancel through a timeout.
            let _ = tokio::time::timeout(Duration::from_millis(5), fut).await;
        }
        assert_eq!(seen[1], seen[0].wrapping_add(1));
        assert_eq!(seen[2], seen[1].wrapping_add(1));
    }

    #[tokio::test]
    async fn test_cancelled_wait_removes_entry() {
        let waiter = AckWaiter::new();
        let res = tokio::time::timeout(
            Duration::from_millis(10),
            waiter.wait(|_| async { Ok(()) }),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(waiter.pending(), 0);
    }

    #[tokio::test]
    async fn test_action_error_propagates() {
        let waiter = AckWaiter::new();
        let res = waiter.wait(|_| async { Err(Error::ConnClosed) }).await;
        assert!(matches!(res, Err(Error::ConnClosed)));
        assert_eq!(waiter.pending(), 0);
    }

    #[tokio::test]
    async fn test_stop_all_wakes_waiters() {
        let waiter = Arc::new(AckWaiter::new());
        let w = waiter.clone();
        let handle = tokio::spawn(async move { w.wait(|_| async { Ok(()) }).await });

        while waiter.pending() == 0 {
            tokio::task::yield_now().await;
        }
        waiter.stop_all();
        waiter.stop_all();

        assert!(matches!(handle.await.unwrap(), Err(Error::ClosedPipe)));
        let res = waiter.wait(|_| async { Ok(()) }).await;
        assert!(matches!(res, Err(Error::ClosedPipe)));
    }
}
