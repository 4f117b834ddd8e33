//! Shutdown state shared by every closable component.

use std::sync::Mutex;

/// Lifecycle of a closable component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting work.
    Open,
    /// A close is running its side effects.
    Closing,
    /// Fully closed.
    Closed,
}

/// Guards a component's close path so its side effects run exactly once.
#[derive(Debug)]
pub struct CloseGuard {
    state: Mutex<Lifecycle>,
}

impl Default for CloseGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseGuard {
    /// Create a guard in the [`Lifecycle::Open`] state.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Lifecycle::Open),
        }
    }

    /// Current state.
    pub fn state(&self) -> Lifecycle {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True unless a close has begun.
    pub fn is_open(&self) -> bool {
        self.state() == Lifecycle::Open
    }

    /// Move `Open -> Closing`. Returns `true` for the single caller that won
    /// the transition; every other caller must treat the close as a no-op.
    pub fn begin_close(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != Lifecycle::Open {
            return false;
        }
        *state = Lifecycle::Closing;
        true
    }

    /// Move `Closing -> Closed`.
    pub fn finish_close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = Lifecycle::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_single_winner() {
        let guard = CloseGuard::new();
        assert!(guard.begin_close());
        assert!(!guard.begin_close());
        assert_eq!(guard.state(), Lifecycle::Closing);
        guard.finish_close();
        assert_eq!(guard.state(), Lifecycle::Closed);
        assert!(!guard.begin_close());
    }

    #[test]
    fn test_concurrent_close() {
        let guard = Arc::new(CloseGuard::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if guard.begin_close() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
