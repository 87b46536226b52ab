//! Single-assignment session result cell
//!
//! Multiple event feeds plus a deadline timer can all reach a terminal
//! verdict for the same session. The cell guarantees exactly one terminal
//! result: the first writer succeeds and every later write is a no-op, and
//! any number of waiters observe the verdict without a writer ever blocking
//! on a missing reader.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::session::Verdict;

/// Shared, write-once result slot for one convergence session
#[derive(Clone, Debug)]
pub(crate) struct Outcome {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    slot: Mutex<Option<Verdict>>,
    notify: Notify,
}

impl Outcome {
    /// Create an empty cell
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Write the verdict; returns whether this call was the first writer
    pub(crate) fn complete(&self, verdict: Verdict) -> bool {
        let mut slot = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(verdict);
        drop(slot);
        self.inner.notify.notify_waiters();
        true
    }

    /// The verdict, if one has been written
    pub(crate) fn peek(&self) -> Option<Verdict> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Wait for the verdict
    pub(crate) async fn wait(&self) -> Verdict {
        loop {
            // Register interest before checking the slot so a write between
            // the check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            if let Some(verdict) = self.peek() {
                return verdict;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConvergenceFailure;

    #[test]
    fn first_writer_wins() {
        let outcome = Outcome::new();
        assert!(outcome.complete(Verdict::Ready));
        assert!(!outcome.complete(Verdict::Failed(ConvergenceFailure::Cancelled)));
        assert_eq!(outcome.peek(), Some(Verdict::Ready));
    }

    #[test]
    fn repeated_identical_writes_are_no_ops() {
        let outcome = Outcome::new();
        assert!(outcome.complete(Verdict::Ready));
        assert!(!outcome.complete(Verdict::Ready));
        assert!(!outcome.complete(Verdict::Ready));
    }

    #[tokio::test]
    async fn waiters_observe_the_verdict() {
        let outcome = Outcome::new();
        let waiter = outcome.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        // Give the waiter a chance to park before the write.
        tokio::task::yield_now().await;
        outcome.complete(Verdict::Ready);

        assert_eq!(handle.await.expect("join"), Verdict::Ready);
    }

    #[tokio::test]
    async fn late_waiters_see_an_already_written_verdict() {
        let outcome = Outcome::new();
        outcome.complete(Verdict::Failed(ConvergenceFailure::Cancelled));
        assert_eq!(
            outcome.wait().await,
            Verdict::Failed(ConvergenceFailure::Cancelled)
        );
    }

    #[tokio::test]
    async fn many_waiters_all_wake() {
        let outcome = Outcome::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let waiter = outcome.clone();
            handles.push(tokio::spawn(async move { waiter.wait().await }));
        }
        tokio::task::yield_now().await;
        outcome.complete(Verdict::Ready);
        for handle in handles {
            assert_eq!(handle.await.expect("join"), Verdict::Ready);
        }
    }
}
