//! A tiny level-triggered cancellation signal, shared by the Sandbox
//! Manager's `exec` and the Session Runtime's `abort`. `tokio_util`'s
//! `CancellationToken` would be the obvious pick but isn't part of this
//! codebase's dependency stack, so this follows the same preference seen
//! elsewhere (`signaling.rs`'s `browser_kick: Notify`) for a hand-rolled
//! `Notify` wrapper rather than pulling in a new crate for one flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CancelToken(Arc<Inner>);

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called. Safe to call before or
    /// after cancellation: checks the flag first so a cancel that raced
    /// ahead of the waiter is never missed.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.0.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_before_wait_is_not_missed() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }

    #[tokio::test]
    async fn cancel_after_wait_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn not_cancelled_by_default() {
        assert!(!CancelToken::new().is_cancelled());
    }
}
