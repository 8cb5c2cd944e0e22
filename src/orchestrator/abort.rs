//! Cooperative cancellation token for the acquisition loop.

use crate::run::AbortReason;
use std::sync::Arc;
use tokio::sync::watch;

/// Shared abort request. The first request wins; later ones are ignored.
///
/// The acquisition loop polls [`AbortSignal::requested`] once per sample, between
/// acquisitions. Waits inside the loop race against [`AbortSignal::cancelled`] so an
/// abort never has to sit out a full pacing interval.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<Option<AbortReason>>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request an abort. Returns `false` if one was already pending.
    pub fn request(&self, reason: AbortReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn requested(&self) -> Option<AbortReason> {
        *self.tx.borrow()
    }

    /// Resolves once an abort has been requested.
    pub async fn cancelled(&self) -> AbortReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Unreachable while `self` holds the sender.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_request_wins() {
        let signal = AbortSignal::new();
        assert!(signal.requested().is_none());
        assert!(signal.request(AbortReason::UserRequested));
        assert!(!signal.request(AbortReason::ErrorDetected));
        assert_eq!(signal.requested(), Some(AbortReason::UserRequested));
    }

    #[tokio::test]
    async fn cancelled_wakes_waiter() {
        let signal = AbortSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        signal.request(AbortReason::ErrorDetected);
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, AbortReason::ErrorDetected);
    }

    #[test]
    fn cancelled_is_ready_once_requested() {
        let signal = AbortSignal::new();
        signal.request(AbortReason::UserRequested);
        let reason = tokio_test::block_on(signal.cancelled());
        assert_eq!(reason, AbortReason::UserRequested);
    }
}
