use std::sync::Arc;

use tokio::sync::watch;

/// Cancellation signal shared between a caller and an in-flight request.
///
/// Clones observe the same signal. Cancelling is idempotent.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once [`CancelToken::cancel`] has been called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // The sender lives as long as any clone of the token, including this one.
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            waiter.is_cancelled()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let observed = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake up")
            .unwrap();
        assert!(observed);
    }

    #[tokio::test]
    async fn test_cancelled_completes_immediately_after_cancel() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();

        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already cancelled token should complete");
    }

    #[tokio::test]
    async fn test_uncancelled_token_stays_pending() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect_err("token was never cancelled");
    }
}
