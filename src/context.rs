use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Result, VcsError};

/// Caller-supplied deadline and cancellation signal for I/O-bearing calls.
///
/// Cloning an `OpContext` shares the cancellation signal; narrowing the
/// deadline on a clone does not affect the original.
#[derive(Debug, Clone)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: watch::Receiver<bool>,
}

/// Cancels every context created from the same `OpContext::cancelable` call.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl OpContext {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self {
            deadline: None,
            cancel: rx,
        }
    }

    pub fn cancelable() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                deadline: None,
                cancel: rx,
            },
            CancelHandle { tx },
        )
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns a context whose deadline is the earlier of the current one and `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_canceled(&self) -> bool {
        *self.cancel.borrow() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fails fast with `Canceled` if the context is already done.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(VcsError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Drive `fut` to completion unless the context is canceled or expires first.
    /// On cancellation the future is dropped before this returns.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        let mut cancel = self.cancel.clone();
        tokio::select! {
            res = fut => res,
            _ = wait_for_cancel(&mut cancel) => Err(VcsError::Canceled),
            _ = sleep_until(self.deadline) => Err(VcsError::Canceled),
        }
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without canceling: this context can no longer be canceled.
            std::future::pending::<()>().await;
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_context_runs_to_completion() {
        let ctx = OpContext::background();
        let value = ctx.run(async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_future() {
        let (ctx, handle) = OpContext::cancelable();
        let task_ctx = ctx.clone();
        let task = tokio::spawn(async move {
            task_ctx
                .run(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(VcsError::Canceled)));
        assert!(ctx.is_canceled());
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let ctx = OpContext::background().with_timeout(Duration::from_millis(10));
        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(VcsError::Canceled)));
    }

    #[tokio::test]
    async fn test_already_canceled_context_fails_fast() {
        let (ctx, handle) = OpContext::cancelable();
        handle.cancel();
        assert!(matches!(ctx.check(), Err(VcsError::Canceled)));
    }
}
