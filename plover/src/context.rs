use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorKind, Result};

/// Deadline and cancellation signal carried by a call.
///
/// Derived contexts get their own cancellation token chained to the parent,
/// so cancelling a child never cancels its parent. A derived deadline never
/// extends the parent's.
///
/// Cancellation is local only: the remote side is not told and may still
/// finish the work.
#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Context {
    /// A context that never expires unless cancelled.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.child_token(),
        }
    }

    /// A child context that can be cancelled on its own.
    #[must_use]
    pub fn with_cancel(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the reason this context is done, if it is.
    ///
    /// # Errors
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::kind(ErrorKind::Cancelled))
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Err(Error::kind(ErrorKind::DeadlineExceeded))
        } else {
            Ok(())
        }
    }

    /// Drives `fut` until it completes or this context is done.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Cancelled`] or [`ErrorKind::DeadlineExceeded`]
    /// if the context finishes first; `fut` is dropped in that case.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::kind(ErrorKind::Cancelled)),
            output = fut => Ok(output),
            () = expired => Err(Error::kind(ErrorKind::DeadlineExceeded)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        ctx.check().unwrap();
        let err = ctx
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
        assert_eq!(ctx.check().unwrap_err().kind, ErrorKind::DeadlineExceeded);

        let fast = Context::background().with_timeout(Duration::from_secs(5));
        assert_eq!(fast.run(async { 42 }).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_cancel_only_reaches_children() {
        let parent = Context::background();
        let child = parent.with_cancel();
        let grandchild = child.with_timeout(Duration::from_secs(5));

        child.cancel();
        assert_eq!(child.check().unwrap_err().kind, ErrorKind::Cancelled);
        assert_eq!(grandchild.check().unwrap_err().kind, ErrorKind::Cancelled);
        parent.check().unwrap();

        let err = grandchild
            .run(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_child_deadline_never_extends_parent() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(10));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
