use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

/// A pending atom read.
///
/// Returned inside [`AtomError::Suspended`](crate::AtomError::Suspended) when a
/// value is not available yet. The future never fails: it only signals that the
/// read is worth retrying. Clones share the same underlying future, so any
/// number of readers can wait on one suspension.
#[derive(Clone)]
pub struct Suspense {
    inner: Shared<BoxFuture<'static, ()>>,
}

impl Suspense {
    /// Wraps a future that settles when the suspended value may be read again.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: future.boxed().shared(),
        }
    }

    /// A suspension that is already settled.
    pub fn ready() -> Self {
        Self::new(futures::future::ready(()))
    }

    /// Returns `true` once the future has completed and been observed by a poll.
    pub fn is_settled(&self) -> bool {
        self.inner.peek().is_some()
    }
}

impl Future for Suspense {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl fmt::Debug for Suspense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspense")
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_ready_settles_after_poll() {
        let suspense = Suspense::ready();
        assert!(!suspense.is_settled());

        suspense.clone().await;
        assert!(suspense.is_settled());
    }

    #[tokio::test]
    async fn test_clones_share_completion() {
        let (tx, rx) = oneshot::channel::<()>();
        let suspense = Suspense::new(async move {
            let _ = rx.await;
        });
        let waiter = tokio::spawn(suspense.clone());

        assert!(!suspense.is_settled());
        tx.send(()).ok();
        waiter.await.ok();

        assert!(suspense.is_settled());
    }
}
