//! Cancellable, deadline-bound scopes for calls into the channel client.
//!
//! A [Context] guards exactly one outstanding operation. Every blocking call
//! into the client takes one, and [Context::run] makes sure the call returns
//! promptly once the deadline passes or somebody cancels it.
//!
//! The context returned by [Context::with_timeout] owns the scope: dropping it
//! cancels the context, so the scope is released on every exit path even if
//! the caller forgets to call [Context::cancel]. Clones share the same
//! cancellation but do not cancel on drop.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{sync::watch, time::Instant};

use crate::error::ContextError;

/// Longest deadline a context can have, about 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug)]
struct Inner {
    deadline: Instant,
    cancelled: watch::Sender<bool>,
}

#[derive(Debug)]
pub struct Context {
    inner: Arc<Inner>,
    owner: bool,
}

impl Context {
    /// Creates a context whose deadline is `timeout` from now.
    ///
    /// Timeouts longer than about 30 years are capped.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (cancelled, _) = watch::channel(false);
        Context {
            inner: Arc::new(Inner {
                deadline: Instant::now() + timeout.min(FAR_FUTURE),
                cancelled,
            }),
            owner: true,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.inner.deadline
    }

    /// Cancels the context. Calling this more than once, from any task, has
    /// no further effect.
    pub fn cancel(&self) {
        self.inner.cancelled.send_if_modified(|cancelled| {
            let changed = !*cancelled;
            *cancelled = true;
            changed
        });
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.borrow()
    }

    /// Reports why the context is done, or `None` while it is still live.
    ///
    /// Cancellation takes precedence over an elapsed deadline.
    pub fn err(&self) -> Option<ContextError> {
        if self.is_cancelled() {
            Some(ContextError::Cancelled)
        } else if Instant::now() >= self.inner.deadline {
            Some(ContextError::DeadlineExceeded)
        } else {
            None
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is cancelled or its deadline has passed.
    pub async fn done(&self) -> ContextError {
        let mut cancelled = self.inner.cancelled.subscribe();
        tokio::select! {
            biased;
            // The sender lives in `self.inner`, so `wait_for` can only end
            // with the flag set.
            _ = cancelled.wait_for(|c| *c) => ContextError::Cancelled,
            _ = tokio::time::sleep_until(self.inner.deadline) => ContextError::DeadlineExceeded,
        }
    }

    /// Runs `op` bounded by this context.
    ///
    /// Returns the context error if the context is done before `op`
    /// completes, including when it is already done on entry (then `op` is
    /// never polled). Otherwise `op`'s own result is returned unchanged.
    pub async fn run<F, T, E>(&self, op: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<ContextError>,
    {
        if let Some(err) = self.err() {
            return Err(err.into());
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err.into()),
            res = op => res,
        }
    }
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Context {
            inner: self.inner.clone(),
            owner: false,
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.owner {
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;

    #[tokio::test(start_paused = true)]
    async fn huge_timeout_is_capped() {
        let ctx = Context::with_timeout(Duration::MAX);
        assert_eq!(ctx.deadline(), Instant::now() + FAR_FUTURE);
        assert_eq!(ctx.err(), None);

        let ctx = Context::with_timeout(Duration::from_secs(u64::MAX));
        let res: Result<u32, ClientError> = ctx.run(async { Ok(1) }).await;
        assert_eq!(res, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_context_yields_timeout() {
        let ctx = Context::with_timeout(Duration::from_secs(5));
        let res: Result<u32, ClientError> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(7)
            })
            .await;
        assert_eq!(res, Err(ClientError::Context(ContextError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn result_propagates_unchanged() {
        let ctx = Context::with_timeout(Duration::from_secs(5));
        let ok: Result<u32, ClientError> = ctx.run(async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let err: Result<u32, ClientError> =
            ctx.run(async { Err(ClientError::Closed) }).await;
        assert_eq!(err, Err(ClientError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn done_context_never_polls_operation() {
        let ctx = Context::with_timeout(Duration::from_secs(1));
        ctx.cancel();
        let mut polled = false;
        let res: Result<(), ClientError> = ctx
            .run(async {
                polled = true;
                Ok(())
            })
            .await;
        assert_eq!(res, Err(ClientError::Context(ContextError::Cancelled)));
        assert!(!polled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_from_other_task_aborts_operation() {
        let ctx = Context::with_timeout(Duration::from_secs(60));
        let handle = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.cancel();
        });
        let res: Result<(), ClientError> = ctx.run(std::future::pending()).await;
        assert_eq!(res, Err(ClientError::Context(ContextError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let ctx = Context::with_timeout(Duration::from_secs(5));
        let ok: Result<u8, ClientError> = ctx.run(async { Ok(1) }).await;
        assert_eq!(ok, Ok(1));

        ctx.cancel();
        ctx.cancel();
        ctx.clone().cancel();
        assert_eq!(ctx.err(), Some(ContextError::Cancelled));
        assert_eq!(ctx.done().await, ContextError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_owner_cancels_clones() {
        let ctx = Context::with_timeout(Duration::from_secs(5));
        let clone = ctx.clone();
        drop(clone.clone());
        assert!(!clone.is_cancelled());
        drop(ctx);
        assert!(clone.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reported_after_elapsing() {
        let ctx = Context::with_timeout(Duration::from_secs(2));
        assert_eq!(ctx.err(), None);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }
}
