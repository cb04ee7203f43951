//! Inbound channel proposals and the one-shot capability to answer them.

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use super::{BalanceVector, NonceShare, Resolution};
use crate::{
    client::PaymentChannel,
    error::{ClientError, ResponderError},
    Address, Context, Hash,
};

/// A pending request from `peer` to open a channel with us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelProposal {
    pub proposal_id: Hash,
    /// Who proposed the channel. Always participant 0.
    pub peer: Address,
    pub challenge_duration: u64,
    pub nonce_share: NonceShare,
    /// Initial balances, proposer first.
    pub init_bals: BalanceVector,
}

/// Client side of a [ProposalResponder]: sends the answer to the proposer.
///
/// Implementations may assume each method is called at most once and only
/// one of them is called; [ProposalResponder] enforces that.
#[async_trait]
pub trait ProposalReply: Send {
    async fn accept(&mut self) -> Result<Arc<dyn PaymentChannel>, ClientError>;
    async fn reject(&mut self, reason: &str) -> Result<(), ClientError>;
}

/// One-shot answer to a single [ChannelProposal].
///
/// The first call to [accept](Self::accept) or [reject](Self::reject) spends
/// the responder. Any later call fails with
/// [ResponderError::AlreadyResolved]; a call made after the bound context is
/// done fails with [ResponderError::Expired].
pub struct ProposalResponder {
    reply: Box<dyn ProposalReply>,
    resolution: Resolution,
}

impl ProposalResponder {
    pub fn new(reply: Box<dyn ProposalReply>) -> Self {
        ProposalResponder {
            reply,
            resolution: Resolution::Pending,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Accepts the proposal, bounded by `ctx`, and returns the new channel.
    pub async fn accept(
        &mut self,
        ctx: &Context,
    ) -> Result<Arc<dyn PaymentChannel>, ResponderError> {
        self.resolution.spend(ctx)?;
        let res = ctx.run(self.reply.accept()).await;
        self.resolution.settle(res, Resolution::Accepted)
    }

    pub async fn reject(&mut self, ctx: &Context, reason: &str) -> Result<(), ResponderError> {
        self.resolution.spend(ctx)?;
        let res = ctx.run(self.reply.reject(reason)).await;
        self.resolution.settle(res, Resolution::Rejected)
    }
}

impl fmt::Debug for ProposalResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProposalResponder")
            .field("resolution", &self.resolution)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ContextError;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    struct CountingReply {
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl ProposalReply for CountingReply {
        async fn accept(&mut self) -> Result<Arc<dyn PaymentChannel>, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Err(ClientError::Protocol("no channel in this test".into()))
        }

        async fn reject(&mut self, _reason: &str) -> Result<(), ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn responder(delay: Duration) -> (ProposalResponder, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let reply = CountingReply {
            calls: calls.clone(),
            delay,
        };
        (ProposalResponder::new(Box::new(reply)), calls)
    }

    #[tokio::test(start_paused = true)]
    async fn second_use_fails() {
        let (mut r, calls) = responder(Duration::ZERO);
        let ctx = Context::with_timeout(Duration::from_secs(5));

        r.reject(&ctx, "not today").await.unwrap();
        assert_eq!(r.resolution(), Resolution::Rejected);

        assert_eq!(
            r.reject(&ctx, "again").await,
            Err(ResponderError::AlreadyResolved)
        );
        assert_eq!(
            r.accept(&ctx).await.err(),
            Some(ResponderError::AlreadyResolved)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn use_after_expiry_fails() {
        let (mut r, calls) = responder(Duration::ZERO);
        let ctx = Context::with_timeout(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(r.reject(&ctx, "late").await, Err(ResponderError::Expired));
        assert_eq!(r.resolution(), Resolution::Expired);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_accept_times_out() {
        let (mut r, _) = responder(Duration::from_secs(10));
        let ctx = Context::with_timeout(Duration::from_secs(5));

        let err = r.accept(&ctx).await.err();
        assert_eq!(
            err,
            Some(ResponderError::Client(ClientError::Context(
                ContextError::DeadlineExceeded
            )))
        );
        assert_eq!(r.resolution(), Resolution::Expired);
        assert_eq!(r.accept(&ctx).await.err(), Some(ResponderError::Expired));
    }

    #[tokio::test(start_paused = true)]
    async fn client_failure_spends_responder() {
        let (mut r, _) = responder(Duration::ZERO);
        let ctx = Context::with_timeout(Duration::from_secs(5));

        assert!(matches!(
            r.accept(&ctx).await,
            Err(ResponderError::Client(ClientError::Protocol(_)))
        ));
        assert_eq!(r.resolution(), Resolution::Failed);
        assert_eq!(
            r.reject(&ctx, "too late").await,
            Err(ResponderError::AlreadyResolved)
        );
    }
}
