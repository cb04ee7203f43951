use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use super::{ChannelAcceptor, Decision, ProposalPolicy};
use crate::{
    channel::{ChannelProposal, ProposalResponder},
    client::ProposalHandler,
    events::{EventSink, NodeEvent},
    Context,
};

/// Answers inbound proposals and passes accepted channels to the node.
///
/// Failures never leave this handler: they are reported as events and the
/// proposal is dropped without retry.
pub struct NodeProposalHandler {
    acceptor: Arc<dyn ChannelAcceptor>,
    policy: Arc<dyn ProposalPolicy>,
    timeout: Duration,
    events: Arc<dyn EventSink>,
}

impl NodeProposalHandler {
    pub fn new(
        acceptor: Arc<dyn ChannelAcceptor>,
        policy: Arc<dyn ProposalPolicy>,
        timeout: Duration,
        events: Arc<dyn EventSink>,
    ) -> Self {
        NodeProposalHandler {
            acceptor,
            policy,
            timeout,
            events,
        }
    }
}

#[async_trait]
impl ProposalHandler for NodeProposalHandler {
    async fn handle(&self, proposal: ChannelProposal, mut responder: ProposalResponder) {
        let ctx = Context::with_timeout(self.timeout);
        let peer = proposal.peer;
        self.events.emit(NodeEvent::ProposalReceived {
            peer,
            balances: proposal.init_bals,
        });

        match self.policy.decide(&proposal) {
            Decision::Accept => match responder.accept(&ctx).await {
                Ok(channel) => {
                    // The node reports refused channels itself. A channel
                    // refused during shutdown stays open but unwatched.
                    let _ = self.acceptor.accept(channel);
                }
                Err(e) => self.events.emit(NodeEvent::ProposalFailed {
                    peer,
                    error: e.to_string(),
                }),
            },
            Decision::Reject(reason) => {
                let event = match responder.reject(&ctx, &reason).await {
                    Ok(()) => NodeEvent::ProposalRejected { peer, reason },
                    Err(e) => NodeEvent::ProposalFailed {
                        peer,
                        error: e.to_string(),
                    },
                };
                self.events.emit(event);
            }
        }
        ctx.cancel();
    }
}
