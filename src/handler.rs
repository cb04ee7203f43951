//! Callbacks the node registers with the channel client, and the policies
//! deciding what they answer.

mod proposal;
mod update;
mod watcher;

use std::sync::Arc;

use crate::{
    channel::{ChannelProposal, ChannelUpdate, State},
    client::PaymentChannel,
    error::NodeError,
};

pub use proposal::NodeProposalHandler;
pub use update::{serve_updates, ChannelUpdateHandler};
pub use watcher::watch_channel;

/// Receives every channel that was opened, inbound or outbound.
pub trait ChannelAcceptor: Send + Sync {
    fn accept(&self, channel: Arc<dyn PaymentChannel>) -> Result<(), NodeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject(String),
}

/// Decides whether to open a proposed channel.
pub trait ProposalPolicy: Send + Sync {
    fn decide(&self, proposal: &ChannelProposal) -> Decision;
}

/// Decides whether to sign a valid update. Invalid updates never reach the
/// policy.
pub trait UpdatePolicy: Send + Sync {
    fn decide(&self, current: &State, update: &ChannelUpdate) -> Decision;
}

/// Opens every proposed channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl ProposalPolicy for AcceptAll {
    fn decide(&self, _: &ChannelProposal) -> Decision {
        Decision::Accept
    }
}

impl UpdatePolicy for AcceptAll {
    fn decide(&self, _: &State, _: &ChannelUpdate) -> Decision {
        Decision::Accept
    }
}

impl<F> ProposalPolicy for F
where
    F: Fn(&ChannelProposal) -> Decision + Send + Sync,
{
    fn decide(&self, proposal: &ChannelProposal) -> Decision {
        self(proposal)
    }
}
