//! Interfaces of the channel client collaborator.
//!
//! The client owns the network connections and on-chain adapters and runs
//! the actual channel protocol (signing, funding, disputes). The node only
//! drives it through these traits, so any backend (go-perun over a bridge,
//! the in-process [sim](crate::sim) client, ...) can sit underneath.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    channel::{
        BalanceVector, ChannelProposal, ChannelUpdate, Params, PartIdx, ProposalResponder, State,
        UpdateResponder,
    },
    config::NodeConfig,
    error::ClientError,
    Address, Context, Hash,
};

/// Key material of the node. Creating and unlocking it is the host
/// application's job.
pub trait Wallet: Send + Sync {
    /// On-chain address, also used as our identity towards peers.
    fn address(&self) -> Address;
}

/// Creates a [ChannelClient] for one node.
///
/// Setting up the client may deploy contracts, so the node bounds this call
/// with a generous context.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &NodeConfig,
        wallet: &dyn Wallet,
    ) -> Result<Arc<dyn ChannelClient>, ClientError>;
}

/// Called by the client for every inbound channel proposal. Calls for
/// different proposals may run concurrently.
#[async_trait]
pub trait ProposalHandler: Send + Sync {
    async fn handle(&self, proposal: ChannelProposal, responder: ProposalResponder);
}

/// Called by the client for every update proposed by the peer of one
/// channel. Calls for the same channel never overlap.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle(&self, update: ChannelUpdate, responder: UpdateResponder);
}

#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Makes `peer` reachable at `address:port`. Calling it again with the
    /// same arguments is a no-op.
    async fn add_peer(&self, peer: Address, address: &str, port: u16) -> Result<(), ClientError>;

    /// Serves inbound proposals until the client is closed.
    async fn handle_channel_proposals(
        &self,
        handler: Arc<dyn ProposalHandler>,
    ) -> Result<(), ClientError>;

    /// Proposes a channel to `peer` and waits until it is accepted and open.
    async fn propose_channel(
        &self,
        ctx: &Context,
        peer: Address,
        challenge_duration: u64,
        init_bals: BalanceVector,
    ) -> Result<Arc<dyn PaymentChannel>, ClientError>;

    /// Releases network and on-chain resources. Idempotent.
    async fn close(&self);
}

/// An established two-party channel.
///
/// Shared between the channel's watcher and update handler; every method must
/// tolerate the channel closing concurrently.
#[async_trait]
pub trait PaymentChannel: Send + Sync {
    fn id(&self) -> Hash;

    /// Our own participant index; 0 if we proposed the channel.
    fn part_idx(&self) -> PartIdx;

    fn params(&self) -> Params;

    fn state(&self) -> State;

    fn peer(&self) -> Address {
        self.params().participants[1 - self.part_idx().min(1)]
    }

    /// Watches the chain for disputes until the channel is concluded.
    ///
    /// Not bounded by a context: it runs for the whole channel lifetime.
    async fn watch(&self) -> Result<(), ClientError>;

    /// Feeds updates proposed by the peer to `handler` until the channel is
    /// final or closed.
    async fn handle_updates(&self, handler: Arc<dyn UpdateHandler>) -> Result<(), ClientError>;

    /// Proposes `next` to the peer and applies it once accepted.
    async fn update(&self, ctx: &Context, next: State) -> Result<(), ClientError>;
}
