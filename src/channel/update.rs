use std::fmt;

use async_trait::async_trait;

use super::{PartIdx, Resolution, State};
use crate::{
    error::{ClientError, ResponderError},
    Context,
};

/// A proposed next state for an established channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub state: State,
    /// Participant that proposed the update.
    pub actor_idx: PartIdx,
}

/// Client side of an [UpdateResponder].
#[async_trait]
pub trait UpdateReply: Send {
    async fn accept(&mut self) -> Result<(), ClientError>;
    async fn reject(&mut self, reason: &str) -> Result<(), ClientError>;
}

/// One-shot answer to a single [ChannelUpdate]. Same contract as
/// [ProposalResponder](super::ProposalResponder).
pub struct UpdateResponder {
    reply: Box<dyn UpdateReply>,
    resolution: Resolution,
}

impl UpdateResponder {
    pub fn new(reply: Box<dyn UpdateReply>) -> Self {
        UpdateResponder {
            reply,
            resolution: Resolution::Pending,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub async fn accept(&mut self, ctx: &Context) -> Result<(), ResponderError> {
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

impl fmt::Debug for UpdateResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateResponder")
            .field("resolution", &self.resolution)
            .finish_non_exhaustive()
    }
}
