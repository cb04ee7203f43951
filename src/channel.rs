mod proposal;
mod state;
mod update;

use crate::{
    error::{ClientError, ResponderError},
    Bytes32, Context,
};

pub use proposal::*;
pub use state::*;
pub use update::*;

/// Index of a participant in the channel.
///
/// `0` is the proposer of the channel.
pub type PartIdx = usize;

/// Only two-party ledger channels are supported.
pub const PARTICIPANTS: usize = 2;

/// The nonce added by each participant.
///
/// They are combined into a single [crate::U256] using SHA3-256.
pub type NonceShare = Bytes32;

/// Terminal and non-terminal states of a one-shot responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Pending,
    Accepted,
    Rejected,
    /// The bound context ran out before the responder was resolved.
    Expired,
    /// The client failed while sending the answer.
    Failed,
}

impl Resolution {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Resolution::Pending)
    }

    /// Claims a pending responder for an answer bounded by `ctx`.
    ///
    /// A responder whose context is already done becomes
    /// [Expired](Resolution::Expired) without being used.
    pub(crate) fn spend(&mut self, ctx: &Context) -> Result<(), ResponderError> {
        match *self {
            Resolution::Pending if ctx.is_done() => {
                *self = Resolution::Expired;
                Err(ResponderError::Expired)
            }
            Resolution::Pending => Ok(()),
            Resolution::Expired => Err(ResponderError::Expired),
            _ => Err(ResponderError::AlreadyResolved),
        }
    }

    /// Records how the answer went; `ok` on success.
    pub(crate) fn settle<T>(
        &mut self,
        res: Result<T, ClientError>,
        ok: Resolution,
    ) -> Result<T, ResponderError> {
        *self = match &res {
            Ok(_) => ok,
            Err(e) if e.is_timeout() => Resolution::Expired,
            Err(_) => Resolution::Failed,
        };
        Ok(res?)
    }
}
