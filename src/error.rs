//! Error types for contexts, responders, the channel client and the node.

use thiserror::Error;

use crate::{channel::InvalidTransition, config::ConfigError, Address, Hash, U256};

/// Why a [Context](crate::Context) stopped guarding its operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Failures reported by the channel client collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("peer {peer} is unreachable at {address}:{port}")]
    PeerUnreachable {
        peer: Address,
        address: String,
        port: u16,
    },
    #[error("peer {0} was never added")]
    UnknownPeer(Address),
    #[error("address {0} is already served by another client")]
    AddressInUse(Address),
    #[error("proposal rejected: {0}")]
    Rejected(String),
    #[error("update rejected: {0}")]
    UpdateRejected(String),
    #[error("invalid update: {0}")]
    InvalidUpdate(#[from] InvalidTransition),
    #[error("channel {0} is closed")]
    ChannelClosed(Hash),
    #[error("already handling {0}")]
    AlreadyListening(&'static str),
    #[error("client is closed")]
    Closed,
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Context(_))
    }
}

/// Returned by the one-shot proposal and update responders.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponderError {
    #[error("responder was already resolved")]
    AlreadyResolved,
    #[error("responder expired before it was resolved")]
    Expired,
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Errors surfaced to users of [Node](crate::Node).
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("channel client setup failed: {0}")]
    Construction(#[source] ClientError),
    #[error("adding peer {peer} failed: {source}")]
    AddPeer {
        peer: Address,
        #[source]
        source: ClientError,
    },
    #[error("proposing channel to {peer} failed: {source}")]
    Propose {
        peer: Address,
        #[source]
        source: ClientError,
    },
    #[error("channel {id}: {source}")]
    Channel {
        id: Hash,
        #[source]
        source: ClientError,
    },
    #[error("channel {id}: cannot pay {amount}, only {available} available")]
    InsufficientFunds {
        id: Hash,
        available: U256,
        amount: U256,
    },
    #[error("unknown channel {0}")]
    UnknownChannel(Hash),
    #[error("channel {0} is already supervised")]
    DuplicateChannel(Hash),
    #[error("node is not running")]
    NotRunning,
    #[error(transparent)]
    Config(#[from] ConfigError),
}
