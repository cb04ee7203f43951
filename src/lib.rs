//! Node-side orchestration of two-party Perun payment channels.
//!
//! The protocol itself (signing, funding, disputes) is provided by a channel
//! client behind the traits in [client]. This crate drives that client: it
//! answers inbound proposals, proposes channels, and supervises one watcher
//! and one update handler per open channel. See [Node].

pub mod channel;
pub mod client;
pub mod config;
mod context;
pub mod error;
pub mod events;
pub mod handler;
pub mod logging;
mod node;
pub mod sim;
mod supervisor;
mod types;

pub use context::Context;
pub use error::{ClientError, ContextError, NodeError, ResponderError};
pub use node::{ChannelTasks, Node, NodeBuilder, NodeState};
pub use supervisor::{SpawnError, TaskKey, TaskSupervisor};
pub use types::{Address, Bytes32, Hash, ParseBytesError, PeerIdentity, U256};
