//! Structured events emitted by the node and its tasks.
//!
//! The node never logs directly. It hands [NodeEvent]s to the [EventSink] it
//! was built with: [TracingSink] forwards them to `tracing`, and
//! [RecordingSink] keeps them in memory so tests can assert on them.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::Notify;

use crate::{channel::BalanceVector, node::NodeState, Address, Hash};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    StateChanged {
        state: NodeState,
    },
    ClientReady {
        alias: String,
        address: Address,
    },
    ProposalReceived {
        peer: Address,
        balances: BalanceVector,
    },
    ProposalRejected {
        peer: Address,
        reason: String,
    },
    ProposalFailed {
        peer: Address,
        error: String,
    },
    ChannelAccepted {
        channel: Hash,
        part_idx: usize,
        peer: Address,
    },
    /// A channel was opened but will not be supervised. When the node is
    /// shutting down this can be a channel the peer considers open; it is left
    /// unwatched.
    ChannelRefused {
        channel: Hash,
        reason: String,
    },
    WatchStarted {
        channel: Hash,
    },
    WatchStopped {
        channel: Hash,
    },
    WatchFailed {
        channel: Hash,
        error: String,
    },
    UpdatesStarted {
        channel: Hash,
    },
    UpdatesStopped {
        channel: Hash,
    },
    UpdatesFailed {
        channel: Hash,
        error: String,
    },
    UpdateReceived {
        channel: Hash,
        version: u64,
        is_final: bool,
    },
    UpdateAccepted {
        channel: Hash,
        version: u64,
    },
    UpdateRejected {
        channel: Hash,
        version: u64,
        reason: String,
    },
    UpdateFailed {
        channel: Hash,
        version: u64,
        error: String,
    },
    ListenerStopped {
        error: Option<String>,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: NodeEvent);
}

/// Forwards every event to `tracing` with structured fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: NodeEvent) {
        use NodeEvent::*;
        match event {
            StateChanged { state } => tracing::info!(?state, "node state changed"),
            ClientReady { alias, address } => {
                tracing::info!(%alias, %address, "channel client ready")
            }
            ProposalReceived { peer, balances } => {
                tracing::info!(%peer, %balances, "channel proposal received")
            }
            ProposalRejected { peer, reason } => {
                tracing::warn!(%peer, %reason, "channel proposal rejected")
            }
            ProposalFailed { peer, error } => {
                tracing::warn!(%peer, %error, "channel proposal dropped")
            }
            ChannelAccepted {
                channel,
                part_idx,
                peer,
            } => tracing::info!(%channel, part_idx, %peer, "new channel"),
            ChannelRefused { channel, reason } => {
                tracing::warn!(%channel, %reason, "channel not supervised")
            }
            WatchStarted { channel } => tracing::debug!(%channel, "starting watching"),
            WatchStopped { channel } => tracing::debug!(%channel, "stopped watching"),
            WatchFailed { channel, error } => {
                tracing::error!(%channel, %error, "error watching, channel is unwatched")
            }
            UpdatesStarted { channel } => tracing::debug!(%channel, "starting handling updates"),
            UpdatesStopped { channel } => tracing::debug!(%channel, "stopped handling updates"),
            UpdatesFailed { channel, error } => {
                tracing::error!(%channel, %error, "error handling updates")
            }
            UpdateReceived {
                channel,
                version,
                is_final,
            } => tracing::info!(%channel, version, is_final, "update"),
            UpdateAccepted { channel, version } => {
                tracing::debug!(%channel, version, "update accepted")
            }
            UpdateRejected {
                channel,
                version,
                reason,
            } => tracing::warn!(%channel, version, %reason, "update rejected"),
            UpdateFailed {
                channel,
                version,
                error,
            } => tracing::warn!(%channel, version, %error, "update handling failed"),
            ListenerStopped { error: None } => tracing::debug!("proposal listener stopped"),
            ListenerStopped { error: Some(error) } => {
                tracing::error!(%error, "proposal listener stopped")
            }
        }
    }
}

/// Keeps every emitted event in memory.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<NodeEvent>>,
    notify: Notify,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<NodeEvent> {
        self.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&NodeEvent) -> bool) -> usize {
        self.lock().iter().filter(|e| pred(e)).count()
    }

    /// Waits until an event matching `pred` was recorded, or `timeout`
    /// passed. Returns the first matching event.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        pred: impl Fn(&NodeEvent) -> bool,
    ) -> Option<NodeEvent> {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                // Registered before checking, so an emit in between is not lost.
                notified.as_mut().enable();
                if let Some(e) = self.lock().iter().find(|e| pred(e)) {
                    return e.clone();
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<NodeEvent>> {
        // A panicking test thread must not hide the events from the others.
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: NodeEvent) {
        self.lock().push(event);
        self.notify.notify_waiters();
    }
}
