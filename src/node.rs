//! The channel lifecycle orchestrator.
//!
//! A [Node] owns one channel client. It serves inbound proposals on a
//! supervised listener task and, for every channel that gets opened in either
//! direction, spawns exactly one watcher and one update-handler task. All
//! client calls made on behalf of the caller are bounded by a [Context].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use tokio::sync::watch;

use crate::{
    channel::{BalanceVector, State},
    client::{ChannelClient, Connector, PaymentChannel, Wallet},
    config::NodeConfig,
    error::NodeError,
    events::{EventSink, NodeEvent, TracingSink},
    handler::{
        serve_updates, watch_channel, AcceptAll, ChannelAcceptor, ChannelUpdateHandler,
        NodeProposalHandler, ProposalPolicy, UpdatePolicy,
    },
    supervisor::{SpawnError, TaskKey, TaskSupervisor},
    Address, Context, Hash, U256,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

/// Task bookkeeping of one channel, see [Node::channel_tasks].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTasks {
    pub watchers_spawned: usize,
    pub update_handlers_spawned: usize,
    pub watcher_live: bool,
    pub update_handler_live: bool,
}

/// Configures and starts a [Node].
///
/// ```ignore
/// let node = NodeBuilder::new(config)
///     .events(sink)
///     .proposal_policy(|p: &ChannelProposal| Decision::Accept)
///     .build(&connector, &wallet)
///     .await?;
/// ```
pub struct NodeBuilder {
    config: NodeConfig,
    events: Arc<dyn EventSink>,
    proposal_policy: Arc<dyn ProposalPolicy>,
    update_policy: Arc<dyn UpdatePolicy>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        NodeBuilder {
            config,
            events: Arc::new(TracingSink),
            proposal_policy: Arc::new(AcceptAll),
            update_policy: Arc::new(AcceptAll),
        }
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn proposal_policy(mut self, policy: impl ProposalPolicy + 'static) -> Self {
        self.proposal_policy = Arc::new(policy);
        self
    }

    pub fn update_policy(mut self, policy: impl UpdatePolicy + 'static) -> Self {
        self.update_policy = Arc::new(policy);
        self
    }

    /// Connects the channel client and starts serving proposals.
    ///
    /// Connecting may deploy contracts and is bounded by the setup timeout.
    pub async fn build(
        self,
        connector: &dyn Connector,
        wallet: &dyn Wallet,
    ) -> Result<Node, NodeError> {
        let NodeBuilder {
            config,
            events,
            proposal_policy,
            update_policy,
        } = self;
        config.validate()?;
        events.emit(NodeEvent::StateChanged {
            state: NodeState::Initializing,
        });

        let ctx = Context::with_timeout(config.timeouts.setup());
        let client = ctx
            .run(connector.connect(&config, wallet))
            .await
            .map_err(NodeError::Construction)?;
        drop(ctx);

        let address = config.address.unwrap_or_else(|| wallet.address());
        events.emit(NodeEvent::ClientReady {
            alias: config.alias.clone(),
            address,
        });

        let (state, _) = watch::channel(NodeState::Initializing);
        let inner = Arc::new(NodeInner {
            address,
            client,
            config,
            events,
            update_policy,
            supervisor: TaskSupervisor::new(),
            channels: Mutex::new(HashMap::new()),
            state,
        });

        let handler = Arc::new(NodeProposalHandler::new(
            Arc::new(NodeAcceptor(Arc::downgrade(&inner))),
            proposal_policy,
            inner.config.timeouts.proposal(),
            inner.events.clone(),
        ));
        let client = inner.client.clone();
        let events = inner.events.clone();
        let spawned = inner
            .supervisor
            .spawn(TaskKey::ProposalListener, async move {
                let res = client.handle_channel_proposals(handler).await;
                events.emit(NodeEvent::ListenerStopped {
                    error: res.err().map(|e| e.to_string()),
                });
            });
        if spawned.is_err() {
            inner.client.close().await;
            return Err(NodeError::NotRunning);
        }

        inner.set_state(NodeState::Running);
        Ok(Node { inner })
    }
}

/// Handle to a running node. Cheap to clone; all clones drive the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    address: Address,
    client: Arc<dyn ChannelClient>,
    config: NodeConfig,
    events: Arc<dyn EventSink>,
    update_policy: Arc<dyn UpdatePolicy>,
    supervisor: Arc<TaskSupervisor>,
    channels: Mutex<HashMap<Hash, Arc<dyn PaymentChannel>>>,
    state: watch::Sender<NodeState>,
}

/// Shared by the two tasks of a channel. Once both are gone, finished or
/// dropped, the channel is no longer tracked by the node.
struct ChannelRelease {
    node: Weak<NodeInner>,
    id: Hash,
}

impl Drop for ChannelRelease {
    fn drop(&mut self) {
        if let Some(node) = self.node.upgrade() {
            node.channels().remove(&self.id);
            node.supervisor.forget(&TaskKey::Watcher(self.id));
            node.supervisor.forget(&TaskKey::UpdateHandler(self.id));
        }
    }
}

/// Hands channels opened by the proposal listener back to the node without
/// keeping it alive.
struct NodeAcceptor(Weak<NodeInner>);

impl ChannelAcceptor for NodeAcceptor {
    fn accept(&self, channel: Arc<dyn PaymentChannel>) -> Result<(), NodeError> {
        match self.0.upgrade() {
            Some(inner) => inner.accept(channel),
            None => Err(NodeError::NotRunning),
        }
    }
}

impl Node {
    /// Creates a node with the default event sink and policies.
    pub async fn new(
        connector: &dyn Connector,
        config: NodeConfig,
        wallet: &dyn Wallet,
    ) -> Result<Node, NodeError> {
        NodeBuilder::new(config).build(connector, wallet).await
    }

    pub fn address(&self) -> Address {
        self.inner.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state.borrow()
    }

    /// Opens a channel with `peer`, reachable at `address:port`, and
    /// supervises it like an inbound one.
    ///
    /// `init_bals` lists our balance first.
    ///
    /// If the node starts shutting down while the proposal is in flight, the
    /// channel may be open at the protocol level and still be answered with
    /// [NodeError::NotRunning]. It is then reported as
    /// [ChannelRefused](NodeEvent::ChannelRefused) and nobody watches it.
    pub async fn propose(
        &self,
        peer: Address,
        init_bals: BalanceVector,
        address: &str,
        port: u16,
    ) -> Result<Arc<dyn PaymentChannel>, NodeError> {
        self.inner.ensure_running()?;
        self.inner
            .client
            .add_peer(peer, address, port)
            .await
            .map_err(|source| NodeError::AddPeer { peer, source })?;

        let ctx = Context::with_timeout(self.inner.config.timeouts.propose());
        let channel = ctx
            .run(self.inner.client.propose_channel(
                &ctx,
                peer,
                self.inner.config.challenge_duration,
                init_bals,
            ))
            .await
            .map_err(|source| NodeError::Propose { peer, source })?;
        ctx.cancel();

        self.inner.accept(channel.clone())?;
        Ok(channel)
    }

    /// Starts supervising `channel`: one watcher, one update handler. The
    /// channel is released once both have finished.
    ///
    /// Fails with [NodeError::DuplicateChannel] if the channel is already
    /// known, and with [NodeError::NotRunning] once shutdown started; nothing
    /// is spawned then.
    pub fn accept(&self, channel: Arc<dyn PaymentChannel>) -> Result<(), NodeError> {
        self.inner.accept(channel)
    }

    /// Pays `amount` from our balance to the peer.
    pub async fn send(&self, id: Hash, amount: impl Into<U256>) -> Result<(), NodeError> {
        let amount = amount.into();
        let channel = self.lookup(id)?;
        let mine = channel.part_idx();
        let mut next = channel.state().make_next_state();

        let available = next.balances.balance(mine);
        let theirs = next.balances.balance(1 - mine);
        let (left, received) = match (
            available.checked_sub(amount),
            theirs.checked_add(amount),
        ) {
            (Some(left), Some(received)) => (left, received),
            _ => {
                return Err(NodeError::InsufficientFunds {
                    id,
                    available,
                    amount,
                })
            }
        };
        next.balances.0[mine] = left;
        next.balances.0[1 - mine] = received;

        self.update(channel, next).await
    }

    /// Proposes the current balances as the final state, which lets the
    /// channel be concluded on-chain.
    pub async fn settle(&self, id: Hash) -> Result<(), NodeError> {
        let channel = self.lookup(id)?;
        let mut next = channel.state().make_next_state();
        next.is_final = true;
        self.update(channel, next).await
    }

    async fn update(
        &self,
        channel: Arc<dyn PaymentChannel>,
        next: State,
    ) -> Result<(), NodeError> {
        let id = channel.id();
        let ctx = Context::with_timeout(self.inner.config.timeouts.update());
        ctx.run(channel.update(&ctx, next))
            .await
            .map_err(|source| NodeError::Channel { id, source })
    }

    fn lookup(&self, id: Hash) -> Result<Arc<dyn PaymentChannel>, NodeError> {
        self.inner.ensure_running()?;
        self.channel(id).ok_or(NodeError::UnknownChannel(id))
    }

    /// Channels that still have a watcher or an update handler running, in
    /// no particular order. Concluded channels are released.
    pub fn channels(&self) -> Vec<Arc<dyn PaymentChannel>> {
        self.inner.channels().values().cloned().collect()
    }

    pub fn channel(&self, id: Hash) -> Option<Arc<dyn PaymentChannel>> {
        self.inner.channels().get(&id).cloned()
    }

    pub fn channel_tasks(&self, id: Hash) -> Option<ChannelTasks> {
        if !self.inner.channels().contains_key(&id) {
            return None;
        }
        let sup = &self.inner.supervisor;
        let (watcher, updates) = (TaskKey::Watcher(id), TaskKey::UpdateHandler(id));
        Some(ChannelTasks {
            watchers_spawned: sup.spawned(&watcher),
            update_handlers_spawned: sup.spawned(&updates),
            watcher_live: sup.is_live(&watcher),
            update_handler_live: sup.is_live(&updates),
        })
    }

    /// Whether the proposal listener is still serving.
    pub fn is_listening(&self) -> bool {
        self.inner.supervisor.is_live(&TaskKey::ProposalListener)
    }

    /// Stops all tasks and closes the client.
    ///
    /// Tasks get `timeouts.shutdown_grace` to wind down before they are
    /// aborted. Later calls wait until the first one has finished.
    pub async fn shutdown(&self) {
        let first = self.inner.state.send_if_modified(|state| match *state {
            NodeState::Initializing | NodeState::Running => {
                *state = NodeState::ShuttingDown;
                true
            }
            _ => false,
        });
        if !first {
            let mut state = self.inner.state.subscribe();
            let _ = state.wait_for(|s| *s == NodeState::Stopped).await;
            return;
        }
        self.inner.events.emit(NodeEvent::StateChanged {
            state: NodeState::ShuttingDown,
        });

        self.inner
            .supervisor
            .shutdown(self.inner.config.timeouts.shutdown_grace())
            .await;
        self.inner.client.close().await;
        self.inner.channels().clear();

        self.inner.set_state(NodeState::Stopped);
    }
}

impl NodeInner {
    fn ensure_running(&self) -> Result<(), NodeError> {
        match *self.state.borrow() {
            NodeState::Running => Ok(()),
            _ => Err(NodeError::NotRunning),
        }
    }

    fn set_state(&self, state: NodeState) {
        self.state.send_replace(state);
        self.events.emit(NodeEvent::StateChanged { state });
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<Hash, Arc<dyn PaymentChannel>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn accept(self: &Arc<Self>, channel: Arc<dyn PaymentChannel>) -> Result<(), NodeError> {
        let id = channel.id();
        if let Err(e) = self.ensure_running() {
            self.refuse(id, &e);
            return Err(e);
        }
        {
            let mut channels = self.channels();
            if channels.contains_key(&id) {
                drop(channels);
                let e = NodeError::DuplicateChannel(id);
                self.refuse(id, &e);
                return Err(e);
            }
            channels.insert(id, channel.clone());
        }
        self.events.emit(NodeEvent::ChannelAccepted {
            channel: id,
            part_idx: channel.part_idx(),
            peer: channel.peer(),
        });

        let release = Arc::new(ChannelRelease {
            node: Arc::downgrade(self),
            id,
        });
        let watcher = {
            let (channel, events, release) =
                (channel.clone(), self.events.clone(), release.clone());
            async move {
                watch_channel(channel, events).await;
                drop(release);
            }
        };
        let handler = ChannelUpdateHandler::new(
            channel,
            self.update_policy.clone(),
            self.config.timeouts.update(),
            self.events.clone(),
        );
        let updates = async move {
            serve_updates(Arc::new(handler)).await;
            drop(release);
        };
        // Only fails if shutdown started since the check above, or a released
        // channel is accepted again before its old tasks were reaped. The
        // supervisor then drops the futures unpolled, which releases the
        // channel again.
        let spawned = self
            .supervisor
            .spawn(TaskKey::Watcher(id), watcher)
            .and_then(|()| self.supervisor.spawn(TaskKey::UpdateHandler(id), updates));
        spawned.map_err(|e| {
            let e = match e {
                SpawnError::Duplicate(_) => NodeError::DuplicateChannel(id),
                SpawnError::ShuttingDown => NodeError::NotRunning,
            };
            self.refuse(id, &e);
            e
        })
    }

    fn refuse(&self, id: Hash, reason: &NodeError) {
        self.events.emit(NodeEvent::ChannelRefused {
            channel: id,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests;
