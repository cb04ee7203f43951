//! In-process channel client for tests and demos.
//!
//! Nodes find each other through a shared [Network]. Channels are a shared
//! core both participants hold; an update is applied by the peer when it
//! accepts it, so both sides always observe the same state. Nothing is
//! signed and there is no chain: the dispute watch simply ends once the
//! channel is final, or fails when [SimChannel::break_watch] cuts the
//! simulated chain connection.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinSet,
};

use crate::{
    channel::{
        BalanceVector, ChannelProposal, ChannelUpdate, Params, PartIdx, ProposalReply,
        ProposalResponder, State, UpdateReply, UpdateResponder, PARTICIPANTS,
    },
    client::{
        ChannelClient, Connector, PaymentChannel, ProposalHandler, UpdateHandler, Wallet,
    },
    config::NodeConfig,
    error::ClientError,
    Address, Context, Hash,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A wallet that only knows its address.
#[derive(Debug, Clone, Copy)]
pub struct SimWallet(pub Address);

impl SimWallet {
    pub fn random() -> Self {
        SimWallet(rand::random())
    }
}

impl Wallet for SimWallet {
    fn address(&self) -> Address {
        self.0
    }
}

struct Endpoint {
    ip: String,
    port: u16,
    inbox: mpsc::UnboundedSender<InboundProposal>,
}

/// Registry of listening clients, keyed by address.
#[derive(Default)]
pub struct Network {
    endpoints: Mutex<HashMap<Address, Endpoint>>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_registered(&self, address: &Address) -> bool {
        lock(&self.endpoints).contains_key(address)
    }

    fn register(&self, address: Address, endpoint: Endpoint) -> Result<(), ClientError> {
        let mut endpoints = lock(&self.endpoints);
        if endpoints.contains_key(&address) {
            return Err(ClientError::AddressInUse(address));
        }
        endpoints.insert(address, endpoint);
        Ok(())
    }

    fn unregister(&self, address: &Address) {
        lock(&self.endpoints).remove(address);
    }

    /// Returns the inbox of `peer` if it listens at `ip:port`.
    fn dial(
        &self,
        peer: Address,
        ip: &str,
        port: u16,
    ) -> Result<mpsc::UnboundedSender<InboundProposal>, ClientError> {
        match lock(&self.endpoints).get(&peer) {
            Some(e) if e.ip == ip && e.port == port => Ok(e.inbox.clone()),
            _ => Err(ClientError::PeerUnreachable {
                peer,
                address: ip.to_string(),
                port,
            }),
        }
    }
}

/// Creates [SimClient]s on a shared [Network].
pub struct SimConnector {
    network: Arc<Network>,
    deploy_delay: Duration,
    clients: Mutex<HashMap<Address, Arc<SimClient>>>,
}

impl SimConnector {
    pub fn new(network: Arc<Network>) -> Self {
        SimConnector {
            network,
            deploy_delay: Duration::ZERO,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Time spent "deploying" contracts when the config names none.
    pub fn with_deploy_delay(mut self, delay: Duration) -> Self {
        self.deploy_delay = delay;
        self
    }

    /// The client created for `address`, for inspection in tests.
    pub fn client(&self, address: &Address) -> Option<Arc<SimClient>> {
        lock(&self.clients).get(address).cloned()
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(
        &self,
        config: &NodeConfig,
        wallet: &dyn Wallet,
    ) -> Result<Arc<dyn ChannelClient>, ClientError> {
        let address = config.address.unwrap_or_else(|| wallet.address());
        if config.needs_deployment() {
            tokio::time::sleep(self.deploy_delay).await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.network.register(
            address,
            Endpoint {
                ip: config.ip.clone(),
                port: config.port,
                inbox: tx,
            },
        )?;
        let client = Arc::new(SimClient {
            address,
            network: self.network.clone(),
            inbox: Mutex::new(Some(rx)),
            peers: Mutex::new(HashMap::new()),
            dials: Mutex::new(0),
            channels: Arc::new(Mutex::new(HashMap::new())),
            accept_latency: Mutex::new(Duration::ZERO),
            closed: Mutex::new(false),
        });
        lock(&self.clients).insert(address, client.clone());
        Ok(client)
    }
}

struct InboundProposal {
    proposal: ChannelProposal,
    answer: oneshot::Sender<ProposalAnswer>,
}

enum ProposalAnswer {
    Accept(Arc<ChannelCore>),
    Reject(String),
}

type ChannelMap = Arc<Mutex<HashMap<Hash, Arc<SimChannel>>>>;

pub struct SimClient {
    address: Address,
    network: Arc<Network>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<InboundProposal>>>,
    peers: Mutex<HashMap<Address, (String, u16)>>,
    dials: Mutex<usize>,
    channels: ChannelMap,
    accept_latency: Mutex<Duration>,
    closed: Mutex<bool>,
}

impl SimClient {
    pub fn address(&self) -> Address {
        self.address
    }

    /// How often `add_peer` actually had to connect.
    pub fn dial_count(&self) -> usize {
        *lock(&self.dials)
    }

    /// Delays every accept of an inbound proposal by `latency`.
    pub fn set_accept_latency(&self, latency: Duration) {
        *lock(&self.accept_latency) = latency;
    }

    pub fn channel(&self, id: &Hash) -> Option<Arc<SimChannel>> {
        lock(&self.channels).get(id).cloned()
    }

    pub fn is_closed(&self) -> bool {
        *lock(&self.closed)
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChannelClient for SimClient {
    async fn add_peer(&self, peer: Address, address: &str, port: u16) -> Result<(), ClientError> {
        self.ensure_open()?;
        let mut peers = lock(&self.peers);
        if peers.get(&peer).map(|(a, p)| (a.as_str(), *p)) == Some((address, port)) {
            return Ok(());
        }
        self.network.dial(peer, address, port)?;
        peers.insert(peer, (address.to_string(), port));
        *lock(&self.dials) += 1;
        Ok(())
    }

    async fn handle_channel_proposals(
        &self,
        handler: Arc<dyn ProposalHandler>,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        let mut inbox = lock(&self.inbox)
            .take()
            .ok_or(ClientError::AlreadyListening("channel proposals"))?;

        // Proposals in flight are dropped together with the listener.
        let mut pending = JoinSet::new();
        loop {
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(InboundProposal { proposal, answer }) => {
                        let reply = SimProposalReply {
                            proposal,
                            own: self.address,
                            latency: *lock(&self.accept_latency),
                            channels: self.channels.clone(),
                            answer: Some(answer),
                        };
                        let handler = handler.clone();
                        pending.spawn(async move {
                            handler
                                .handle(proposal, ProposalResponder::new(Box::new(reply)))
                                .await
                        });
                    }
                    None => return Ok(()),
                },
                Some(_) = pending.join_next(), if !pending.is_empty() => {}
            }
        }
    }

    async fn propose_channel(
        &self,
        ctx: &Context,
        peer: Address,
        challenge_duration: u64,
        init_bals: BalanceVector,
    ) -> Result<Arc<dyn PaymentChannel>, ClientError> {
        self.ensure_open()?;
        let (ip, port) = lock(&self.peers)
            .get(&peer)
            .cloned()
            .ok_or(ClientError::UnknownPeer(peer))?;
        let inbox = self.network.dial(peer, &ip, port)?;

        let proposal = ChannelProposal {
            proposal_id: rand::random(),
            peer: self.address,
            challenge_duration,
            nonce_share: rand::random(),
            init_bals,
        };
        let (answer, answered) = oneshot::channel();
        inbox
            .send(InboundProposal { proposal, answer })
            .map_err(|_| ClientError::PeerUnreachable {
                peer,
                address: ip,
                port,
            })?;

        let answer = ctx
            .run(async {
                answered.await.map_err(|_| {
                    ClientError::Protocol("peer dropped the proposal unanswered".to_string())
                })
            })
            .await?;
        match answer {
            ProposalAnswer::Accept(core) => {
                let channel = SimChannel::new(core, 0);
                lock(&self.channels).insert(channel.id(), channel.clone());
                Ok(channel)
            }
            ProposalAnswer::Reject(reason) => Err(ClientError::Rejected(reason)),
        }
    }

    async fn close(&self) {
        let mut closed = lock(&self.closed);
        if !*closed {
            *closed = true;
            self.network.unregister(&self.address);
        }
    }
}

struct SimProposalReply {
    proposal: ChannelProposal,
    own: Address,
    latency: Duration,
    channels: ChannelMap,
    answer: Option<oneshot::Sender<ProposalAnswer>>,
}

impl SimProposalReply {
    fn send(&mut self, answer: ProposalAnswer) -> Result<(), ClientError> {
        self.answer
            .take()
            .ok_or_else(|| ClientError::Protocol("proposal already answered".to_string()))?
            .send(answer)
            .map_err(|_| ClientError::Protocol("proposer stopped waiting".to_string()))
    }
}

#[async_trait]
impl ProposalReply for SimProposalReply {
    async fn accept(&mut self) -> Result<Arc<dyn PaymentChannel>, ClientError> {
        tokio::time::sleep(self.latency).await;
        let p = &self.proposal;
        let params = Params::new(
            p.challenge_duration,
            [p.nonce_share, rand::random()],
            [p.peer, self.own],
        );
        let core = ChannelCore::new(params, p.init_bals);
        self.send(ProposalAnswer::Accept(core.clone()))?;

        let channel = SimChannel::new(core, 1);
        lock(&self.channels).insert(channel.id(), channel.clone());
        Ok(channel)
    }

    async fn reject(&mut self, reason: &str) -> Result<(), ClientError> {
        self.send(ProposalAnswer::Reject(reason.to_string()))
    }
}

struct UpdateRequest {
    update: ChannelUpdate,
    answer: oneshot::Sender<Result<(), String>>,
}

/// What both participants of a channel share.
struct ChannelCore {
    params: Params,
    state: watch::Sender<State>,
    /// Serializes updates proposed by either side.
    updating: tokio::sync::Mutex<()>,
    /// Update inboxes, by participant index.
    outboxes: [mpsc::UnboundedSender<UpdateRequest>; PARTICIPANTS],
    inboxes: [Mutex<Option<mpsc::UnboundedReceiver<UpdateRequest>>>; PARTICIPANTS],
}

impl ChannelCore {
    fn new(params: Params, init_bals: BalanceVector) -> Arc<Self> {
        let (state, _) = watch::channel(State::new(&params, init_bals));
        let (tx0, rx0) = mpsc::unbounded_channel();
        let (tx1, rx1) = mpsc::unbounded_channel();
        Arc::new(ChannelCore {
            params,
            state,
            updating: tokio::sync::Mutex::new(()),
            outboxes: [tx0, tx1],
            inboxes: [Mutex::new(Some(rx0)), Mutex::new(Some(rx1))],
        })
    }

    fn apply(&self, next: State) -> Result<(), ClientError> {
        let mut res = Ok(());
        self.state.send_if_modified(|current| {
            res = current.check_transition(&next);
            if res.is_ok() {
                *current = next;
            }
            res.is_ok()
        });
        Ok(res?)
    }
}

/// One participant's handle on a simulated channel.
pub struct SimChannel {
    core: Arc<ChannelCore>,
    part_idx: PartIdx,
    chain_lost: watch::Sender<bool>,
}

impl SimChannel {
    fn new(core: Arc<ChannelCore>, part_idx: PartIdx) -> Arc<Self> {
        let (chain_lost, _) = watch::channel(false);
        Arc::new(SimChannel {
            core,
            part_idx,
            chain_lost,
        })
    }

    /// Cuts this participant's simulated chain connection, failing its watch.
    pub fn break_watch(&self) {
        self.chain_lost.send_replace(true);
    }
}

#[async_trait]
impl PaymentChannel for SimChannel {
    fn id(&self) -> Hash {
        self.core.params.channel_id()
    }

    fn part_idx(&self) -> PartIdx {
        self.part_idx
    }

    fn params(&self) -> Params {
        self.core.params
    }

    fn state(&self) -> State {
        *self.core.state.borrow()
    }

    async fn watch(&self) -> Result<(), ClientError> {
        let mut state = self.core.state.subscribe();
        let mut chain_lost = self.chain_lost.subscribe();
        tokio::select! {
            biased;
            _ = chain_lost.wait_for(|lost| *lost) => {
                Err(ClientError::Protocol("lost connection to the chain".to_string()))
            }
            concluded = finalized(&mut state) => if concluded {
                Ok(())
            } else {
                Err(ClientError::ChannelClosed(self.id()))
            },
        }
    }

    async fn handle_updates(&self, handler: Arc<dyn UpdateHandler>) -> Result<(), ClientError> {
        let mut inbox = lock(&self.core.inboxes[self.part_idx])
            .take()
            .ok_or(ClientError::AlreadyListening("channel updates"))?;
        let mut state = self.core.state.subscribe();
        loop {
            let request = tokio::select! {
                biased;
                _ = finalized(&mut state) => return Ok(()),
                req = inbox.recv() => match req {
                    Some(req) => req,
                    None => return Err(ClientError::ChannelClosed(self.id())),
                },
            };
            let next = request.update.state;
            let reply = SimUpdateReply {
                core: self.core.clone(),
                next,
                answer: Some(request.answer),
            };
            handler
                .handle(request.update, UpdateResponder::new(Box::new(reply)))
                .await;
        }
    }

    async fn update(&self, ctx: &Context, next: State) -> Result<(), ClientError> {
        let _updating = ctx
            .run(async { Ok::<_, ClientError>(self.core.updating.lock().await) })
            .await?;
        self.state().check_transition(&next)?;

        let (answer, answered) = oneshot::channel();
        let request = UpdateRequest {
            update: ChannelUpdate {
                state: next,
                actor_idx: self.part_idx,
            },
            answer,
        };
        let peer = 1 - self.part_idx;
        self.core.outboxes[peer]
            .send(request)
            .map_err(|_| ClientError::ChannelClosed(self.id()))?;

        let answer = ctx
            .run(async {
                answered.await.map_err(|_| {
                    ClientError::Protocol("peer dropped the update unanswered".to_string())
                })
            })
            .await?;
        answer.map_err(ClientError::UpdateRejected)
    }
}

/// Resolves once the state is final. `false` if the channel core is gone.
async fn finalized(state: &mut watch::Receiver<State>) -> bool {
    state.wait_for(|s| s.is_final).await.is_ok()
}

struct SimUpdateReply {
    core: Arc<ChannelCore>,
    next: State,
    answer: Option<oneshot::Sender<Result<(), String>>>,
}

impl SimUpdateReply {
    fn send(&mut self, answer: Result<(), String>) -> Result<(), ClientError> {
        self.answer
            .take()
            .ok_or_else(|| ClientError::Protocol("update already answered".to_string()))?
            .send(answer)
            .map_err(|_| ClientError::Protocol("proposer stopped waiting".to_string()))
    }
}

#[async_trait]
impl UpdateReply for SimUpdateReply {
    async fn accept(&mut self) -> Result<(), ClientError> {
        self.core.apply(self.next)?;
        self.send(Ok(()))
    }

    async fn reject(&mut self, reason: &str) -> Result<(), ClientError> {
        self.send(Err(reason.to_string()))
    }
}
