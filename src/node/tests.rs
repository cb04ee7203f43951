use std::{sync::Arc, time::Duration};

use super::*;
use crate::{
    channel::ChannelProposal,
    error::{ClientError, ContextError},
    events::RecordingSink,
    handler::Decision,
    sim::{Network, SimConnector, SimWallet},
};

const WAIT: Duration = Duration::from_secs(5);

struct Peer {
    node: Node,
    events: Arc<RecordingSink>,
    port: u16,
}

fn config(alias: &str, port: u16) -> NodeConfig {
    let mut config = NodeConfig::new(alias, "ws://127.0.0.1:8545");
    config.port = port;
    config
}

async fn start_with(
    connector: &SimConnector,
    config: NodeConfig,
    build: impl FnOnce(NodeBuilder) -> NodeBuilder,
) -> Peer {
    let events = RecordingSink::new();
    let port = config.port;
    let node = build(NodeBuilder::new(config).events(events.clone()))
        .build(connector, &SimWallet::random())
        .await
        .unwrap();
    Peer { node, events, port }
}

async fn start(connector: &SimConnector, alias: &str, port: u16) -> Peer {
    start_with(connector, config(alias, port), |b| b).await
}

/// Polls `cond` until it holds or [WAIT] passed.
async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn open(alice: &Peer, bob: &Peer) -> Hash {
    let channel = alice
        .node
        .propose(bob.node.address(), BalanceVector::new(2000, 1000), "127.0.0.1", bob.port)
        .await
        .unwrap();
    let id = channel.id();
    accepted(bob, id).await;
    id
}

async fn accepted(peer: &Peer, id: Hash) {
    peer.events
        .wait_for(WAIT, |e| {
            matches!(e, NodeEvent::ChannelAccepted { channel, .. } if *channel == id)
        })
        .await
        .unwrap();
}

fn one_of_each(node: &Node, id: Hash) -> bool {
    matches!(
        node.channel_tasks(id),
        Some(ChannelTasks {
            watchers_spawned: 1,
            update_handlers_spawned: 1,
            ..
        })
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn channel_lifecycle() {
    let connector = SimConnector::new(Network::new());
    let alice = start(&connector, "Alice", 5750).await;
    let bob = start(&connector, "Bob", 5751).await;
    assert_eq!(alice.node.state(), NodeState::Running);

    let id = open(&alice, &bob).await;
    let (a, b) = (alice.node.channel(id).unwrap(), bob.node.channel(id).unwrap());
    assert_eq!(a.state().version(), 0);
    assert_eq!(b.state().version(), 0);
    assert_eq!((a.part_idx(), b.part_idx()), (0, 1));
    assert_eq!(a.peer(), bob.node.address());
    assert!(one_of_each(&alice.node, id));
    assert!(one_of_each(&bob.node, id));

    alice.node.send(id, 100u64).await.unwrap();
    for channel in [&a, &b] {
        assert_eq!(channel.state().version(), 1);
        assert_eq!(channel.state().balances, BalanceVector::new(1900, 1100));
    }
    bob.events
        .wait_for(WAIT, |e| matches!(e, NodeEvent::UpdateAccepted { version: 1, .. }))
        .await
        .unwrap();

    alice.node.settle(id).await.unwrap();
    assert!(a.state().is_final);
    assert!(b.state().is_final);
    for peer in [&alice, &bob] {
        peer.events
            .wait_for(WAIT, |e| matches!(e, NodeEvent::WatchStopped { channel } if *channel == id))
            .await
            .unwrap();
        assert_eq!(peer.events.count(|e| matches!(e, NodeEvent::WatchFailed { .. })), 0);
        // Concluded channels are released once both tasks are done.
        assert!(eventually(|| peer.node.channel(id).is_none()).await);
        assert!(peer.node.channel_tasks(id).is_none());
        assert!(peer.node.channels().is_empty());
        assert!(matches!(
            peer.node.send(id, 1u64).await,
            Err(NodeError::UnknownChannel(_))
        ));
        // Finished tasks are never restarted.
        assert_eq!(
            peer.events.count(|e| {
                matches!(e, NodeEvent::WatchStarted { channel } if *channel == id)
            }),
            1
        );
    }

    alice.node.shutdown().await;
    bob.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_accept_is_refused() {
    let connector = SimConnector::new(Network::new());
    let alice = start(&connector, "Alice", 5750).await;
    let bob = start(&connector, "Bob", 5751).await;
    let id = open(&alice, &bob).await;

    let channel = alice.node.channel(id).unwrap();
    assert!(matches!(
        alice.node.accept(channel),
        Err(NodeError::DuplicateChannel(dup)) if dup == id
    ));
    assert_eq!(
        alice.events.count(|e| matches!(e, NodeEvent::ChannelRefused { .. })),
        1
    );
    assert!(one_of_each(&alice.node, id));
    assert_eq!(alice.node.channels().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overspending_is_refused_locally() {
    let connector = SimConnector::new(Network::new());
    let alice = start(&connector, "Alice", 5750).await;
    let bob = start(&connector, "Bob", 5751).await;
    let id = open(&alice, &bob).await;

    assert!(matches!(
        bob.node.send(id, 1001u64).await,
        Err(NodeError::InsufficientFunds { .. })
    ));
    assert!(matches!(
        bob.node.send(Hash::default(), 1u64).await,
        Err(NodeError::UnknownChannel(_))
    ));

    bob.node.send(id, 1000u64).await.unwrap();
    let state = alice.node.channel(id).unwrap().state();
    assert_eq!(state.balances, BalanceVector::new(3000, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_update_leaves_state() {
    struct Never;
    impl UpdatePolicy for Never {
        fn decide(&self, _: &State, _: &crate::channel::ChannelUpdate) -> Decision {
            Decision::Reject("no".into())
        }
    }

    let connector = SimConnector::new(Network::new());
    let alice = start(&connector, "Alice", 5750).await;
    let bob = start_with(&connector, config("Bob", 5751), |b| b.update_policy(Never)).await;
    let id = open(&alice, &bob).await;

    let err = alice.node.send(id, 10u64).await.unwrap_err();
    assert!(matches!(
        err,
        NodeError::Channel {
            source: ClientError::UpdateRejected(_),
            ..
        }
    ));
    assert_eq!(alice.node.channel(id).unwrap().state().version(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_proposal_opens_nothing() {
    let connector = SimConnector::new(Network::new());
    let alice = start(&connector, "Alice", 5750).await;
    let bob = start_with(&connector, config("Bob", 5751), |b| {
        b.proposal_policy(|p: &ChannelProposal| {
            if p.init_bals.balance(1) > U256::from(500u64) {
                Decision::Reject("too much".into())
            } else {
                Decision::Accept
            }
        })
    })
    .await;

    let res = alice
        .node
        .propose(bob.node.address(), BalanceVector::new(2000, 1000), "127.0.0.1", 5751)
        .await;
    assert!(matches!(
        res,
        Err(NodeError::Propose {
            source: ClientError::Rejected(_),
            ..
        })
    ));
    bob.events
        .wait_for(WAIT, |e| matches!(e, NodeEvent::ProposalRejected { .. }))
        .await
        .unwrap();
    assert!(alice.node.channels().is_empty());
    assert!(bob.node.channels().is_empty());
}

#[tokio::test(start_paused = true)]
async fn proposal_timeout_opens_nothing() {
    let connector = SimConnector::new(Network::new());
    let alice = start(&connector, "Alice", 5750).await;
    let mut bob_config = config("Bob", 5751);
    bob_config.timeouts.proposal = 1;
    let bob = start_with(&connector, bob_config, |b| b).await;
    connector
        .client(&bob.node.address())
        .unwrap()
        .set_accept_latency(Duration::from_secs(2));

    let res = alice
        .node
        .propose(bob.node.address(), BalanceVector::new(2000, 1000), "127.0.0.1", 5751)
        .await;
    assert!(matches!(res, Err(NodeError::Propose { .. })));
    assert_eq!(
        bob.events.count(|e| matches!(e, NodeEvent::ProposalFailed { .. })),
        1
    );
    for peer in [&alice, &bob] {
        assert!(peer.node.channels().is_empty());
        assert_eq!(
            peer.events.count(|e| matches!(e, NodeEvent::WatchStarted { .. })),
            0
        );
    }
    // The listener survives a failed proposal.
    assert!(bob.node.is_listening());
}

#[tokio::test]
async fn unreachable_peer_opens_nothing() {
    let connector = SimConnector::new(Network::new());
    let alice = start(&connector, "Alice", 5750).await;
    let bob = start(&connector, "Bob", 5751).await;

    let stranger = SimWallet::random().0;
    for (peer, port) in [(stranger, 5752), (bob.node.address(), 6000)] {
        let res = alice
            .node
            .propose(peer, BalanceVector::new(2000, 1000), "127.0.0.1", port)
            .await;
        assert!(matches!(
            res,
            Err(NodeError::AddPeer {
                source: ClientError::PeerUnreachable { .. },
                ..
            })
        ));
    }
    assert!(alice.node.channels().is_empty());
    assert_eq!(
        bob.events.count(|e| matches!(e, NodeEvent::ProposalReceived { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn slow_setup_fails_construction() {
    let network = Network::new();
    let connector = SimConnector::new(network.clone()).with_deploy_delay(Duration::from_secs(60));
    let wallet = SimWallet::random();
    let mut config = config("Alice", 5750);
    config.timeouts.setup = 1;

    let res = Node::new(&connector, config, &wallet).await;
    assert!(matches!(
        res,
        Err(NodeError::Construction(ClientError::Context(
            ContextError::DeadlineExceeded
        )))
    ));
    assert!(!network.is_registered(&wallet.0));
}

#[tokio::test]
async fn invalid_config_fails_before_connecting() {
    let network = Network::new();
    let connector = SimConnector::new(network.clone());
    let wallet = SimWallet::random();

    let res = Node::new(&connector, config("", 5750), &wallet).await;
    assert!(matches!(res, Err(NodeError::Config(_))));
    assert!(!network.is_registered(&wallet.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_failure_is_contained() {
    let connector = SimConnector::new(Network::new());
    let alice = start(&connector, "Alice", 5750).await;
    let bob = start(&connector, "Bob", 5751).await;
    let broken = open(&alice, &bob).await;
    let healthy = open(&alice, &bob).await;
    assert_ne!(broken, healthy);

    connector
        .client(&alice.node.address())
        .unwrap()
        .channel(&broken)
        .unwrap()
        .break_watch();
    alice
        .events
        .wait_for(WAIT, |e| {
            matches!(e, NodeEvent::WatchFailed { channel, .. } if *channel == broken)
        })
        .await
        .unwrap();

    assert_eq!(alice.node.state(), NodeState::Running);
    let tasks = alice.node.channel_tasks(healthy).unwrap();
    assert!(tasks.watcher_live && tasks.update_handler_live);
    // Updates on the broken channel are still served.
    assert!(alice.node.channel_tasks(broken).unwrap().update_handler_live);
    alice.node.send(healthy, 1u64).await.unwrap();
    alice.node.send(broken, 1u64).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_everything_once() {
    let connector = SimConnector::new(Network::new());
    let alice = start(&connector, "Alice", 5750).await;
    let bob = start(&connector, "Bob", 5751).await;
    let id = open(&alice, &bob).await;
    assert!(alice.node.is_listening());

    tokio::join!(alice.node.shutdown(), alice.node.shutdown());
    alice.node.shutdown().await;

    assert_eq!(alice.node.state(), NodeState::Stopped);
    assert!(!alice.node.is_listening());
    assert!(alice.node.channel_tasks(id).is_none());
    assert!(connector.client(&alice.node.address()).unwrap().is_closed());
    assert_eq!(
        alice.events.count(|e| matches!(
            e,
            NodeEvent::StateChanged {
                state: NodeState::Stopped
            }
        )),
        1
    );
    assert!(matches!(
        alice
            .node
            .propose(bob.node.address(), BalanceVector::new(1, 1), "127.0.0.1", 5751)
            .await,
        Err(NodeError::NotRunning)
    ));

    // The peer notices nothing until it talks to us.
    assert_eq!(bob.node.state(), NodeState::Running);
    tokio::time::timeout(WAIT, bob.node.shutdown()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_proposals_both_open() {
    let connector = SimConnector::new(Network::new());
    let alice = start(&connector, "Alice", 5750).await;
    let bob = start(&connector, "Bob", 5751).await;
    let carol = start(&connector, "Carol", 5752).await;

    let bals = BalanceVector::new(500, 500);
    let (a, c) = tokio::join!(
        alice
            .node
            .propose(bob.node.address(), bals, "127.0.0.1", bob.port),
        carol
            .node
            .propose(bob.node.address(), bals, "127.0.0.1", bob.port),
    );
    let (a, c) = (a.unwrap().id(), c.unwrap().id());
    assert_ne!(a, c);

    for id in [a, c] {
        accepted(&bob, id).await;
        assert!(one_of_each(&bob.node, id));
    }
    assert_eq!(bob.node.channels().len(), 2);
    assert_eq!(bob.node.channel(a).unwrap().peer(), alice.node.address());
    assert_eq!(bob.node.channel(c).unwrap().peer(), carol.node.address());
    assert!(one_of_each(&alice.node, a));
    assert!(one_of_each(&carol.node, c));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn channel_after_shutdown_is_refused() {
    let connector = SimConnector::new(Network::new());
    let alice = start(&connector, "Alice", 5750).await;
    let bob = start(&connector, "Bob", 5751).await;
    let id = open(&alice, &bob).await;
    let channel = bob.node.channel(id).unwrap();

    bob.node.shutdown().await;
    assert!(matches!(bob.node.accept(channel), Err(NodeError::NotRunning)));
    assert_eq!(
        bob.events.count(|e| matches!(
            e,
            NodeEvent::ChannelRefused { channel, .. } if *channel == id
        )),
        1
    );
    assert!(bob.node.channels().is_empty());
    assert!(bob.node.channel_tasks(id).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn huge_timeouts_are_accepted() {
    let connector = SimConnector::new(Network::new());
    let huge = |alias: &str, port: u16| {
        NodeConfig::from_toml_str(&format!(
            "alias = \"{alias}\"\neth_node_url = \"ws://x\"\nport = {port}\n\
             [timeouts]\nsetup = {max}\npropose = {max}\nproposal = {max}\nupdate = {max}",
            max = i64::MAX,
        ))
        .unwrap()
    };
    let alice = start_with(&connector, huge("Alice", 5750), |b| b).await;
    let bob = start_with(&connector, huge("Bob", 5751), |b| b).await;

    let id = open(&alice, &bob).await;
    alice.node.send(id, 100u64).await.unwrap();
    assert_eq!(
        bob.node.channel(id).unwrap().state().balances,
        BalanceVector::new(1900, 1100)
    );
}
