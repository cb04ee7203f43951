//! Walkthrough: two nodes on the simulated client open a channel, make a
//! payment and settle it.
//!
//! Run with `RUST_LOG=debug` to see every task start and stop.

use std::time::Duration;

use perun_node::{
    channel::BalanceVector,
    config::NodeConfig,
    logging::{init_logging, LogFormat},
    sim::{Network, SimConnector, SimWallet},
    Node,
};

const PARTICIPANTS: [(&str, u16); 2] = [("Alice", 5750), ("Bob", 5751)];
// Alice funds the channel with 2000, Bob with 1000.
const INIT_BALS: (u64, u64) = (2000, 1000);
const PAYMENT: u64 = 100;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = init_logging(LogFormat::Human, "info");

    let connector = SimConnector::new(Network::new());
    let mut nodes = Vec::new();
    for (alias, port) in PARTICIPANTS {
        let mut config = NodeConfig::new(alias, "ws://127.0.0.1:8545");
        config.port = port;
        nodes.push(Node::new(&connector, config, &SimWallet::random()).await?);
    }
    let (alice, bob) = (&nodes[0], &nodes[1]);

    let channel = alice
        .propose(
            bob.address(),
            BalanceVector::new(INIT_BALS.0, INIT_BALS.1),
            &bob.config().ip,
            bob.config().port,
        )
        .await?;
    let id = channel.id();
    println!("Alice opened {id} with {}", channel.state().balances);

    alice.send(id, PAYMENT).await?;
    println!("Alice paid {PAYMENT}: {}", channel.state().balances);

    alice.settle(id).await?;
    println!("Final state: {:?}", channel.state());

    // Give the watchers a moment to notice the final state.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for node in &nodes {
        node.shutdown().await;
    }
    Ok(())
}
