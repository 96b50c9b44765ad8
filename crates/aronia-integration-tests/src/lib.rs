//! Shared fixtures for the Aronia integration scenarios.
//!
//! Every scenario runs real nodes over a [`MemoryHub`]: the full frame,
//! session, and admission stack is exercised, with no sockets. Timings
//! are shortened so liveness scenarios finish in milliseconds.

use std::sync::Arc;
use std::time::Duration;

use aronia_crypto::ed25519::KeyPair;
use aronia_crypto::{peer_id_to_hex, PeerId};
use aronia_node::config::NodeConfig;
use aronia_node::events::NodeEvent;
use aronia_node::node::Node;
use aronia_node::swarm::memory::MemoryHub;
use tokio::sync::broadcast;

/// Deterministic keypair for a test peer.
pub fn keypair(seed: u8) -> KeyPair {
    KeyPair::from_bytes(&[seed; 32])
}

/// The peer id of [`keypair`]`(seed)`.
pub fn peer(seed: u8) -> PeerId {
    keypair(seed).peer_id()
}

/// Node configuration with protocol semantics but test-scale timings.
pub fn fast_config() -> NodeConfig {
    NodeConfig {
        heartbeat_interval_ms: 50,
        heartbeat_timeout_ms: 250,
        default_request_timeout_ms: 2_000,
        ..NodeConfig::default()
    }
}

/// A [`fast_config`] whose whitelist admits the given peers.
pub fn config_admitting(peers: &[PeerId]) -> NodeConfig {
    NodeConfig {
        whitelist: peers.iter().map(peer_id_to_hex).collect(),
        ..fast_config()
    }
}

/// Route `tracing` output to the test writer; `RUST_LOG` filters apply.
/// Safe to call from every scenario, first caller wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Start a node with the seed's identity on the hub.
pub async fn start_node(hub: &MemoryHub, seed: u8, topic: &str, config: NodeConfig) -> Node {
    init_tracing();
    let keypair = keypair(seed);
    let swarm = Arc::new(hub.swarm(keypair.peer_id()));
    Node::start(keypair, topic, config, swarm)
        .await
        .expect("node starts")
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the two nodes each see the other's session online.
pub async fn wait_connected(a: &Node, b: &Node) {
    let linked = wait_until(Duration::from_secs(10), || {
        a.peer(&b.peer_id()).is_some_and(|p| p.online)
            && b.peer(&a.peer_id()).is_some_and(|p| p.online)
    })
    .await;
    assert!(linked, "nodes failed to connect in time");
}

/// Receive events until one matches `pred`, panicking on timeout.
pub async fn expect_event<F>(
    rx: &mut broadcast::Receiver<NodeEvent>,
    timeout: Duration,
    mut pred: F,
) -> NodeEvent
where
    F: FnMut(&NodeEvent) -> bool,
{
    let result = tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => break event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("event bus closed before the expected event")
                }
            }
        }
    })
    .await;
    result.expect("expected event did not arrive in time")
}
