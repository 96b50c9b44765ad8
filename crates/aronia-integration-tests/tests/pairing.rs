//! Integration test: two-node pairing, capability exchange, and RPC.
//!
//! Exercises the full stack between two nodes on one topic:
//! 1. Mutual whitelisting converges to live sessions on both sides
//! 2. Capability frames replace the empty defaults within the window
//! 3. Request/response round-trips, including the built-in `ping`
//! 4. Request deadlines fire independently of the session
//! 5. Late responses after a deadline are discarded silently
//! 6. Fire-and-forget messages surface on the remote event bus
//! 7. Broadcast counts transported and offline peers
//! 8. A stranger's connection is rejected and surfaced

use std::time::Duration;

use aronia_integration_tests::{
    config_admitting, expect_event, fast_config, peer, start_node, wait_connected, wait_until,
};
use aronia_node::events::NodeEvent;
use aronia_node::swarm::memory::MemoryHub;
use aronia_node::NodeError;

#[tokio::test]
async fn pairing_and_capability_exchange() {
    let hub = MemoryHub::new();
    let node_a = start_node(&hub, 1, "agents", config_admitting(&[peer(2)])).await;
    let node_b = start_node(&hub, 2, "agents", config_admitting(&[peer(1)])).await;

    wait_connected(&node_a, &node_b).await;

    // Capabilities converge on both sides.
    let converged = wait_until(Duration::from_secs(10), || {
        let a_sees = node_a.peer(&node_b.peer_id());
        let b_sees = node_b.peer(&node_a.peer_id());
        a_sees.is_some_and(|p| p.capabilities.agent == "aronia" && p.capabilities.version == "0.1.0")
            && b_sees
                .is_some_and(|p| p.capabilities.agent == "aronia" && p.capabilities.version == "0.1.0")
    })
    .await;
    assert!(converged, "capabilities did not converge");

    let snapshot = node_a.peer(&node_b.peer_id()).expect("peer snapshot");
    assert!(snapshot.online);
    assert!(snapshot.connected_at_ms > 0);

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn request_round_trip() {
    let hub = MemoryHub::new();
    let node_a = start_node(&hub, 1, "rpc", config_admitting(&[peer(2)])).await;
    let node_b = start_node(&hub, 2, "rpc", config_admitting(&[peer(1)])).await;
    wait_connected(&node_a, &node_b).await;

    node_b.register_method("echo", |params, _peer| async move { Ok(params) });

    let result = node_a
        .request(&node_b.peer_id(), "echo", serde_json::json!({"n": 7}), Some(1_000))
        .await
        .expect("echo resolves");
    assert_eq!(result, serde_json::json!({"n": 7}));

    // The built-in ping works without registration.
    let pong = node_a
        .request(&node_b.peer_id(), "ping", serde_json::Value::Null, Some(1_000))
        .await
        .expect("ping resolves");
    assert_eq!(pong["pong"], true);

    // Unknown methods answer with a remote error, not a timeout.
    let err = node_a
        .request(&node_b.peer_id(), "nope", serde_json::Value::Null, Some(1_000))
        .await
        .expect_err("must fail");
    assert!(
        matches!(err, NodeError::Remote { ref code, .. } if code == "method-not-found"),
        "unexpected error: {err}"
    );

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn request_timeout_discards_late_response() {
    let hub = MemoryHub::new();
    let node_a = start_node(&hub, 1, "slowrpc", config_admitting(&[peer(2)])).await;
    let node_b = start_node(&hub, 2, "slowrpc", config_admitting(&[peer(1)])).await;
    wait_connected(&node_a, &node_b).await;

    // The handler answers well past the caller's deadline.
    node_b.register_method("sleep", |_params, _peer| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(serde_json::json!("finally"))
    });

    let err = node_a
        .request(&node_b.peer_id(), "sleep", serde_json::Value::Null, Some(100))
        .await
        .expect_err("must time out");
    assert!(matches!(err, NodeError::RequestTimeout(100)));

    // Wait out the late response; the session must survive it and keep
    // serving new requests.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let pong = node_a
        .request(&node_b.peer_id(), "ping", serde_json::Value::Null, Some(1_000))
        .await
        .expect("session still serves requests");
    assert_eq!(pong["pong"], true);

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn send_surfaces_message_event() {
    let hub = MemoryHub::new();
    let node_a = start_node(&hub, 1, "msg", config_admitting(&[peer(2)])).await;
    let node_b = start_node(&hub, 2, "msg", config_admitting(&[peer(1)])).await;
    wait_connected(&node_a, &node_b).await;

    let mut events_b = node_b.events();
    node_a
        .send(&node_b.peer_id(), &serde_json::json!({"kind": "greeting", "text": "hello"}))
        .await
        .expect("send succeeds");

    let event = expect_event(&mut events_b, Duration::from_secs(5), |e| {
        matches!(e, NodeEvent::MessageReceived { .. })
    })
    .await;
    let NodeEvent::MessageReceived { from, payload } = event else {
        unreachable!()
    };
    assert_eq!(from, node_a.peer_id());
    assert_eq!(payload["text"], "hello");

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn broadcast_counts_outcomes() {
    let hub = MemoryHub::new();
    let node_a = start_node(&hub, 1, "bcast", config_admitting(&[peer(2), peer(3)])).await;
    let node_b = start_node(&hub, 2, "bcast", config_admitting(&[peer(1)])).await;
    let node_c = start_node(&hub, 3, "bcast", config_admitting(&[peer(1)])).await;
    wait_connected(&node_a, &node_b).await;
    wait_connected(&node_a, &node_c).await;

    let outcome = node_a
        .broadcast(&serde_json::json!({"tick": 1}))
        .await
        .expect("broadcast runs");
    assert_eq!(outcome.sent, 2);
    assert_eq!(outcome.offline, 0);

    node_a.stop().await;
    let outcome = node_a
        .broadcast(&serde_json::json!({"tick": 2}))
        .await
        .expect("broadcast runs");
    assert_eq!(outcome.sent, 0, "no peers after stop");

    node_b.stop().await;
    node_c.stop().await;
}

#[tokio::test]
async fn stranger_is_rejected() {
    let hub = MemoryHub::new();
    // A admits nobody; the stranger admits A.
    let node_a = start_node(&hub, 1, "gate", fast_config()).await;
    let mut events_a = node_a.events();
    let stranger = start_node(&hub, 9, "gate", config_admitting(&[peer(1)])).await;

    let event = expect_event(&mut events_a, Duration::from_secs(5), |e| {
        matches!(e, NodeEvent::PeerRejected { .. })
    })
    .await;
    let NodeEvent::PeerRejected { pubkey, reason } = event else {
        unreachable!()
    };
    assert_eq!(pubkey, stranger.peer_id());
    assert!(reason.contains("whitelisted"));
    assert!(node_a.peers().is_empty());

    node_a.stop().await;
    stranger.stop().await;
}
