//! In-process swarm for tests and single-process deployments.
//!
//! A [`MemoryHub`] is the rendezvous: every [`MemorySwarm`] registered on
//! it pairs with the other members of a topic, the way a real DHT would
//! pair announcers with searchers. Each pair gets a relay-backed duplex
//! link with the same channel semantics as a network stream: bounded
//! outbound capacity (backpressure), ordered delivery, close on drop.
//!
//! The hub can silently sever a link to simulate a partition: frames keep
//! being accepted from the sender and are dropped on the floor, and
//! neither side observes a stream close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use aronia_crypto::PeerId;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{JoinOptions, PeerStream, Swarm, WRITE_QUEUE_DEPTH};
use crate::{lock, NodeError, Result};

/// Depth of each member's connection queue.
const CONNECTION_QUEUE_DEPTH: usize = 64;

/// The shared rendezvous for a set of in-process swarms.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    topics: HashMap<[u8; 32], Vec<Registration>>,
    severed: HashMap<(PeerId, PeerId), Arc<AtomicBool>>,
}

#[derive(Clone)]
struct Registration {
    peer: PeerId,
    options: JoinOptions,
    connections: mpsc::Sender<PeerStream>,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a swarm endpoint for a node identified by `local`.
    pub fn swarm(&self, local: PeerId) -> MemorySwarm {
        MemorySwarm {
            hub: self.clone(),
            local,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Silently sever the link between two peers: frames keep flowing in
    /// and are dropped, neither side sees a close. Affects current and
    /// future links between the pair.
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        let mut state = lock(&self.state);
        severed_flag(&mut state, *a, *b).store(true, Ordering::Relaxed);
    }

    /// Undo [`sever`](Self::sever) for the pair.
    pub fn restore(&self, a: &PeerId, b: &PeerId) {
        let mut state = lock(&self.state);
        severed_flag(&mut state, *a, *b).store(false, Ordering::Relaxed);
    }

    /// Form a fresh link between two currently registered peers, as a DHT
    /// query after an accepted introduction would. Returns `false` if
    /// either peer is not registered on a common topic.
    pub fn connect(&self, a: &PeerId, b: &PeerId) -> bool {
        let mut state = lock(&self.state);
        let mut found = None;
        for members in state.topics.values() {
            let reg_a = members.iter().find(|r| r.peer == *a);
            let reg_b = members.iter().find(|r| r.peer == *b);
            if let (Some(reg_a), Some(reg_b)) = (reg_a, reg_b) {
                found = Some((reg_a.clone(), reg_b.clone()));
                break;
            }
        }
        let Some((reg_a, reg_b)) = found else {
            return false;
        };
        let severed = severed_flag(&mut state, *a, *b);
        let (stream_a, stream_b) = link(reg_a.peer, reg_b.peer, severed);
        reg_a.connections.try_send(stream_a).is_ok() && reg_b.connections.try_send(stream_b).is_ok()
    }
}

/// One node's endpoint on a [`MemoryHub`].
pub struct MemorySwarm {
    hub: MemoryHub,
    local: PeerId,
    destroyed: AtomicBool,
}

#[async_trait]
impl Swarm for MemorySwarm {
    async fn join(
        &self,
        topic: [u8; 32],
        options: JoinOptions,
    ) -> Result<mpsc::Receiver<PeerStream>> {
        if self.destroyed.load(Ordering::Relaxed) {
            return Err(NodeError::Swarm("swarm destroyed".to_string()));
        }

        let (conn_tx, conn_rx) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        let mut state = lock(&self.hub.state);
        let existing = state.topics.entry(topic).or_default().clone();
        state.topics.entry(topic).or_default().push(Registration {
            peer: self.local,
            options,
            connections: conn_tx.clone(),
        });

        for other in existing {
            if other.peer == self.local {
                continue;
            }
            let pairable = (options.search && other.options.announce)
                || (options.announce && other.options.search);
            if !pairable {
                continue;
            }
            let severed = severed_flag(&mut state, self.local, other.peer);
            let (mine, theirs) = link(self.local, other.peer, severed);
            let _ = other.connections.try_send(theirs);
            let _ = conn_tx.try_send(mine);
            tracing::debug!(
                local = %hex::encode(self.local),
                remote = %hex::encode(other.peer),
                "memory swarm paired"
            );
        }

        Ok(conn_rx)
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut state = lock(&self.hub.state);
        for members in state.topics.values_mut() {
            members.retain(|r| r.peer != self.local);
        }
    }
}

/// Key the severed map by the unordered pair.
fn pair_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn severed_flag(state: &mut HubState, a: PeerId, b: PeerId) -> Arc<AtomicBool> {
    state
        .severed
        .entry(pair_key(a, b))
        .or_insert_with(|| Arc::new(AtomicBool::new(false)))
        .clone()
}

/// Build a relay-backed duplex link between `a` and `b`.
fn link(a: PeerId, b: PeerId, severed: Arc<AtomicBool>) -> (PeerStream, PeerStream) {
    let (a_out_tx, a_out_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let (a_in_tx, a_in_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let (b_out_tx, b_out_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let (b_in_tx, b_in_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

    spawn_relay(a_out_rx, b_in_tx, severed.clone());
    spawn_relay(b_out_rx, a_in_tx, severed);

    (
        PeerStream {
            remote_static_key: b,
            incoming: a_in_rx,
            outgoing: a_out_tx,
        },
        PeerStream {
            remote_static_key: a,
            incoming: b_in_rx,
            outgoing: b_out_tx,
        },
    )
}

fn spawn_relay(
    mut rx: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Vec<u8>>,
    severed: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if severed.load(Ordering::Relaxed) {
                // Partitioned: accept and drop, like a black-holed route.
                continue;
            }
            if tx.send(frame).await.is_err() {
                break;
            }
        }
    });
}
