//! Swarm abstraction.
//!
//! `Swarm` is the single seam between the node and whatever DHT library
//! provides discovery, NAT traversal, and authenticated encrypted duplex
//! streams (an in-memory hub for tests, a real Kademlia swarm in
//! production). The caller constructs the concrete implementation and
//! hands it to the node in an `Arc`.
//!
//! A connection is a [`PeerStream`]: the swarm has already completed the
//! transport handshake and verified that the remote holds the private key
//! for `remote_static_key`. Frames travel whole and in order; the swarm
//! owns message boundaries.

pub mod memory;

use aronia_crypto::PeerId;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// Depth of the per-stream outbound channel. A full channel is the
/// transport's "not writable" signal; freed capacity is its drain event.
pub const WRITE_QUEUE_DEPTH: usize = 64;

/// Options for joining a topic.
#[derive(Clone, Copy, Debug)]
pub struct JoinOptions {
    /// Announce our presence under the topic key.
    pub announce: bool,
    /// Search for other announcers under the topic key.
    pub search: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            announce: true,
            search: true,
        }
    }
}

/// An authenticated, encrypted, ordered duplex stream to one remote peer.
pub struct PeerStream {
    /// The remote's verified static public key.
    pub remote_static_key: PeerId,
    /// Whole inbound frames, in arrival order. `None` means the stream
    /// closed.
    pub incoming: mpsc::Receiver<Vec<u8>>,
    /// Outbound frames. `try_send` is the non-blocking write attempt;
    /// waiting for capacity parks until the transport drains.
    pub outgoing: mpsc::Sender<Vec<u8>>,
}

impl std::fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStream")
            .field("remote", &hex::encode(self.remote_static_key))
            .finish_non_exhaustive()
    }
}

/// Backend-agnostic swarm interface.
#[async_trait]
pub trait Swarm: Send + Sync {
    /// Join a topic. Returns the stream of authenticated connections the
    /// swarm establishes (inbound and outbound alike).
    ///
    /// # Errors
    ///
    /// Returns [`crate::NodeError::Swarm`] if the topic cannot be joined.
    async fn join(&self, topic: [u8; 32], options: JoinOptions)
        -> Result<mpsc::Receiver<PeerStream>>;

    /// Leave all topics and stop forming connections. Idempotent; existing
    /// streams close as their channels drop.
    async fn destroy(&self);
}
