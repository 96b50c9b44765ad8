//! # aronia-node
//!
//! The Aronia node runtime: admission control, peer sessions, RPC, and the
//! introduction engine, driven over an abstract swarm.
//!
//! ## Architecture
//!
//! ```text
//! Application
//!     |
//!     v
//! Node (node.rs)          -- whitelist admission, trust graph, broadcast,
//!     |                      method registry, event surface
//!     v
//! PeerSession (session.rs)-- one task per peer: heartbeats, liveness,
//!     |                      RPC multiplexing, write backpressure
//!     v
//! Swarm (swarm/)          -- external DHT library behind a trait; delivers
//!                            authenticated encrypted streams per topic
//! ```
//!
//! All node-wide state (whitelist, sessions, pending introductions) lives
//! behind one lock on the node; per-session state is owned by that
//! session's task. No global state.

pub mod config;
pub mod events;
pub mod node;
pub mod registry;
pub mod session;
pub mod swarm;

use aronia_crypto::peer_id_to_hex;
use aronia_crypto::PeerId;

/// Error types for node operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The peer has no active session, or its session was torn down.
    #[error("peer offline: {0}")]
    PeerOffline(String),

    /// A request deadline elapsed before the response arrived.
    #[error("request timed out after {0} ms")]
    RequestTimeout(u64),

    /// Signature verification or a whitelist check failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Malformed frame, version/length mismatch, sender-identity mismatch,
    /// or unknown frame type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An introduction failed validation or could not be built.
    #[error("introduction error: {0}")]
    Introduction(#[from] aronia_trust::TrustError),

    /// A parked write exceeded the backpressure limit.
    #[error("backpressure: write parked longer than {0} ms")]
    Backpressure(u64),

    /// The remote handler answered a request with an error.
    #[error("remote error ({code}): {message}")]
    Remote {
        /// Machine-readable code from the response.
        code: String,
        /// Message from the response.
        message: String,
    },

    /// The underlying swarm failed.
    #[error("swarm error: {0}")]
    Swarm(String),

    /// Bad configuration (unparseable keys, missing file).
    #[error("configuration error: {0}")]
    Config(String),

    /// There is no pending introduction for the given peer.
    #[error("no pending introduction for {0}")]
    NoPendingIntroduction(String),

    /// The node has been stopped.
    #[error("node is stopped")]
    Stopped,
}

impl From<aronia_wire::WireError> for NodeError {
    fn from(err: aronia_wire::WireError) -> Self {
        NodeError::Protocol(err.to_string())
    }
}

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

impl NodeError {
    /// Shorthand for the offline error naming a peer.
    pub(crate) fn offline(peer: &PeerId) -> Self {
        NodeError::PeerOffline(peer_id_to_hex(peer))
    }
}

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
