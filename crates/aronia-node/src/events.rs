//! Node event surface.
//!
//! Everything the node observes (admissions, disconnects, introductions,
//! inbound application messages, dropped-frame errors) is published as a
//! [`NodeEvent`] on a broadcast bus. Subscribers each get an independent
//! buffered receiver; an event sent with no subscribers is simply dropped.

use aronia_crypto::PeerId;
use aronia_trust::introduction::Introduction;
use aronia_wire::payload::Capabilities;
use tokio::sync::broadcast;

/// A point-in-time view of one peer session.
#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    /// The peer's public key.
    pub pubkey: PeerId,
    /// Last capabilities the peer announced (empty until the first
    /// capability frame arrives).
    pub capabilities: Capabilities,
    /// When the session was admitted, ms since epoch.
    pub connected_at_ms: u64,
    /// When the last verified frame arrived, ms since epoch.
    pub last_seen_ms: u64,
    /// Whether the session is still live.
    pub online: bool,
}

/// An event emitted by the node.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// A peer was admitted and its session started.
    PeerConnected(PeerSnapshot),
    /// A peer session ended (teardown, stream close, or liveness expiry).
    PeerDisconnected {
        /// The remote key.
        pubkey: PeerId,
    },
    /// An inbound connection was refused.
    PeerRejected {
        /// The remote key.
        pubkey: PeerId,
        /// Why admission failed.
        reason: String,
    },
    /// An accepted introduction's peer is whitelisted but not yet reachable.
    PeerPending {
        /// The introduced key.
        pubkey: PeerId,
    },
    /// A peer replaced its announced capabilities.
    CapabilitiesUpdated {
        /// The remote key.
        pubkey: PeerId,
        /// The new capabilities.
        capabilities: Capabilities,
    },
    /// A fire-and-forget application message arrived.
    MessageReceived {
        /// The sending peer.
        from: PeerId,
        /// Decoded payload.
        payload: serde_json::Value,
    },
    /// A valid introduction awaits a manual decision.
    IntroductionReceived(Introduction),
    /// An introduction was accepted (manually or automatically).
    IntroductionAccepted {
        /// The introduced key, now whitelisted.
        pubkey: PeerId,
        /// The vouching peer.
        introducer: PeerId,
    },
    /// An introduction was rejected or failed validation.
    IntroductionRejected {
        /// The introduced key (zero if the record was unreadable).
        pubkey: PeerId,
        /// Why it was rejected.
        reason: String,
    },
    /// A frame was dropped (protocol or authentication failure). The
    /// carrying session continues.
    Error {
        /// Description of the failure.
        message: String,
    },
}

/// Broadcast bus for [`NodeEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    /// Create a new event bus with the given per-subscriber buffer.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: NodeEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns an independent receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }
}
