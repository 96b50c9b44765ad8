//! The node: swarm integration, admission control, and the trust engine.
//!
//! A node joins one topic, admits whitelisted peers into sessions, routes
//! inbound RPC through the method registry, and runs the introduction
//! protocol that grows the whitelist by delegation.
//!
//! Node-wide state (whitelist, trust policy, active sessions, pending
//! introductions) lives behind a single lock and is only mutated here,
//! from the accept loop, the session signal loop, and the public API.
//! Sessions never touch it directly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aronia_crypto::ed25519::KeyPair;
use aronia_crypto::{hash, peer_id_to_hex, PeerId};
use aronia_trust::introduction::Introduction;
use aronia_trust::validate::validate_introduction;
use aronia_trust::{TrustConfig, TrustError};
use aronia_wire::frame::{now_ms, FRAME_EVENT, FRAME_INTRODUCE};
use aronia_wire::payload::Capabilities;
use aronia_wire::encode_payload;
use tokio::sync::{broadcast, mpsc};

use crate::config::NodeConfig;
use crate::events::{EventBus, NodeEvent, PeerSnapshot};
use crate::registry::{HandlerResult, MethodRegistry, PeerHandle};
use crate::session::{PeerSession, SessionConfig, SessionSignal};
use crate::swarm::{JoinOptions, PeerStream, Swarm};
use crate::{lock, NodeError, Result};

/// Per-peer outcome counts of a [`Node::broadcast`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Peers whose transport accepted the frame.
    pub sent: usize,
    /// Peers that were gone or failed the write.
    pub offline: usize,
}

/// A running Aronia node. Cheap to clone; all clones share one runtime.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    keypair: Arc<KeyPair>,
    config: NodeConfig,
    topic: [u8; 32],
    swarm: Arc<dyn Swarm>,
    events: EventBus,
    registry: Arc<MethodRegistry>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    state: Mutex<NodeState>,
}

struct NodeState {
    whitelist: HashSet<PeerId>,
    trust: TrustConfig,
    sessions: HashMap<PeerId, PeerSession>,
    pending_introductions: HashMap<PeerId, Introduction>,
    /// Trust paths recorded at acceptance, for cascading revocation.
    trust_paths: HashMap<PeerId, Vec<String>>,
    running: bool,
}

impl Node {
    /// Start a node: join the topic as announcer and searcher, then admit
    /// connections as the swarm delivers them.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Config`] if configured keys do not decode and
    /// [`NodeError::Swarm`] if the topic cannot be joined.
    pub async fn start(
        keypair: KeyPair,
        topic_name: &str,
        config: NodeConfig,
        swarm: Arc<dyn Swarm>,
    ) -> Result<Self> {
        let whitelist = config.whitelist_ids()?;
        let trust = config.trust_config()?;
        let topic = hash::topic_hash(topic_name);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(NodeInner {
            keypair: Arc::new(keypair),
            config,
            topic,
            swarm,
            events: EventBus::new(256),
            registry: Arc::new(MethodRegistry::new()),
            signals: signals_tx,
            state: Mutex::new(NodeState {
                whitelist,
                trust,
                sessions: HashMap::new(),
                pending_introductions: HashMap::new(),
                trust_paths: HashMap::new(),
                running: true,
            }),
        });

        let connections = inner.swarm.join(topic, JoinOptions::default()).await?;
        tracing::info!(
            local = %peer_id_to_hex(&inner.keypair.peer_id()),
            topic = %hex::encode(topic),
            "node joined topic"
        );

        let accept_inner = inner.clone();
        tokio::spawn(async move {
            accept_loop(accept_inner, connections).await;
        });
        let signal_inner = inner.clone();
        tokio::spawn(async move {
            signal_loop(signal_inner, signals_rx).await;
        });

        Ok(Self { inner })
    }

    /// This node's public key.
    pub fn peer_id(&self) -> PeerId {
        self.inner.keypair.peer_id()
    }

    /// The 32-byte topic key this node announced under.
    pub fn topic(&self) -> [u8; 32] {
        self.inner.topic
    }

    /// Subscribe to the node's event stream.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Register (or replace) an RPC handler.
    pub fn register_method<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value, PeerHandle) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner.registry.register(method, handler);
    }

    /// Snapshots of all active peer sessions.
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        lock(&self.inner.state)
            .sessions
            .values()
            .map(PeerSession::snapshot)
            .collect()
    }

    /// Snapshot of one peer, if it has an active session.
    pub fn peer(&self, pubkey: &PeerId) -> Option<PeerSnapshot> {
        lock(&self.inner.state)
            .sessions
            .get(pubkey)
            .map(PeerSession::snapshot)
    }

    /// The current whitelist.
    pub fn whitelist(&self) -> Vec<PeerId> {
        lock(&self.inner.state).whitelist.iter().copied().collect()
    }

    /// Admit a peer by configuration.
    pub fn whitelist_add(&self, peer: PeerId) {
        lock(&self.inner.state).whitelist.insert(peer);
    }

    /// Stop admitting a peer. Existing sessions are not torn down; use
    /// [`Node::revoke_trust`] for that.
    pub fn whitelist_remove(&self, peer: &PeerId) {
        lock(&self.inner.state).whitelist.remove(peer);
    }

    /// Introductions validated but awaiting a manual decision.
    pub fn pending_introductions(&self) -> Vec<Introduction> {
        lock(&self.inner.state)
            .pending_introductions
            .values()
            .cloned()
            .collect()
    }

    /// Send a fire-and-forget application message to a connected peer.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::PeerOffline`] if the peer has no active
    /// session, [`NodeError::Backpressure`] if the write stayed parked
    /// past the limit.
    pub async fn send(&self, peer: &PeerId, message: &serde_json::Value) -> Result<()> {
        let session = self.session(peer)?;
        let payload = encode_payload(message)?;
        session.send(FRAME_EVENT, payload).await
    }

    /// Call a method on a connected peer and wait for its response.
    ///
    /// `timeout_ms` defaults to the configured request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::PeerOffline`], [`NodeError::RequestTimeout`],
    /// or [`NodeError::Remote`] with the handler's error.
    pub async fn request(
        &self,
        peer: &PeerId,
        method: &str,
        params: serde_json::Value,
        timeout_ms: Option<u64>,
    ) -> Result<serde_json::Value> {
        let session = self.session(peer)?;
        let timeout = Duration::from_millis(
            timeout_ms.unwrap_or(self.inner.config.default_request_timeout_ms),
        );
        session.request(method.to_string(), params, timeout).await
    }

    /// Send an application message to every connected peer, best-effort.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Protocol`] only if the message itself cannot
    /// be serialized; per-peer failures are counted, not raised.
    pub async fn broadcast(&self, message: &serde_json::Value) -> Result<BroadcastOutcome> {
        let payload = encode_payload(message)?;
        let sessions: Vec<PeerSession> =
            lock(&self.inner.state).sessions.values().cloned().collect();

        let waits: Vec<_> = sessions
            .iter()
            .map(|s| s.send_nowait(FRAME_EVENT, payload.clone()))
            .collect();

        let mut outcome = BroadcastOutcome::default();
        for wait in waits {
            match wait.await {
                Ok(Ok(())) => outcome.sent += 1,
                _ => outcome.offline += 1,
            }
        }
        Ok(outcome)
    }

    /// Vouch for `target` to the connected peer `via`: build a first-hop
    /// introduction signed by this node and send it.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::PeerOffline`] if `via` has no session, or the
    /// write/signing failure.
    pub async fn introduce(
        &self,
        via: &PeerId,
        target: &PeerId,
        alias: &str,
        capabilities: Capabilities,
        message: Option<String>,
    ) -> Result<()> {
        let session = self.session(via)?;
        let record = Introduction::new(
            target,
            alias,
            capabilities,
            message,
            &self.inner.keypair,
            now_ms(),
        )?;
        let payload = encode_payload(&record)?;
        session.send(FRAME_INTRODUCE, payload).await
    }

    /// Forward an introduction this node accepted earlier: re-sign as the
    /// introducer with our key appended to the trust path, and send it to
    /// the connected peer `via`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Introduction`] if the extended path would
    /// exceed the depth bound, otherwise as [`Node::introduce`].
    pub async fn forward_introduction(&self, via: &PeerId, record: &Introduction) -> Result<()> {
        let max = self.inner.config.max_trust_depth;
        if record.trust_path.len() + 1 > max {
            return Err(TrustError::TrustPathTooLong {
                len: record.trust_path.len() + 1,
                max,
            }
            .into());
        }
        let session = self.session(via)?;
        let forwarded = Introduction::forwarded(record, &self.inner.keypair, now_ms())?;
        let payload = encode_payload(&forwarded)?;
        session.send(FRAME_INTRODUCE, payload).await
    }

    /// Accept a pending introduction: whitelist the peer and record its
    /// trust path.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NoPendingIntroduction`] if nothing is pending
    /// for `pubkey`.
    pub fn accept_introduction(&self, pubkey: &PeerId) -> Result<()> {
        let mut state = lock(&self.inner.state);
        let Some(record) = state.pending_introductions.get(pubkey).cloned() else {
            return Err(NodeError::NoPendingIntroduction(peer_id_to_hex(pubkey)));
        };
        apply_accept(&self.inner, &mut state, *pubkey, &record);
        Ok(())
    }

    /// Reject a pending introduction.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NoPendingIntroduction`] if nothing is pending
    /// for `pubkey`.
    pub fn reject_introduction(&self, pubkey: &PeerId) -> Result<()> {
        let mut state = lock(&self.inner.state);
        if state.pending_introductions.remove(pubkey).is_none() {
            return Err(NodeError::NoPendingIntroduction(peer_id_to_hex(pubkey)));
        }
        drop(state);
        self.inner.events.emit(NodeEvent::IntroductionRejected {
            pubkey: *pubkey,
            reason: "rejected".to_string(),
        });
        Ok(())
    }

    /// Add or remove `peer` from the auto-accept set.
    pub fn set_trust(&self, peer: PeerId, trusted: bool) {
        let mut state = lock(&self.inner.state);
        if trusted {
            state.trust.auto_accept_from.insert(peer);
        } else {
            state.trust.auto_accept_from.remove(&peer);
        }
    }

    /// Withdraw trust from `peer`: remove it from the auto-accept set and
    /// the whitelist and tear down its session. With `cascade`, every
    /// peer whose recorded trust path contains `peer` is removed and torn
    /// down as well, and pending introductions vouched through it are
    /// dropped.
    pub fn revoke_trust(&self, peer: &PeerId, cascade: bool) {
        let mut to_destroy: Vec<PeerSession> = Vec::new();
        {
            let mut state = lock(&self.inner.state);
            state.trust.auto_accept_from.remove(peer);
            state.whitelist.remove(peer);
            state.trust_paths.remove(peer);
            if let Some(session) = state.sessions.get(peer) {
                to_destroy.push(session.clone());
            }

            if cascade {
                let peer_hex = peer_id_to_hex(peer);
                let dependents: Vec<PeerId> = state
                    .trust_paths
                    .iter()
                    .filter(|(_, path)| path.contains(&peer_hex))
                    .map(|(p, _)| *p)
                    .collect();
                for dependent in dependents {
                    tracing::info!(
                        revoked = %peer_hex,
                        dependent = %peer_id_to_hex(&dependent),
                        "cascading trust revocation"
                    );
                    state.whitelist.remove(&dependent);
                    state.trust_paths.remove(&dependent);
                    if let Some(session) = state.sessions.get(&dependent) {
                        to_destroy.push(session.clone());
                    }
                }
                state
                    .pending_introductions
                    .retain(|_, record| !record.trust_path.contains(&peer_hex));
            }
        }
        for session in to_destroy {
            session.destroy();
        }
    }

    /// Stop the node: tear down every session, clear pending
    /// introductions, and leave the swarm. Idempotent.
    pub async fn stop(&self) {
        let sessions: Vec<PeerSession> = {
            let mut state = lock(&self.inner.state);
            if !state.running {
                return;
            }
            state.running = false;
            state.pending_introductions.clear();
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &sessions {
            session.destroy();
        }
        self.inner.swarm.destroy().await;
        tracing::info!(
            local = %peer_id_to_hex(&self.inner.keypair.peer_id()),
            "node stopped"
        );
    }

    fn session(&self, peer: &PeerId) -> Result<PeerSession> {
        lock(&self.inner.state)
            .sessions
            .get(peer)
            .cloned()
            .ok_or_else(|| NodeError::offline(peer))
    }
}

fn session_config(config: &NodeConfig) -> SessionConfig {
    SessionConfig {
        heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
        heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
        backpressure_timeout: Duration::from_millis(config.backpressure_timeout_ms),
    }
}

async fn accept_loop(inner: Arc<NodeInner>, mut connections: mpsc::Receiver<PeerStream>) {
    while let Some(stream) = connections.recv().await {
        admit(&inner, stream);
    }
}

/// Admission policy for a newly handshaked stream.
fn admit(inner: &Arc<NodeInner>, stream: PeerStream) {
    let remote = stream.remote_static_key;
    let mut state = lock(&inner.state);
    if !state.running {
        return;
    }
    if !state.whitelist.contains(&remote) {
        drop(state);
        tracing::debug!(peer = %peer_id_to_hex(&remote), "connection rejected: not whitelisted");
        inner.events.emit(NodeEvent::PeerRejected {
            pubkey: remote,
            reason: "not whitelisted".to_string(),
        });
        return;
    }
    if state.sessions.contains_key(&remote) {
        // One session per pubkey: the newcomer loses, the stream drops.
        tracing::debug!(peer = %peer_id_to_hex(&remote), "duplicate connection ignored");
        return;
    }

    let session = PeerSession::spawn(
        stream,
        inner.keypair.clone(),
        inner.config.capabilities(),
        session_config(&inner.config),
        inner.events.clone(),
        inner.signals.clone(),
    );
    let snapshot = session.snapshot();
    state.sessions.insert(remote, session);
    drop(state);

    tracing::info!(peer = %peer_id_to_hex(&remote), "peer connected");
    inner.events.emit(NodeEvent::PeerConnected(snapshot));
}

async fn signal_loop(inner: Arc<NodeInner>, mut signals: mpsc::UnboundedReceiver<SessionSignal>) {
    while let Some(signal) = signals.recv().await {
        match signal {
            SessionSignal::Closed { peer } => on_session_closed(&inner, peer),
            SessionSignal::Request { peer, request } => on_request(&inner, peer, request),
            SessionSignal::Introduce { peer, record } => on_introduce(&inner, peer, record),
        }
    }
}

fn on_session_closed(inner: &Arc<NodeInner>, peer: PeerId) {
    let peer_hex = peer_id_to_hex(&peer);
    let existed = {
        let mut state = lock(&inner.state);
        let existed = state.sessions.remove(&peer).is_some();
        // An introduction is only as good as its introducer's presence.
        state
            .pending_introductions
            .retain(|_, record| record.introducer_pubkey != peer_hex);
        existed
    };
    if existed {
        tracing::info!(peer = %peer_hex, "peer disconnected");
        inner.events.emit(NodeEvent::PeerDisconnected { pubkey: peer });
    }
}

fn on_request(inner: &Arc<NodeInner>, peer: PeerId, request: aronia_wire::payload::RequestPayload) {
    let Some(session) = lock(&inner.state).sessions.get(&peer).cloned() else {
        return;
    };
    let capabilities = session.snapshot().capabilities;
    let registry = inner.registry.clone();
    tokio::spawn(async move {
        let handle = PeerHandle {
            pubkey: peer,
            capabilities,
        };
        let id = request.id.clone();
        let response = match registry.dispatch(&request.method, request.params, handle).await {
            Ok(result) => aronia_wire::payload::ResponsePayload::ok(id, result),
            Err(error) => aronia_wire::payload::ResponsePayload::err(id, error),
        };
        session.respond(response);
    });
}

fn on_introduce(inner: &Arc<NodeInner>, introducer: PeerId, record: Introduction) {
    let own = inner.keypair.peer_id();
    if let Err(e) = validate_introduction(
        &record,
        &introducer,
        &own,
        inner.config.introduction_max_age_ms,
        inner.config.max_trust_depth,
        now_ms(),
    ) {
        let pubkey = record.peer_id().unwrap_or([0u8; 32]);
        tracing::debug!(
            introducer = %peer_id_to_hex(&introducer),
            error = %e,
            "introduction rejected"
        );
        inner.events.emit(NodeEvent::IntroductionRejected {
            pubkey,
            reason: e.to_string(),
        });
        return;
    }
    let Ok(target) = record.peer_id() else {
        inner.events.emit(NodeEvent::IntroductionRejected {
            pubkey: [0u8; 32],
            reason: "malformed introduced key".to_string(),
        });
        return;
    };

    let mut state = lock(&inner.state);
    if state.whitelist.contains(&target) {
        // Nothing to delegate; stay silent rather than leak the whitelist.
        tracing::debug!(peer = %peer_id_to_hex(&target), "introduction for known peer dropped");
        return;
    }

    if state.trust.auto_accepts(&introducer, &record.capabilities) {
        apply_accept(inner, &mut state, target, &record);
    } else {
        state.pending_introductions.insert(target, record.clone());
        drop(state);
        inner.events.emit(NodeEvent::IntroductionReceived(record));
    }
}

/// The accept procedure: whitelist, record the trust path, surface events.
fn apply_accept(
    inner: &Arc<NodeInner>,
    state: &mut NodeState,
    target: PeerId,
    record: &Introduction,
) {
    state.whitelist.insert(target);
    state.trust_paths.insert(target, record.trust_path.clone());
    state.pending_introductions.remove(&target);
    let introducer = record.introducer_id().unwrap_or([0u8; 32]);
    let connected = state.sessions.contains_key(&target);

    tracing::info!(
        peer = %peer_id_to_hex(&target),
        introducer = %peer_id_to_hex(&introducer),
        "introduction accepted"
    );
    inner.events.emit(NodeEvent::IntroductionAccepted {
        pubkey: target,
        introducer,
    });
    if !connected {
        // Whitelisted but unreachable until the swarm finds it.
        inner.events.emit(NodeEvent::PeerPending { pubkey: target });
    }
}
