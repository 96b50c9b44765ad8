//! Per-connection state machine.
//!
//! One task owns each peer session. It multiplexes, in a single select
//! loop: inbound frames, the heartbeat interval, the liveness deadline,
//! pending-request deadlines, parked-write drain and expiry, and the
//! command channel the node and application drive it through. Nothing
//! else touches session state.
//!
//! ## Lifecycle
//!
//! On spawn the session pushes a capabilities frame, arms the heartbeat
//! interval and the liveness deadline, and starts reading. Every parsed,
//! signature-verified inbound frame re-arms the liveness deadline.
//! Teardown (commanded, stream close, or liveness expiry) fails every
//! pending request with the offline error, exactly once.
//!
//! ## Writes
//!
//! A write is first attempted without blocking. When the transport
//! reports "not writable" (the outbound channel is full), the write is
//! parked and every later write queues behind it to keep ordering; the
//! queue drains when the transport signals capacity. A write parked
//! longer than the backpressure limit fails, which for a pending request
//! rejects that request.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aronia_crypto::ed25519::KeyPair;
use aronia_crypto::{peer_id_to_hex, PeerId};
use aronia_trust::introduction::Introduction;
use aronia_wire::frame::{
    now_ms, Frame, FRAME_CONTROL, FRAME_EVENT, FRAME_INTRODUCE, FRAME_REQUEST, FRAME_RESPONSE,
    FRAME_STREAM_DATA, FRAME_STREAM_END,
};
use aronia_wire::payload::{Capabilities, ControlPayload, RequestPayload, ResponsePayload};
use aronia_wire::{decode_payload, encode_payload};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use crate::events::{EventBus, NodeEvent, PeerSnapshot};
use crate::swarm::PeerStream;
use crate::{lock, NodeError, Result};

/// Session timings, taken from the node configuration.
#[derive(Clone, Debug)]
pub(crate) struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub backpressure_timeout: Duration,
}

/// What a session reports back to its node.
#[derive(Debug)]
pub(crate) enum SessionSignal {
    /// The session finished tearing down.
    Closed { peer: PeerId },
    /// An RPC request arrived and needs dispatching.
    Request { peer: PeerId, request: RequestPayload },
    /// An introduction record arrived from this peer.
    Introduce { peer: PeerId, record: Introduction },
}

/// What the node and application drive a session with.
pub(crate) enum SessionCommand {
    /// Sign and write one frame; `done` resolves when the transport
    /// accepted it.
    Send {
        frame_type: u8,
        payload: Vec<u8>,
        done: oneshot::Sender<Result<()>>,
    },
    /// Issue an RPC request; `reply` resolves with the response, the
    /// deadline, or the teardown error.
    Request {
        method: String,
        params: serde_json::Value,
        timeout: Duration,
        reply: oneshot::Sender<Result<serde_json::Value>>,
    },
    /// Answer a previously signalled request.
    Respond { response: ResponsePayload },
    /// Tear the session down. Idempotent.
    Destroy,
}

/// Shared, read-mostly view of the peer.
pub(crate) struct PeerMeta {
    pub capabilities: Capabilities,
    pub last_seen_ms: u64,
    pub online: bool,
}

/// Handle to a running peer session.
#[derive(Clone)]
pub struct PeerSession {
    remote: PeerId,
    connected_at_ms: u64,
    commands: mpsc::UnboundedSender<SessionCommand>,
    meta: Arc<Mutex<PeerMeta>>,
}

impl PeerSession {
    /// The remote peer's public key.
    pub fn remote(&self) -> PeerId {
        self.remote
    }

    /// A point-in-time view of the session.
    pub fn snapshot(&self) -> PeerSnapshot {
        let meta = lock(&self.meta);
        PeerSnapshot {
            pubkey: self.remote,
            capabilities: meta.capabilities.clone(),
            connected_at_ms: self.connected_at_ms,
            last_seen_ms: meta.last_seen_ms,
            online: meta.online,
        }
    }

    /// Start a session over an admitted stream.
    pub(crate) fn spawn(
        stream: PeerStream,
        keypair: Arc<KeyPair>,
        own_capabilities: Capabilities,
        config: SessionConfig,
        events: EventBus,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> PeerSession {
        let remote = stream.remote_static_key;
        let connected_at_ms = now_ms();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let meta = Arc::new(Mutex::new(PeerMeta {
            capabilities: Capabilities::default(),
            last_seen_ms: connected_at_ms,
            online: true,
        }));

        let handle = PeerSession {
            remote,
            connected_at_ms,
            commands: commands_tx,
            meta: meta.clone(),
        };

        let mut heartbeat = interval_at(
            Instant::now() + config.heartbeat_interval,
            config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let liveness_deadline = Instant::now() + config.heartbeat_timeout;

        let mut task = SessionTask {
            keypair,
            remote,
            connected_at_ms,
            config,
            stream,
            commands: commands_rx,
            signals,
            events,
            meta,
            heartbeat,
            liveness_deadline,
            pending: HashMap::new(),
            parked: VecDeque::new(),
            next_request_seq: 1,
            destroyed: false,
        };
        tokio::spawn(async move {
            task.run(own_capabilities).await;
        });

        handle
    }

    /// Enqueue a signed write; the returned channel resolves when the
    /// transport accepts it (or with the failure).
    pub(crate) fn send_nowait(
        &self,
        frame_type: u8,
        payload: Vec<u8>,
    ) -> oneshot::Receiver<Result<()>> {
        let (done, rx) = oneshot::channel();
        let command = SessionCommand::Send {
            frame_type,
            payload,
            done,
        };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            if let SessionCommand::Send { done, .. } = command {
                let _ = done.send(Err(NodeError::offline(&self.remote)));
            }
        }
        rx
    }

    /// Sign and write one frame, waiting for the transport to accept it.
    pub(crate) async fn send(&self, frame_type: u8, payload: Vec<u8>) -> Result<()> {
        self.send_nowait(frame_type, payload)
            .await
            .unwrap_or_else(|_| Err(NodeError::offline(&self.remote)))
    }

    /// Issue an RPC request and wait for the response or the deadline.
    pub(crate) async fn request(
        &self,
        method: String,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let (reply, rx) = oneshot::channel();
        let command = SessionCommand::Request {
            method,
            params,
            timeout,
            reply,
        };
        if self.commands.send(command).is_err() {
            return Err(NodeError::offline(&self.remote));
        }
        rx.await
            .unwrap_or_else(|_| Err(NodeError::offline(&self.remote)))
    }

    /// Answer a request previously signalled by this session.
    pub(crate) fn respond(&self, response: ResponsePayload) {
        let _ = self.commands.send(SessionCommand::Respond { response });
    }

    /// Tear the session down. Idempotent; safe after the task has exited.
    pub(crate) fn destroy(&self) {
        let _ = self.commands.send(SessionCommand::Destroy);
    }
}

/// A registered RPC call awaiting its response.
struct PendingRequest {
    reply: oneshot::Sender<Result<serde_json::Value>>,
    deadline: Instant,
    timeout_ms: u64,
}

/// An outbound write waiting for the transport to drain.
struct ParkedWrite {
    bytes: Vec<u8>,
    parked_at: Instant,
    request_id: Option<String>,
    done: Option<oneshot::Sender<Result<()>>>,
}

/// One loop turn's resolved wakeup.
enum Step {
    Command(Option<SessionCommand>),
    Inbound(Option<Vec<u8>>),
    Heartbeat,
    LivenessExpired,
    RequestDeadline,
    WriteReady,
    ParkedExpired,
}

struct SessionTask {
    keypair: Arc<KeyPair>,
    remote: PeerId,
    connected_at_ms: u64,
    config: SessionConfig,
    stream: PeerStream,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    events: EventBus,
    meta: Arc<Mutex<PeerMeta>>,
    heartbeat: Interval,
    liveness_deadline: Instant,
    pending: HashMap<String, PendingRequest>,
    parked: VecDeque<ParkedWrite>,
    next_request_seq: u64,
    destroyed: bool,
}

impl SessionTask {
    async fn run(&mut self, own_capabilities: Capabilities) {
        match encode_payload(&ControlPayload::Capabilities(own_capabilities)) {
            Ok(payload) => self.write_frame(FRAME_CONTROL, payload, None, None),
            Err(e) => tracing::warn!(error = %e, "failed to encode capabilities"),
        }

        while !self.destroyed {
            let step = self.next_step().await;
            self.handle_step(step);
        }

        let _ = self.signals.send(SessionSignal::Closed { peer: self.remote });
    }

    async fn next_step(&mut self) -> Step {
        // A deadline that never fires, for the disabled select arms.
        let idle = Instant::now() + Duration::from_secs(86_400 * 365);
        let request_deadline = self.pending.values().map(|p| p.deadline).min();
        let parked_deadline = self
            .parked
            .front()
            .map(|w| w.parked_at + self.config.backpressure_timeout);
        let has_parked = !self.parked.is_empty();

        tokio::select! {
            command = self.commands.recv() => Step::Command(command),
            frame = self.stream.incoming.recv() => Step::Inbound(frame),
            _ = self.heartbeat.tick() => Step::Heartbeat,
            () = sleep_until(self.liveness_deadline) => Step::LivenessExpired,
            () = sleep_until(request_deadline.unwrap_or(idle)),
                if request_deadline.is_some() => Step::RequestDeadline,
            _ = self.stream.outgoing.reserve(), if has_parked => Step::WriteReady,
            () = sleep_until(parked_deadline.unwrap_or(idle)),
                if parked_deadline.is_some() => Step::ParkedExpired,
        }
    }

    fn handle_step(&mut self, step: Step) {
        match step {
            Step::Command(None) => self.teardown("all handles dropped"),
            Step::Command(Some(command)) => self.handle_command(command),
            Step::Inbound(None) => self.teardown("stream closed"),
            Step::Inbound(Some(bytes)) => self.handle_frame(&bytes),
            Step::Heartbeat => self.send_heartbeat(),
            Step::LivenessExpired => self.teardown("liveness timeout"),
            Step::RequestDeadline => self.expire_requests(),
            Step::WriteReady => self.drain_parked(),
            Step::ParkedExpired => self.expire_parked(),
        }
    }

    // ── Outbound ────────────────────────────────────────────────────────

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Send {
                frame_type,
                payload,
                done,
            } => self.write_frame(frame_type, payload, None, Some(done)),
            SessionCommand::Request {
                method,
                params,
                timeout,
                reply,
            } => self.start_request(method, params, timeout, reply),
            SessionCommand::Respond { response } => match encode_payload(&response) {
                Ok(payload) => self.write_frame(FRAME_RESPONSE, payload, None, None),
                Err(e) => tracing::warn!(error = %e, "failed to encode response"),
            },
            SessionCommand::Destroy => self.teardown("destroyed"),
        }
    }

    fn start_request(
        &mut self,
        method: String,
        params: serde_json::Value,
        timeout: Duration,
        reply: oneshot::Sender<Result<serde_json::Value>>,
    ) {
        // Ids are scoped by the session's connection time so that a
        // response from before a reconnect can never match a new call.
        let id = format!("{}-{}", self.connected_at_ms, self.next_request_seq);
        self.next_request_seq += 1;

        let timeout_ms = timeout.as_millis() as u64;
        let request = RequestPayload {
            id: id.clone(),
            method,
            params,
            timeout: timeout_ms,
        };
        match encode_payload(&request) {
            Ok(payload) => {
                self.pending.insert(
                    id.clone(),
                    PendingRequest {
                        reply,
                        deadline: Instant::now() + timeout,
                        timeout_ms,
                    },
                );
                self.write_frame(FRAME_REQUEST, payload, Some(id), None);
            }
            Err(e) => {
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    /// Sign a frame and hand it to the transport, parking on backpressure.
    fn write_frame(
        &mut self,
        frame_type: u8,
        payload: Vec<u8>,
        request_id: Option<String>,
        done: Option<oneshot::Sender<Result<()>>>,
    ) {
        let mut frame = Frame::new(frame_type, self.keypair.peer_id(), payload);
        let bytes = match frame
            .sign(&self.keypair.signing_key)
            .and_then(|()| frame.to_bytes())
        {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail_write(request_id, done, e.into());
                return;
            }
        };

        if !self.parked.is_empty() {
            // Earlier writes are still parked; queue behind them so the
            // stream stays ordered.
            self.park(bytes, request_id, done);
            return;
        }

        match self.stream.outgoing.try_send(bytes) {
            Ok(()) => {
                if let Some(done) = done {
                    let _ = done.send(Ok(()));
                }
            }
            Err(mpsc::error::TrySendError::Full(bytes)) => self.park(bytes, request_id, done),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.fail_write(request_id, done, NodeError::offline(&self.remote));
                self.teardown("transport closed");
            }
        }
    }

    fn park(
        &mut self,
        bytes: Vec<u8>,
        request_id: Option<String>,
        done: Option<oneshot::Sender<Result<()>>>,
    ) {
        self.parked.push_back(ParkedWrite {
            bytes,
            parked_at: Instant::now(),
            request_id,
            done,
        });
    }

    fn drain_parked(&mut self) {
        while let Some(write) = self.parked.pop_front() {
            match self.stream.outgoing.try_send(write.bytes) {
                Ok(()) => {
                    if let Some(done) = write.done {
                        let _ = done.send(Ok(()));
                    }
                }
                Err(mpsc::error::TrySendError::Full(bytes)) => {
                    self.parked.push_front(ParkedWrite {
                        bytes,
                        parked_at: write.parked_at,
                        request_id: write.request_id,
                        done: write.done,
                    });
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.fail_write(
                        write.request_id,
                        write.done,
                        NodeError::offline(&self.remote),
                    );
                    self.teardown("transport closed");
                    return;
                }
            }
        }
    }

    fn expire_parked(&mut self) {
        let limit = self.config.backpressure_timeout;
        let now = Instant::now();
        while let Some(front) = self.parked.front() {
            if now < front.parked_at + limit {
                break;
            }
            if let Some(write) = self.parked.pop_front() {
                self.fail_write(
                    write.request_id,
                    write.done,
                    NodeError::Backpressure(limit.as_millis() as u64),
                );
            }
        }
    }

    /// Route a write failure to whoever is waiting on it: the pending
    /// request it belongs to, or the send's completion channel.
    fn fail_write(
        &mut self,
        request_id: Option<String>,
        done: Option<oneshot::Sender<Result<()>>>,
        err: NodeError,
    ) {
        if let Some(id) = request_id {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.reply.send(Err(err));
                return;
            }
        }
        if let Some(done) = done {
            let _ = done.send(Err(err));
        }
    }

    fn send_heartbeat(&mut self) {
        // Send failures are swallowed: if the peer is gone, the liveness
        // deadline will notice.
        if let Ok(payload) = encode_payload(&ControlPayload::Heartbeat) {
            self.write_frame(FRAME_CONTROL, payload, None, None);
        }
    }

    fn expire_requests(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending
                    .reply
                    .send(Err(NodeError::RequestTimeout(pending.timeout_ms)));
            }
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    fn handle_frame(&mut self, bytes: &[u8]) {
        let remote_hex = peer_id_to_hex(&self.remote);
        let frame = match Frame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.surface_error(format!("dropped frame from {remote_hex}: {e}"));
                return;
            }
        };
        if !frame.verify() {
            self.surface_error(format!(
                "dropped frame from {remote_hex}: signature verification failed"
            ));
            return;
        }

        // Parsed and verified: the link is alive.
        self.liveness_deadline = Instant::now() + self.config.heartbeat_timeout;
        lock(&self.meta).last_seen_ms = now_ms();

        if frame.sender != self.remote {
            self.surface_error(format!(
                "dropped frame from {remote_hex}: sender identity mismatch \
                 (frame signed by {})",
                peer_id_to_hex(&frame.sender)
            ));
            return;
        }

        match frame.frame_type {
            FRAME_CONTROL => self.on_control(&frame),
            FRAME_REQUEST => match decode_payload::<RequestPayload>(&frame.payload) {
                Ok(request) => {
                    let _ = self.signals.send(SessionSignal::Request {
                        peer: self.remote,
                        request,
                    });
                }
                Err(e) => self.surface_error(format!("bad request from {remote_hex}: {e}")),
            },
            FRAME_RESPONSE => self.on_response(&frame),
            FRAME_EVENT | FRAME_STREAM_DATA | FRAME_STREAM_END => {
                match decode_payload::<serde_json::Value>(&frame.payload) {
                    Ok(payload) => self.events.emit(NodeEvent::MessageReceived {
                        from: self.remote,
                        payload,
                    }),
                    Err(e) => self.surface_error(format!("bad event from {remote_hex}: {e}")),
                }
            }
            FRAME_INTRODUCE => match decode_payload::<Introduction>(&frame.payload) {
                Ok(record) => {
                    let _ = self.signals.send(SessionSignal::Introduce {
                        peer: self.remote,
                        record,
                    });
                }
                Err(e) => self.surface_error(format!("bad introduction from {remote_hex}: {e}")),
            },
            unknown => self.surface_error(format!(
                "unknown frame type 0x{unknown:02x} from {remote_hex}"
            )),
        }
    }

    fn on_control(&mut self, frame: &Frame) {
        match decode_payload::<ControlPayload>(&frame.payload) {
            // The heartbeat's only effect, re-arming liveness, already
            // happened above.
            Ok(ControlPayload::Heartbeat) => {}
            Ok(ControlPayload::Capabilities(capabilities)) => {
                lock(&self.meta).capabilities = capabilities.clone();
                self.events.emit(NodeEvent::CapabilitiesUpdated {
                    pubkey: self.remote,
                    capabilities,
                });
            }
            Err(e) => self.surface_error(format!(
                "bad control payload from {}: {e}",
                peer_id_to_hex(&self.remote)
            )),
        }
    }

    fn on_response(&mut self, frame: &Frame) {
        let response = match decode_payload::<ResponsePayload>(&frame.payload) {
            Ok(response) => response,
            Err(e) => {
                self.surface_error(format!(
                    "bad response from {}: {e}",
                    peer_id_to_hex(&self.remote)
                ));
                return;
            }
        };
        let Some(pending) = self.pending.remove(&response.id) else {
            // The deadline already fired, or the id was never ours. Drop.
            tracing::debug!(id = %response.id, "discarding unmatched response");
            return;
        };
        let outcome = match response.error {
            Some(error) => Err(NodeError::Remote {
                code: error.code,
                message: error.message,
            }),
            None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
        };
        let _ = pending.reply.send(outcome);
    }

    fn surface_error(&self, message: String) {
        tracing::debug!("{message}");
        self.events.emit(NodeEvent::Error { message });
    }

    // ── Teardown ────────────────────────────────────────────────────────

    fn teardown(&mut self, reason: &str) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        tracing::debug!(
            peer = %peer_id_to_hex(&self.remote),
            reason,
            "session closed"
        );

        lock(&self.meta).online = false;
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(NodeError::offline(&self.remote)));
        }
        while let Some(write) = self.parked.pop_front() {
            self.fail_write(write.request_id, write.done, NodeError::offline(&self.remote));
        }
        self.stream.incoming.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    /// Long timers: tests drive every transition explicitly.
    fn test_config() -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_secs(3600),
            heartbeat_timeout: Duration::from_secs(3600),
            backpressure_timeout: Duration::from_secs(3600),
        }
    }

    struct Fixture {
        session: PeerSession,
        local: Arc<KeyPair>,
        remote: KeyPair,
        /// The "network" side: what the session writes.
        wire_out: mpsc::Receiver<Vec<u8>>,
        /// The "network" side: what the session will read.
        wire_in: mpsc::Sender<Vec<u8>>,
        signals: mpsc::UnboundedReceiver<SessionSignal>,
        events: EventBus,
    }

    fn fixture_with(config: SessionConfig, outgoing_depth: usize) -> Fixture {
        let local = Arc::new(KeyPair::from_bytes(&[1u8; 32]));
        let remote = KeyPair::from_bytes(&[2u8; 32]);
        let (wire_in, incoming) = mpsc::channel(64);
        let (outgoing, wire_out) = mpsc::channel(outgoing_depth);
        let stream = PeerStream {
            remote_static_key: remote.peer_id(),
            incoming,
            outgoing,
        };
        let events = EventBus::new(64);
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let session = PeerSession::spawn(
            stream,
            local.clone(),
            Capabilities {
                agent: "aronia".to_string(),
                version: "0.1.0".to_string(),
                accepts: vec![],
            },
            config,
            events.clone(),
            signal_tx,
        );
        Fixture {
            session,
            local,
            remote,
            wire_out,
            wire_in,
            signals,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(test_config(), 64)
    }

    fn remote_frame<T: Serialize>(remote: &KeyPair, frame_type: u8, payload: &T) -> Vec<u8> {
        let payload = encode_payload(payload).expect("encode");
        let mut frame = Frame::new(frame_type, remote.peer_id(), payload);
        frame.sign(&remote.signing_key).expect("sign");
        frame.to_bytes().expect("serialize")
    }

    async fn next_outbound(fx: &mut Fixture) -> Frame {
        let bytes = tokio::time::timeout(Duration::from_secs(2), fx.wire_out.recv())
            .await
            .expect("outbound frame in time")
            .expect("stream open");
        let frame = Frame::from_bytes(&bytes).expect("parse");
        assert!(frame.verify(), "session output must be signed");
        assert_eq!(frame.sender, fx.local.peer_id());
        frame
    }

    #[tokio::test]
    async fn test_capabilities_frame_sent_first() {
        let mut fx = fixture();
        let frame = next_outbound(&mut fx).await;
        assert_eq!(frame.frame_type, FRAME_CONTROL);
        let control: ControlPayload = decode_payload(&frame.payload).expect("decode");
        assert!(matches!(
            control,
            ControlPayload::Capabilities(c) if c.agent == "aronia" && c.version == "0.1.0"
        ));
    }

    #[tokio::test]
    async fn test_inbound_capabilities_update_snapshot() {
        let fx = fixture();
        let mut rx = fx.events.subscribe();
        let caps = Capabilities {
            agent: "other".to_string(),
            version: "9.9.9".to_string(),
            accepts: vec!["task".to_string()],
        };
        fx.wire_in
            .send(remote_frame(
                &fx.remote,
                FRAME_CONTROL,
                &ControlPayload::Capabilities(caps.clone()),
            ))
            .await
            .expect("send");

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert!(matches!(
            event,
            NodeEvent::CapabilitiesUpdated { capabilities, .. } if capabilities == caps
        ));
        assert_eq!(fx.session.snapshot().capabilities, caps);
    }

    #[tokio::test]
    async fn test_request_resolves_with_response() {
        let mut fx = fixture();
        let _caps = next_outbound(&mut fx).await;

        let session = fx.session.clone();
        let call = tokio::spawn(async move {
            session
                .request(
                    "echo".to_string(),
                    serde_json::json!({"n": 7}),
                    Duration::from_secs(5),
                )
                .await
        });

        let request_frame = next_outbound(&mut fx).await;
        assert_eq!(request_frame.frame_type, FRAME_REQUEST);
        let request: RequestPayload = decode_payload(&request_frame.payload).expect("decode");
        assert_eq!(request.method, "echo");

        let response = ResponsePayload::ok(request.id, serde_json::json!({"n": 7}));
        fx.wire_in
            .send(remote_frame(&fx.remote, FRAME_RESPONSE, &response))
            .await
            .expect("send");

        let result = call.await.expect("join").expect("request succeeds");
        assert_eq!(result["n"], 7);
    }

    #[tokio::test]
    async fn test_request_fails_with_remote_error() {
        let mut fx = fixture();
        let _caps = next_outbound(&mut fx).await;

        let session = fx.session.clone();
        let call = tokio::spawn(async move {
            session
                .request("boom".to_string(), serde_json::Value::Null, Duration::from_secs(5))
                .await
        });

        let request_frame = next_outbound(&mut fx).await;
        let request: RequestPayload = decode_payload(&request_frame.payload).expect("decode");
        let response = ResponsePayload::err(
            request.id,
            aronia_wire::payload::ResponseError::handler_failed("nope"),
        );
        fx.wire_in
            .send(remote_frame(&fx.remote, FRAME_RESPONSE, &response))
            .await
            .expect("send");

        let err = call.await.expect("join").expect_err("must fail");
        assert!(matches!(err, NodeError::Remote { message, .. } if message == "nope"));
    }

    #[tokio::test]
    async fn test_request_times_out_and_late_response_is_dropped() {
        let mut fx = fixture();
        let _caps = next_outbound(&mut fx).await;

        let session = fx.session.clone();
        let started = std::time::Instant::now();
        let err = session
            .request(
                "sleep".to_string(),
                serde_json::Value::Null,
                Duration::from_millis(100),
            )
            .await
            .expect_err("must time out");
        assert!(matches!(err, NodeError::RequestTimeout(100)));
        assert!(started.elapsed() >= Duration::from_millis(100));

        // A response arriving after the deadline is silently discarded and
        // the session keeps working.
        let request_frame = next_outbound(&mut fx).await;
        let request: RequestPayload = decode_payload(&request_frame.payload).expect("decode");
        let late = ResponsePayload::ok(request.id, serde_json::json!("late"));
        fx.wire_in
            .send(remote_frame(&fx.remote, FRAME_RESPONSE, &late))
            .await
            .expect("send");

        fx.session
            .send(FRAME_EVENT, br#"{"still":"alive"}"#.to_vec())
            .await
            .expect("session still writable");
    }

    #[tokio::test]
    async fn test_inbound_request_is_signalled_and_respond_writes_frame() {
        let mut fx = fixture();
        let _caps = next_outbound(&mut fx).await;

        let request = RequestPayload {
            id: "123-1".to_string(),
            method: "ping".to_string(),
            params: serde_json::Value::Null,
            timeout: 1000,
        };
        fx.wire_in
            .send(remote_frame(&fx.remote, FRAME_REQUEST, &request))
            .await
            .expect("send");

        let signal = tokio::time::timeout(Duration::from_secs(2), fx.signals.recv())
            .await
            .expect("signal in time")
            .expect("signal");
        let SessionSignal::Request { peer, request } = signal else {
            unreachable!("expected request signal");
        };
        assert_eq!(peer, fx.remote.peer_id());
        assert_eq!(request.method, "ping");

        fx.session
            .respond(ResponsePayload::ok(request.id, serde_json::json!({"pong": true})));
        let response_frame = next_outbound(&mut fx).await;
        assert_eq!(response_frame.frame_type, FRAME_RESPONSE);
    }

    #[tokio::test]
    async fn test_sender_identity_mismatch_drops_frame() {
        let mut fx = fixture();
        let _caps = next_outbound(&mut fx).await;
        let mut rx = fx.events.subscribe();

        let intruder = KeyPair::from_bytes(&[9u8; 32]);
        fx.wire_in
            .send(remote_frame(&intruder, FRAME_CONTROL, &ControlPayload::Heartbeat))
            .await
            .expect("send");

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert!(matches!(
            event,
            NodeEvent::Error { message } if message.contains("identity mismatch")
        ));

        // The session survives a dropped frame.
        fx.session
            .send(FRAME_EVENT, b"{}".to_vec())
            .await
            .expect("still alive");
    }

    #[tokio::test]
    async fn test_heartbeats_are_emitted() {
        let config = SessionConfig {
            heartbeat_interval: Duration::from_millis(30),
            heartbeat_timeout: Duration::from_secs(3600),
            backpressure_timeout: Duration::from_secs(3600),
        };
        let mut fx = fixture_with(config, 64);
        let _caps = next_outbound(&mut fx).await;

        let frame = next_outbound(&mut fx).await;
        assert_eq!(frame.frame_type, FRAME_CONTROL);
        let control: ControlPayload = decode_payload(&frame.payload).expect("decode");
        assert_eq!(control, ControlPayload::Heartbeat);
    }

    #[tokio::test]
    async fn test_liveness_expiry_tears_down() {
        let config = SessionConfig {
            heartbeat_interval: Duration::from_millis(30),
            heartbeat_timeout: Duration::from_millis(120),
            backpressure_timeout: Duration::from_millis(60_000),
        };
        let mut fx = fixture_with(config, 64);

        let signal = tokio::time::timeout(Duration::from_secs(2), fx.signals.recv())
            .await
            .expect("closed in time")
            .expect("signal");
        assert!(matches!(signal, SessionSignal::Closed { peer } if peer == fx.remote.peer_id()));
        assert!(!fx.session.snapshot().online);
    }

    #[tokio::test]
    async fn test_destroy_fails_pending_requests() {
        let mut fx = fixture();
        let _caps = next_outbound(&mut fx).await;

        let session = fx.session.clone();
        let call = tokio::spawn(async move {
            session
                .request("echo".to_string(), serde_json::Value::Null, Duration::from_secs(30))
                .await
        });
        let _request_frame = next_outbound(&mut fx).await;

        fx.session.destroy();
        fx.session.destroy(); // idempotent

        let err = call.await.expect("join").expect_err("must fail");
        assert!(matches!(err, NodeError::PeerOffline(_)));

        let signal = tokio::time::timeout(Duration::from_secs(2), fx.signals.recv())
            .await
            .expect("closed in time")
            .expect("signal");
        assert!(matches!(signal, SessionSignal::Closed { .. }));
    }

    #[tokio::test]
    async fn test_backpressure_parks_then_fails_writes() {
        let config = SessionConfig {
            heartbeat_interval: Duration::from_secs(3600),
            heartbeat_timeout: Duration::from_secs(3600),
            backpressure_timeout: Duration::from_millis(150),
        };
        // A transport that accepts a single in-flight frame.
        let mut fx = fixture_with(config, 1);

        // The capabilities frame fills the only slot; nobody drains it.
        let first = fx.session.send_nowait(FRAME_EVENT, b"{}".to_vec());
        let err = tokio::time::timeout(Duration::from_secs(2), first)
            .await
            .expect("resolves in time")
            .expect("channel alive")
            .expect_err("parked write must fail");
        assert!(matches!(err, NodeError::Backpressure(150)));

        // Draining the transport lets later writes through again.
        let _stale = fx.wire_out.recv().await.expect("capabilities frame");
        fx.session
            .send(FRAME_EVENT, b"{}".to_vec())
            .await
            .expect("transport drained");
    }

    #[tokio::test]
    async fn test_stream_close_runs_teardown() {
        let mut fx = fixture();
        let _caps = next_outbound(&mut fx).await;

        drop(fx.wire_in);
        let signal = tokio::time::timeout(Duration::from_secs(2), fx.signals.recv())
            .await
            .expect("closed in time")
            .expect("signal");
        assert!(matches!(signal, SessionSignal::Closed { .. }));

        let err = fx
            .session
            .send(FRAME_EVENT, b"{}".to_vec())
            .await
            .expect_err("session is gone");
        assert!(matches!(err, NodeError::PeerOffline(_)));
    }
}
