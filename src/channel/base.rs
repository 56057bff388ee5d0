//! Channel state machine — the core of the channel subsystem.
//!
//! Drives WebRTC negotiation, stability detection, heartbeat, buffer audit,
//! and close/dispose. Shared by [`super::node::NodeChannel`] and
//! [`super::account::AccountChannel`] via the [`ChannelAddressing`]
//! specialization point.
//!
//! Concurrency follows three separable monitors (channel/heartbeat/audit
//! locks). State is always mutated inside a lock and events are always
//! fired after the lock is dropped — "compute-while-locked,
//! emit-while-unlocked" — so event callbacks never re-enter the channel
//! under a lock.

use super::{ChannelState, Initiation, Politeness};
use crate::account::Address;
use crate::buffer_auditor::BufferAuditor;
use crate::cancellable_delay::CancellableDelay;
use crate::constants;
use crate::envelope::{Envelope, Message, Party};
use crate::error::ChannelError;
use crate::logging::LogContext;
use crate::signalling::SignallingTransport;
use rustrtc::{
    IceCandidate, IceServer, PeerConnection, PeerConnectionEvent, PeerConnectionState,
    RtcConfiguration, SdpType, SessionDescription,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Events observable on a channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Fired once when the channel reaches `Open`.
    Open,
    /// Fired once alongside `Open`: `isStable` became true.
    Stable,
    /// Fired on every state transition (duplicates to the same state are
    /// suppressed).
    StateChange(ChannelState),
    /// A decoded envelope arrived on the data channel.
    Message(Envelope),
    /// Measured round-trip latency in milliseconds.
    Latency(u64),
    /// Latency crossed into "high" on this tick (debounced transition).
    HighLatency(u64),
    /// Signalling or heartbeat timed out.
    Timeout,
    /// The channel was disposed.
    Dispose,
}

/// Specialization point for [`super::node::NodeChannel`] /
/// [`super::account::AccountChannel`]: envelope addressing, admission, and
/// logging context.
pub trait ChannelAddressing: Send + Sync + std::fmt::Debug {
    /// How this side addresses itself in outbound envelopes.
    fn local_party(&self) -> Party;
    /// How this side addresses the remote counterpart in outbound envelopes.
    fn remote_party(&self) -> Party;
    /// Validate an inbound envelope's addressing before accepting it.
    fn admit(&self, envelope: &Envelope, local_signer: &Address) -> Result<(), ChannelError>;
    /// Per-kind structured logging context (`type`, `origin`, `destination[, destination account]`).
    fn log_context(&self) -> LogContext;
}

struct ChannelLockState {
    state: ChannelState,
    is_stable: bool,
    peer_connection: Option<PeerConnection>,
    data: Option<Arc<rustrtc::DataChannel>>,
    command: Option<Arc<rustrtc::DataChannel>>,
    signalling_timer: Option<Arc<CancellableDelay>>,
}

struct HeartbeatLockState {
    is_heartbeat_pending: bool,
    last_sent_at: Option<Instant>,
    is_heartbeat_timeout: bool,
    latency_ms: u64,
    is_high_latency: bool,
    task: Option<tokio::task::JoinHandle<()>>,
}

struct AuditLockState {
    command_auditor: Arc<BufferAuditor>,
    data_auditor: Arc<BufferAuditor>,
    task: Option<tokio::task::JoinHandle<()>>,
    cleanup_tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Tunable knobs a channel is constructed with.
#[derive(Debug, Clone)]
pub struct ChannelTuning {
    /// Heartbeat send/timeout interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat pending-to-timeout window.
    pub heartbeat_timeout: Duration,
    /// Buffer audit tick period.
    pub audit_interval: Duration,
    /// Latency above which `HighLatency` fires.
    pub max_latency: Duration,
    /// ICE servers passed to the peer connection.
    pub ice_servers: Vec<String>,
}

impl Default for ChannelTuning {
    fn default() -> Self {
        Self {
            heartbeat_interval: constants::HEARTBEAT_INTERVAL,
            heartbeat_timeout: constants::HEARTBEAT_TIMEOUT,
            audit_interval: constants::AUDIT_INTERVAL,
            max_latency: constants::DEFAULT_MAX_LATENCY,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

/// The shared channel state machine.
pub struct ChannelHandle {
    addressing: Arc<dyn ChannelAddressing>,
    signalling: Arc<dyn SignallingTransport>,
    local_signer: Address,
    politeness: Politeness,
    initiation: Mutex<Initiation>,
    tuning: ChannelTuning,
    channel_lock: Mutex<ChannelLockState>,
    heartbeat_lock: Mutex<HeartbeatLockState>,
    audit_lock: Mutex<AuditLockState>,
    events: broadcast::Sender<ChannelEvent>,
    sequence: std::sync::atomic::AtomicI64,
    started_peer_connection: AtomicBool,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("state", &self.state())
            .field("is_stable", &self.is_stable())
            .finish_non_exhaustive()
    }
}

impl ChannelHandle {
    /// Construct a new channel. Does not start negotiation; call
    /// `startPeerConnection` then `openAsync`/`acceptAsync`.
    #[must_use]
    pub fn new(
        addressing: Arc<dyn ChannelAddressing>,
        signalling: Arc<dyn SignallingTransport>,
        local_signer: Address,
        politeness: Politeness,
        initiation: Initiation,
        tuning: ChannelTuning,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            addressing,
            signalling,
            local_signer,
            politeness,
            initiation: Mutex::new(initiation),
            tuning,
            channel_lock: Mutex::new(ChannelLockState {
                state: ChannelState::Initiating,
                is_stable: false,
                peer_connection: None,
                data: None,
                command: None,
                signalling_timer: None,
            }),
            heartbeat_lock: Mutex::new(HeartbeatLockState {
                is_heartbeat_pending: false,
                last_sent_at: None,
                is_heartbeat_timeout: false,
                latency_ms: 0,
                is_high_latency: false,
                task: None,
            }),
            audit_lock: Mutex::new(AuditLockState {
                command_auditor: Arc::new(BufferAuditor::with_defaults()),
                data_auditor: Arc::new(BufferAuditor::with_defaults()),
                task: None,
                cleanup_tasks: Vec::new(),
            }),
            events,
            sequence: std::sync::atomic::AtomicI64::new(0),
            started_peer_connection: AtomicBool::new(false),
        })
    }

    /// Subscribe to channel events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.lock_channel().state
    }

    /// `true` iff `command` is open and ICE is connected.
    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.lock_channel().is_stable
    }

    /// Politeness, immutable for the channel's lifetime.
    #[must_use]
    pub fn politeness(&self) -> Politeness {
        self.politeness
    }

    /// Current measured latency in milliseconds (`0` = no data).
    #[must_use]
    pub fn latency_ms(&self) -> u64 {
        self.heartbeat_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner).latency_ms
    }

    fn lock_channel(&self) -> std::sync::MutexGuard<'_, ChannelLockState> {
        self.channel_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    /// Transition to `new_state`, returning whether this is a genuine change
    /// (duplicate transitions to the same state are suppressed) and whether
    /// `Open` was just reached. Must be called while already holding the
    /// channel lock's guard's logic inline — this helper takes the guard by
    /// reference so callers stay inside one critical section.
    fn transition(guard: &mut ChannelLockState, new_state: ChannelState) -> (bool, bool) {
        if guard.state == new_state {
            return (false, false);
        }
        let became_open = new_state == ChannelState::Open;
        guard.state = new_state;
        (true, became_open)
    }

    fn next_sequence(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn build_envelope(&self, payload: Message) -> Envelope {
        Envelope {
            timestamp: unix_now(),
            max_age: 60,
            priority: 0,
            sequence: self.next_sequence(),
            sender: self.addressing.local_party(),
            receiver: self.addressing.remote_party(),
            payload,
            signature: String::new(),
        }
    }

    // ---------------------------------------------------------------
    // 4.4.1 startPeerConnection
    // ---------------------------------------------------------------

    /// One-shot peer connection initialization.
    ///
    /// # Errors
    /// [`ChannelError::InternalPrecondition`] if already initialized.
    pub fn start_peer_connection(&self) -> Result<(), ChannelError> {
        if self.started_peer_connection.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::InternalPrecondition("peer connection already started".to_string()));
        }
        let ice_servers = self.tuning.ice_servers.iter().map(|url| IceServer { urls: vec![url.clone()] }).collect();
        let pc = PeerConnection::new(RtcConfiguration { ice_servers, ..Default::default() });
        self.lock_channel().peer_connection = Some(pc);
        Ok(())
    }

    // ---------------------------------------------------------------
    // 4.4.2 Negotiation — initiator path
    // ---------------------------------------------------------------

    /// Initiator path: create `data` then `command` channels, generate and
    /// send a local offer.
    pub async fn open_async(self: &Arc<Self>) -> Result<(), ChannelError> {
        {
            let guard = self.lock_channel();
            match guard.state {
                ChannelState::Open => {
                    log::info!("openAsync called while already Open; ignoring");
                    return Ok(());
                }
                ChannelState::Rejected if self.politeness == Politeness::Polite => {
                    return Err(ChannelError::InvalidStateTransition { state: guard.state, operation: "openAsync" });
                }
                ChannelState::Closed => {
                    let still_connected = guard
                        .peer_connection
                        .as_ref()
                        .is_some_and(|pc| pc.connection_state() == PeerConnectionState::Connected);
                    if still_connected {
                        drop(guard);
                        return self.reopen_data_channel_only().await;
                    }
                }
                _ => {}
            }
        }

        *self.initiation.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Initiation::InitiatedByUs;
        self.start_signalling_timer();

        {
            let mut guard = self.lock_channel();
            let (changed, _) = Self::transition(&mut guard, ChannelState::Connecting);
            drop(guard);
            if changed {
                self.emit(ChannelEvent::StateChange(ChannelState::Connecting));
            }
        }

        let connect_result =
            tokio::time::timeout(constants::SIGNALLING_CONNECT_BUDGET, self.signalling.connect()).await;
        if connect_result.is_err() || connect_result.as_ref().is_ok_and(Result::is_err) {
            self.cancel_signalling_timer(true);
            self.fail_and_timeout("signalling connect failed or timed out").await;
            return Err(ChannelError::NegotiationFailed("signalling connect failed".to_string()));
        }

        {
            let mut guard = self.lock_channel();
            let (changed, _) = Self::transition(&mut guard, ChannelState::Signalling);
            drop(guard);
            if changed {
                self.emit(ChannelEvent::StateChange(ChannelState::Signalling));
            }
        }

        let pc = self.require_peer_connection()?;
        let _data = pc
            .create_data_channel("data", rustrtc::DataChannelConfig::default())
            .map_err(|e| ChannelError::NegotiationFailed(format!("create data channel: {e}")))?;
        let command = pc
            .create_data_channel("command", rustrtc::DataChannelConfig::default())
            .map_err(|e| ChannelError::NegotiationFailed(format!("create command channel: {e}")))?;
        self.lock_channel().command = Some(command);

        let offer = pc
            .create_offer()
            .await
            .map_err(|e| ChannelError::NegotiationFailed(format!("create offer: {e}")))?;
        pc.set_local_description(offer.clone())
            .map_err(|e| ChannelError::NegotiationFailed(format!("set local description: {e}")))?;

        self.spawn_event_loop(pc);

        self.signalling
            .send(&self.build_envelope(Message::Offer { sdp: offer.to_sdp_string() }))
            .await
            .map_err(|e| ChannelError::TransportError(e.to_string()))?;

        Ok(())
    }

    async fn reopen_data_channel_only(self: &Arc<Self>) -> Result<(), ChannelError> {
        let pc = self.require_peer_connection()?;
        let data = pc
            .create_data_channel("data", rustrtc::DataChannelConfig::default())
            .map_err(|e| ChannelError::NegotiationFailed(format!("recreate data channel: {e}")))?;
        self.lock_channel().data = Some(data);
        self.recompute_stability();
        Ok(())
    }

    // ---------------------------------------------------------------
    // 4.4.2 Negotiation — responder path
    // ---------------------------------------------------------------

    /// Responder path: apply the remote offer, create and send an answer.
    pub async fn accept_async(self: &Arc<Self>, offer_sdp: &str) -> Result<(), ChannelError> {
        {
            let init = *self.initiation.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let guard = self.lock_channel();
            if init != Initiation::InitiatedByPeer || guard.state != ChannelState::Initiating {
                return Err(ChannelError::InvalidStateTransition { state: guard.state, operation: "acceptAsync" });
            }
        }

        self.start_signalling_timer();
        {
            let mut guard = self.lock_channel();
            let (changed, _) = Self::transition(&mut guard, ChannelState::Connecting);
            drop(guard);
            if changed {
                self.emit(ChannelEvent::StateChange(ChannelState::Connecting));
            }
        }

        self.signalling
            .connect()
            .await
            .map_err(|e| ChannelError::NegotiationFailed(format!("signalling connect: {e}")))?;

        {
            let mut guard = self.lock_channel();
            let (changed, _) = Self::transition(&mut guard, ChannelState::Signalling);
            drop(guard);
            if changed {
                self.emit(ChannelEvent::StateChange(ChannelState::Signalling));
            }
        }

        let pc = self.require_peer_connection()?;
        let offer = SessionDescription::parse(SdpType::Offer, offer_sdp)
            .map_err(|e| ChannelError::NegotiationFailed(format!("parse offer: {e}")))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| ChannelError::NegotiationFailed(format!("set remote description: {e}")))?;

        let answer = pc
            .create_answer()
            .await
            .map_err(|e| ChannelError::NegotiationFailed(format!("create answer: {e}")))?;
        pc.set_local_description(answer.clone())
            .map_err(|e| ChannelError::NegotiationFailed(format!("set local description: {e}")))?;

        self.spawn_event_loop(pc);

        self.signalling
            .send(&self.build_envelope(Message::Answer { sdp: answer.to_sdp_string() }))
            .await
            .map_err(|e| ChannelError::TransportError(e.to_string()))?;

        Ok(())
    }

    /// Symmetrical rejection path: send `Rejection`, transition to
    /// `Rejected`, release the peer connection.
    pub async fn reject_async(self: &Arc<Self>) -> Result<(), ChannelError> {
        {
            let guard = self.lock_channel();
            if guard.state != ChannelState::Initiating {
                return Err(ChannelError::InvalidStateTransition { state: guard.state, operation: "rejectAsync" });
            }
        }

        self.signalling
            .send(&self.build_envelope(Message::Rejection {}))
            .await
            .map_err(|e| ChannelError::TransportError(e.to_string()))?;

        let mut guard = self.lock_channel();
        let (changed, _) = Self::transition(&mut guard, ChannelState::Rejected);
        guard.peer_connection = None;
        drop(guard);
        if changed {
            self.emit(ChannelEvent::StateChange(ChannelState::Rejected));
        }
        Ok(())
    }

    fn require_peer_connection(&self) -> Result<PeerConnection, ChannelError> {
        self.lock_channel()
            .peer_connection
            .clone()
            .ok_or_else(|| ChannelError::InternalPrecondition("peer connection not started".to_string()))
    }

    fn start_signalling_timer(self: &Arc<Self>) {
        let timer = Arc::new(CancellableDelay::new(constants::SIGNALLING_TIMEOUT));
        self.lock_channel().signalling_timer = Some(Arc::clone(&timer));
        let weak = Arc::downgrade(self);
        timer.start(
            move || {
                if let Some(channel) = weak.upgrade() {
                    tokio::spawn(async move {
                        channel.fail_and_timeout("signalling timed out").await;
                    });
                }
            },
            || {},
        );
    }

    fn cancel_signalling_timer(&self, silent: bool) {
        if let Some(timer) = self.lock_channel().signalling_timer.take() {
            timer.cancel(silent);
        }
    }

    async fn fail_and_timeout(self: &Arc<Self>, reason: &str) {
        log::warn!("{} {}", self.addressing.log_context(), reason);
        let mut guard = self.lock_channel();
        if guard.state.is_terminal() {
            return;
        }
        let (changed, _) = Self::transition(&mut guard, ChannelState::Failed);
        drop(guard);
        if changed {
            self.emit(ChannelEvent::StateChange(ChannelState::Failed));
        }
        self.emit(ChannelEvent::Timeout);
    }

    // ---------------------------------------------------------------
    // Peer connection event loop: ICE candidates, inbound signalling, data
    // channel open/message/close.
    // ---------------------------------------------------------------

    fn spawn_event_loop(self: &Arc<Self>, pc: PeerConnection) {
        let channel = Arc::clone(self);
        let mut signalling_rx = self.signalling.subscribe();
        let mut ice_rx = pc.subscribe_ice_candidates();
        let mut state_rx = pc.subscribe_peer_state();
        let mut pc_events = pc.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = pc_events.recv() => {
                        match event {
                            Some(PeerConnectionEvent::DataChannel(dc)) => {
                                channel.handle_local_data_channel_opened(dc);
                            }
                            Some(_) | None => {}
                        }
                    }
                    Ok(()) = state_rx.changed() => {
                        let connected = *state_rx.borrow() == PeerConnectionState::Connected;
                        channel.on_ice_state_changed(connected);
                    }
                    Some(candidate) = ice_rx.recv() => {
                        channel.forward_local_ice_candidate(&candidate).await;
                    }
                    Ok(envelope) = signalling_rx.recv() => {
                        channel.handle_signalling_envelope(envelope).await;
                    }
                    else => break,
                }

                if channel.state().is_terminal() {
                    break;
                }
            }
        });
    }

    fn handle_local_data_channel_opened(self: &Arc<Self>, dc: Arc<rustrtc::DataChannel>) {
        let label = dc.label().to_string();
        let mut guard = self.lock_channel();
        if label == "command" {
            guard.command = Some(Arc::clone(&dc));
        } else {
            guard.data = Some(Arc::clone(&dc));
        }
        drop(guard);
        self.spawn_data_channel_reader(dc, label);
        self.recompute_stability();
    }

    fn spawn_data_channel_reader(self: &Arc<Self>, dc: Arc<rustrtc::DataChannel>, label: String) {
        let channel = Arc::clone(self);
        let mut reader = dc.clone();
        tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Some(rustrtc::DataChannelEvent::Message(bytes)) => {
                        if label == "command" {
                            channel.handle_command_message(&bytes).await;
                        } else {
                            channel.handle_data_message(&bytes).await;
                        }
                    }
                    Some(rustrtc::DataChannelEvent::Open) => {
                        channel.recompute_stability();
                    }
                    Some(rustrtc::DataChannelEvent::Close) | None => {
                        channel.handle_transport_error(&label).await;
                        break;
                    }
                }
            }
        });
    }

    fn on_ice_state_changed(self: &Arc<Self>, connected: bool) {
        if connected {
            self.recompute_stability();
        }
        // A non-connected ICE state does not itself fail the channel;
        // stability is recomputed on transport events only.
    }

    async fn forward_local_ice_candidate(&self, candidate: &IceCandidate) {
        let sdp_mid = candidate.sdp_mid().map_or_else(|| "0".to_string(), ToString::to_string);
        let envelope = self.build_envelope(Message::Candidate {
            candidate: candidate.to_sdp_string(),
            sdp_mid: Some(sdp_mid),
            sdp_m_line_index: candidate.sdp_m_line_index(),
        });
        if let Err(e) = self.signalling.send(&envelope).await {
            log::warn!("failed to forward local ICE candidate: {e}");
        }
    }

    async fn handle_signalling_envelope(self: &Arc<Self>, envelope: Envelope) {
        if let Err(e) = self.addressing.admit(&envelope, &self.local_signer) {
            log::warn!("{} admission rejected: {e}", self.addressing.log_context());
            return;
        }

        match envelope.payload {
            Message::Answer { sdp } => {
                let Ok(pc) = self.require_peer_connection() else { return };
                if let Ok(answer) = SessionDescription::parse(SdpType::Answer, &sdp) {
                    if let Err(e) = pc.set_remote_description(answer).await {
                        log::warn!("failed to apply remote answer: {e}");
                    }
                }
            }
            Message::Candidate { candidate, .. } => {
                let Ok(pc) = self.require_peer_connection() else { return };
                match IceCandidate::from_sdp(candidate.trim_start_matches("candidate:")) {
                    Ok(ice_candidate) => {
                        if let Err(e) = pc.add_ice_candidate(ice_candidate) {
                            log::warn!("failed to add ICE candidate: {e}");
                        }
                    }
                    Err(e) => log::warn!("failed to parse ICE candidate: {e}"),
                }
            }
            Message::Rejection {} => {
                let mut guard = self.lock_channel();
                let (changed, _) = Self::transition(&mut guard, ChannelState::Rejected);
                drop(guard);
                if changed {
                    self.emit(ChannelEvent::StateChange(ChannelState::Rejected));
                }
            }
            Message::Offer { .. } | Message::Broadcast { .. } | Message::Relay { .. } => {
                // Offers on an already-negotiating channel, and
                // Broadcast/Relay payloads, are manager-level concerns —
                // only surfaced here once the data channel is open.
                self.emit(ChannelEvent::Message(envelope));
            }
        }
    }

    fn recompute_stability(self: &Arc<Self>) {
        let mut guard = self.lock_channel();
        let command_open = guard.command.as_ref().is_some_and(|dc| dc.is_open());
        let ice_connected =
            guard.peer_connection.as_ref().is_some_and(|pc| pc.connection_state() == PeerConnectionState::Connected);
        let data_open = guard.data.as_ref().is_some_and(|dc| dc.is_open());

        guard.is_stable = command_open && ice_connected;

        if guard.is_stable && data_open && !guard.state.is_disposing_or_disposed() && guard.state != ChannelState::Closing {
            let (changed, became_open) = Self::transition(&mut guard, ChannelState::Open);
            drop(guard);
            self.cancel_signalling_timer(true);
            if changed {
                self.emit(ChannelEvent::StateChange(ChannelState::Open));
            }
            if became_open {
                self.emit(ChannelEvent::Open);
                self.emit(ChannelEvent::Stable);
                let signalling = Arc::clone(&self.signalling);
                tokio::spawn(async move { signalling.disconnect().await });
                self.start_heartbeat(None, None);
                self.start_auditor();
            }
        }
    }

    // ---------------------------------------------------------------
    // 4.4.3 Command channel protocol
    // ---------------------------------------------------------------

    async fn handle_command_message(self: &Arc<Self>, bytes: &[u8]) {
        let token = String::from_utf8_lossy(bytes);
        self.record_command_send(0); // observing an inbound frame does not record an outbound commitment
        match token.as_ref() {
            "Ping" => {
                self.send_command(b"Pong").await;
            }
            "Pong" => self.complete_heartbeat(),
            "Close" => {
                let channel = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = channel.close_async_inner(false).await;
                });
            }
            "Dispose" => {
                let channel = Arc::clone(self);
                tokio::spawn(async move {
                    channel.dispose().await;
                });
            }
            other => log::debug!("ignoring unknown command token: {other}"),
        }
    }

    async fn handle_data_message(self: &Arc<Self>, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        if text.eq_ignore_ascii_case("ping") {
            self.send_raw_data(b"pong").await;
            return;
        }
        if let Some(rest) = text.strip_prefix("echo:") {
            self.send_raw_data(rest.trim_start().as_bytes()).await;
            return;
        }
        if let Ok(envelope) = Envelope::deserialize(&text) {
            self.emit(ChannelEvent::Message(envelope));
        } else {
            log::debug!("dropping undecodable data channel frame");
        }
    }

    async fn handle_transport_error(self: &Arc<Self>, label: &str) {
        log::warn!("{} transport error on {label}", self.addressing.log_context());
        let mut guard = self.lock_channel();
        if guard.state.is_terminal() {
            return;
        }
        let (changed, _) = Self::transition(&mut guard, ChannelState::Failed);
        drop(guard);
        if changed {
            self.emit(ChannelEvent::StateChange(ChannelState::Failed));
        }
    }

    // ---------------------------------------------------------------
    // 4.4.4 Heartbeat
    // ---------------------------------------------------------------

    /// Start the heartbeat loop. No-op if already running.
    pub fn start_heartbeat(self: &Arc<Self>, interval: Option<Duration>, timeout: Option<Duration>) {
        let interval = interval.unwrap_or(self.tuning.heartbeat_interval);
        let timeout = timeout.unwrap_or(self.tuning.heartbeat_timeout);
        let tick = interval.min(timeout);

        let mut hb = self.heartbeat_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if hb.task.is_some() {
            return;
        }
        let channel = Arc::clone(self);
        hb.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                ticker.tick().await;
                if channel.state().is_terminal() {
                    break;
                }
                channel.heartbeat_tick(interval, timeout).await;
            }
        }));
    }

    /// Stop the heartbeat loop and reset latency to the no-data sentinel.
    pub fn stop_heartbeat(&self) {
        let mut hb = self.heartbeat_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(task) = hb.task.take() {
            task.abort();
        }
        hb.is_heartbeat_pending = false;
        hb.is_heartbeat_timeout = false;
        hb.latency_ms = 0;
        hb.is_high_latency = false;
    }

    async fn heartbeat_tick(self: &Arc<Self>, interval: Duration, timeout: Duration) {
        if !self.is_stable() {
            return;
        }

        enum Action {
            None,
            FireTimeout,
            SendPing,
        }

        let action = {
            let mut hb = self.heartbeat_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let now = Instant::now();
            if hb.is_heartbeat_pending {
                let elapsed = hb.last_sent_at.map(|sent| now.duration_since(sent));
                if !hb.is_heartbeat_timeout && elapsed.is_some_and(|e| e > timeout) {
                    hb.is_heartbeat_timeout = true;
                    Action::FireTimeout
                } else {
                    Action::None
                }
            } else if hb.last_sent_at.is_none_or(|sent| now.duration_since(sent) >= interval) {
                hb.last_sent_at = Some(now);
                hb.is_heartbeat_pending = true;
                Action::SendPing
            } else {
                Action::None
            }
        };

        match action {
            Action::FireTimeout => self.emit(ChannelEvent::Timeout),
            Action::SendPing => self.send_command(b"Ping").await,
            Action::None => {}
        }
    }

    fn complete_heartbeat(self: &Arc<Self>) {
        let result = {
            let mut hb = self.heartbeat_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let Some(sent_at) = hb.last_sent_at else { return };
            let latency_ms = u64::try_from(Instant::now().duration_since(sent_at).as_millis()).unwrap_or(u64::MAX);
            hb.is_heartbeat_pending = false;
            hb.is_heartbeat_timeout = false;

            let latency_changed = hb.latency_ms != latency_ms;
            hb.latency_ms = latency_ms;

            let now_high = Duration::from_millis(latency_ms) > self.tuning.max_latency;
            let high_transitioned = now_high && !hb.is_high_latency;
            hb.is_high_latency = now_high;

            (latency_changed, latency_ms, high_transitioned)
        };

        let (latency_changed, latency_ms, high_transitioned) = result;
        if latency_changed {
            self.emit(ChannelEvent::Latency(latency_ms));
        }
        if high_transitioned {
            self.emit(ChannelEvent::HighLatency(latency_ms));
        }
    }

    // ---------------------------------------------------------------
    // 4.4.5 Buffer audit loop
    // ---------------------------------------------------------------

    /// Start the buffer audit loop, plus each auditor's own background
    /// expiry sweep. No-op if already running.
    pub fn start_auditor(self: &Arc<Self>) {
        let mut audit = self.audit_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if audit.task.is_some() {
            return;
        }
        audit.cleanup_tasks.push(audit.command_auditor.spawn_cleanup());
        audit.cleanup_tasks.push(audit.data_auditor.spawn_cleanup());

        let channel = Arc::clone(self);
        audit.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(channel.tuning.audit_interval);
            loop {
                ticker.tick().await;
                if channel.audit_tick().await {
                    break;
                }
            }
        }));
    }

    /// Stop the buffer audit loop and both auditors' cleanup sweeps.
    pub fn stop_auditor(&self) {
        let mut audit = self.audit_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(task) = audit.task.take() {
            task.abort();
        }
        audit.command_auditor.cancel();
        audit.data_auditor.cancel();
        for task in audit.cleanup_tasks.drain(..) {
            task.abort();
        }
    }

    /// One audit tick. Returns `true` if the loop should stop.
    async fn audit_tick(self: &Arc<Self>) -> bool {
        enum Outcome {
            Stop,
            RequestDispose,
            RequestClose,
            Continue,
        }

        let outcome = {
            let guard = self.lock_channel();
            if guard.state.is_disposing_or_disposed() {
                Outcome::Stop
            } else if !guard.state.is_terminal() && !guard.command.as_ref().is_some_and(|dc| dc.is_open()) {
                Outcome::RequestDispose
            } else if guard.state == ChannelState::Open && !guard.data.as_ref().is_some_and(|dc| dc.is_open()) {
                Outcome::RequestClose
            } else {
                let command_buffered = guard.command.as_ref().map_or(0, |dc| dc.buffered_amount());
                let data_buffered = guard.data.as_ref().map_or(0, |dc| dc.buffered_amount());
                let audit = self.audit_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if !audit.command_auditor.audit(command_buffered) {
                    Outcome::RequestDispose
                } else if !audit.data_auditor.audit(data_buffered) {
                    Outcome::RequestClose
                } else {
                    Outcome::Continue
                }
            }
        };

        match outcome {
            Outcome::Stop => true,
            Outcome::RequestDispose => {
                let channel = Arc::clone(self);
                tokio::spawn(async move { channel.dispose().await });
                false
            }
            Outcome::RequestClose => {
                let channel = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = channel.close_async_inner(true).await;
                });
                false
            }
            Outcome::Continue => false,
        }
    }

    fn record_command_send(&self, bytes: usize) {
        self.audit_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner).command_auditor.record(bytes);
    }

    fn record_data_send(&self, bytes: usize) {
        self.audit_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner).data_auditor.record(bytes);
    }

    // ---------------------------------------------------------------
    // 4.4.6 Send path
    // ---------------------------------------------------------------

    /// Send application text over the `data` channel. Requires `State = Open`.
    pub async fn send(&self, text: &str) -> Result<(), ChannelError> {
        let data = {
            let guard = self.lock_channel();
            if guard.state != ChannelState::Open {
                return Err(ChannelError::InvalidStateTransition { state: guard.state, operation: "send" });
            }
            guard.data.clone().ok_or_else(|| ChannelError::InternalPrecondition("no data channel".to_string()))?
        };
        self.record_data_send(text.len());
        data.send(text.as_bytes()).map_err(|e| ChannelError::TransportError(e.to_string()))
    }

    async fn send_raw_data(&self, bytes: &[u8]) {
        let data = self.lock_channel().data.clone();
        if let Some(data) = data {
            self.record_data_send(bytes.len());
            if let Err(e) = data.send(bytes) {
                log::warn!("failed to send on data channel: {e}");
            }
        }
    }

    async fn send_command(&self, bytes: &[u8]) {
        let command = self.lock_channel().command.clone();
        if let Some(command) = command {
            self.record_command_send(bytes.len());
            if let Err(e) = command.send(bytes) {
                log::warn!("failed to send on command channel: {e}");
            }
        }
    }

    // ---------------------------------------------------------------
    // 4.4.7 Close / Dispose
    // ---------------------------------------------------------------

    /// Graceful close: send `Close`, wait for drain, close the data channel,
    /// transition to `Closed`. The command channel is retained so the
    /// channel may be reopened.
    pub async fn close_async(self: &Arc<Self>) -> Result<(), ChannelError> {
        self.close_async_inner(true).await
    }

    async fn close_async_inner(self: &Arc<Self>, notify: bool) -> Result<(), ChannelError> {
        {
            let guard = self.lock_channel();
            if guard.state != ChannelState::Open {
                log::warn!("closeAsync called while not Open (state={:?}); ignoring", guard.state);
                return Ok(());
            }
        }

        {
            let mut guard = self.lock_channel();
            let (changed, _) = Self::transition(&mut guard, ChannelState::Closing);
            drop(guard);
            if changed {
                self.emit(ChannelEvent::StateChange(ChannelState::Closing));
            }
        }

        self.stop_heartbeat();

        if notify {
            self.send_command(b"Close").await;
            self.wait_for_command_drain().await;
        }

        if let Some(data) = self.lock_channel().data.take() {
            let _ = data.close();
        }

        let mut guard = self.lock_channel();
        let (changed, _) = Self::transition(&mut guard, ChannelState::Closed);
        drop(guard);
        if changed {
            self.emit(ChannelEvent::StateChange(ChannelState::Closed));
        }
        Ok(())
    }

    async fn wait_for_command_drain(&self) {
        let deadline = Instant::now() + constants::COMMAND_DRAIN_TIMEOUT;
        loop {
            let buffered = self.lock_channel().command.as_ref().map_or(0, |dc| dc.buffered_amount());
            if buffered == 0 || Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(constants::COMMAND_DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Hard teardown: best-effort `Dispose` notification, close and release
    /// everything, mark `Disposed`, fire `onDispose`. Idempotent.
    pub async fn dispose(self: &Arc<Self>) {
        {
            let mut guard = self.lock_channel();
            if guard.state.is_terminal() {
                return;
            }
            let (changed, _) = Self::transition(&mut guard, ChannelState::Disposing);
            drop(guard);
            if changed {
                self.emit(ChannelEvent::StateChange(ChannelState::Disposing));
            }
        }

        self.stop_auditor();
        self.stop_heartbeat();
        self.cancel_signalling_timer(true);

        let command_open = self.lock_channel().command.as_ref().is_some_and(|dc| dc.is_open());
        if command_open {
            self.send_command(b"Dispose").await;
            self.wait_for_command_drain().await;
        }

        let (command, data, pc) = {
            let mut guard = self.lock_channel();
            (guard.command.take(), guard.data.take(), guard.peer_connection.take())
        };
        if let Some(command) = command {
            let _ = command.close();
        }
        if let Some(data) = data {
            let _ = data.close();
        }
        if let Some(pc) = pc {
            pc.close();
        }

        let mut guard = self.lock_channel();
        let (changed, _) = Self::transition(&mut guard, ChannelState::Disposed);
        drop(guard);
        if changed {
            self.emit(ChannelEvent::StateChange(ChannelState::Disposed));
        }
        self.emit(ChannelEvent::Dispose);
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if !self.state().is_terminal() {
            log::warn!("{} dropped without dispose()", self.addressing.log_context());
        }
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Party;

    #[derive(Debug)]
    struct TestAddressing {
        local: Address,
        remote: Address,
    }

    impl ChannelAddressing for TestAddressing {
        fn local_party(&self) -> Party {
            Party { account: "node".to_string(), signer: self.local.to_string() }
        }
        fn remote_party(&self) -> Party {
            Party { account: "node".to_string(), signer: self.remote.to_string() }
        }
        fn admit(&self, envelope: &Envelope, local_signer: &Address) -> Result<(), ChannelError> {
            if envelope.receiver.signer != local_signer.to_string() {
                return Err(ChannelError::AdmissionRejected("receiver mismatch".to_string()));
            }
            Ok(())
        }
        fn log_context(&self) -> LogContext {
            LogContext::new().with("type", "node")
        }
    }

    fn addressing(local: &str, remote: &str) -> Arc<dyn ChannelAddressing> {
        Arc::new(TestAddressing {
            local: Address::parse(&local.repeat(40)).unwrap(),
            remote: Address::parse(&remote.repeat(40)).unwrap(),
        })
    }

    #[tokio::test]
    async fn test_reject_async_transitions_to_rejected() {
        let (a, _b) = crate::signalling::LoopbackSignalling::pair();
        a.connect().await.unwrap();
        let channel = ChannelHandle::new(
            addressing("a", "b"),
            a,
            Address::parse(&"a".repeat(40)).unwrap(),
            Politeness::Polite,
            Initiation::InitiatedByPeer,
            ChannelTuning::default(),
        );
        channel.reject_async().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Rejected);
    }

    #[tokio::test]
    async fn test_send_fails_unless_open() {
        let (a, _b) = crate::signalling::LoopbackSignalling::pair();
        let channel = ChannelHandle::new(
            addressing("a", "b"),
            a,
            Address::parse(&"a".repeat(40)).unwrap(),
            Politeness::Impolite,
            Initiation::InitiatedByUs,
            ChannelTuning::default(),
        );
        assert!(channel.send("hi").await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_when_not_open() {
        let (a, _b) = crate::signalling::LoopbackSignalling::pair();
        let channel = ChannelHandle::new(
            addressing("a", "b"),
            a,
            Address::parse(&"a".repeat(40)).unwrap(),
            Politeness::Impolite,
            Initiation::InitiatedByUs,
            ChannelTuning::default(),
        );
        assert!(channel.close_async().await.is_ok());
        assert_eq!(channel.state(), ChannelState::Initiating);
    }

    #[tokio::test]
    async fn test_stopping_heartbeat_resets_latency_sentinel() {
        let (a, _b) = crate::signalling::LoopbackSignalling::pair();
        let channel = ChannelHandle::new(
            addressing("a", "b"),
            a,
            Address::parse(&"a".repeat(40)).unwrap(),
            Politeness::Impolite,
            Initiation::InitiatedByUs,
            ChannelTuning::default(),
        );
        channel.start_heartbeat(None, None);
        channel.stop_heartbeat();
        assert_eq!(channel.latency_ms(), 0);
    }
}
