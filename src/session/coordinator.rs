//! Call session coordination.
//!
//! One [`CallSessionCoordinator`] exists per signed-in account. All
//! session state lives inside a single task that consumes commands, inbound
//! signals, engine events, and timers from one queue, so no two handlers
//! ever run concurrently and no locking is needed around the session.
//! Suspension points (media acquisition, transport sends, SDP work) are
//! awaited inline inside the owning task.
//!
//! Duplicate, stale, and out-of-order conditions are resolved here: a
//! repeated `call-request` for the active room is ignored, a competing
//! request gets an automatic busy reject, and engine events carry the call
//! id they belong to so results arriving after teardown are discarded.

use crate::error::CallError;
use crate::negotiation::engine::{
    ConnectionState, EngineError, EngineEvent, MediaEngine, MediaEngineFactory, SdpKind,
};
use crate::negotiation::state::NegotiationState;
use crate::session::log::{CallLog, NoopCallLog};
use crate::session::state::{
    ActiveCallSession, CallPhase, CallTransition, InvalidTransition,
};
use crate::signaling::message::{CallSignal, IncomingCallPayload, SignalKind};
use crate::signaling::transport::{
    SignalingTransport, Subscription, SubscriptionHandle, TransportError,
};
use crate::types::call::{
    AccountId, CallDirection, CallId, CallLogEntry, EndCallReason, MediaKind, RoomId,
};
use crate::types::events::{CallEvent, CallEvents};
use crate::ui::bridge::{NativeCallUi, NativeUiBridge, NativeUiEvent, NoopCallUi};
use chrono::Utc;
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const COMMAND_CAPACITY: usize = 128;

/// Configuration for the session coordinator.
#[derive(Clone)]
pub struct CoordinatorConfig {
    /// How long an unanswered call rings before timing out: outgoing calls
    /// end as `NoAnswer`, incoming calls as `Missed`.
    pub ring_timeout: Duration,
    /// Bounded wait for transport subscribe operations before falling back
    /// to a setup failure.
    pub subscribe_timeout: Duration,
    /// Native call UI capability; `NoopCallUi` on platforms without one.
    pub native_ui: Arc<dyn NativeCallUi>,
    /// Call history sink.
    pub call_log: Arc<dyn CallLog>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(45),
            subscribe_timeout: Duration::from_secs(10),
            native_ui: Arc::new(NoopCallUi),
            call_log: Arc::new(NoopCallLog),
        }
    }
}

impl fmt::Debug for CoordinatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorConfig")
            .field("ring_timeout", &self.ring_timeout)
            .field("subscribe_timeout", &self.subscribe_timeout)
            .finish()
    }
}

enum Command {
    StartCall {
        peer: AccountId,
        peer_name: Option<String>,
        media: MediaKind,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    HangUp {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    SetMuted(bool),
    SetMinimized(bool),
    PushWake(IncomingCallPayload),
    NativeUi(NativeUiEvent),
    Inbound(CallSignal),
    Engine { call_id: CallId, event: EngineEvent },
    RingTimeout { call_id: CallId },
    Shutdown,
}

/// Orchestrates the lifecycle of the single active call for one account.
pub struct CallSessionCoordinator {
    account_id: AccountId,
    commands: mpsc::Sender<Command>,
    events: CallEvents,
    snapshot: watch::Receiver<Option<ActiveCallSession>>,
}

impl CallSessionCoordinator {
    /// Subscribe the account inbox and start the coordinator task.
    pub async fn start(
        account_id: AccountId,
        transport: Arc<dyn SignalingTransport>,
        engine_factory: Arc<dyn MediaEngineFactory>,
        config: CoordinatorConfig,
    ) -> Result<Arc<Self>, CallError> {
        let inbox = match timeout(
            config.subscribe_timeout,
            transport.subscribe_inbox(&account_id),
        )
        .await
        {
            Ok(Ok(sub)) => sub,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TransportError::Timeout.into()),
        };

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let events = CallEvents::new();

        // The inbox pump lives for the coordinator's whole lifetime; it
        // exits on its own when the command queue closes.
        let _ = spawn_signal_pump(inbox.signals, commands_tx.clone());

        let core = CoordinatorCore {
            account_id: account_id.clone(),
            config: config.clone(),
            transport,
            engine_factory,
            bridge: NativeUiBridge::new(config.native_ui),
            call_log: config.call_log,
            events: events.clone(),
            commands: commands_tx.clone(),
            snapshot: snapshot_tx,
            inbox_sub: Some(inbox.handle),
            session: None,
        };
        tokio::spawn(run(core, commands_rx));

        info!("call coordinator started for {}", account_id);
        Ok(Arc::new(Self {
            account_id,
            commands: commands_tx,
            events,
            snapshot: snapshot_rx,
        }))
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// Start an outgoing call to `peer`.
    pub async fn start_call(
        &self,
        peer: AccountId,
        peer_name: Option<String>,
        media: MediaKind,
    ) -> Result<CallId, CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StartCall {
            peer,
            peer_name,
            media,
            reply,
        })
        .await?;
        rx.await.map_err(|_| CallError::Shutdown)?
    }

    /// Accept the ringing incoming call.
    pub async fn accept(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Accept { reply }).await?;
        rx.await.map_err(|_| CallError::Shutdown)?
    }

    /// Decline the ringing incoming call.
    pub async fn reject(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reject { reply }).await?;
        rx.await.map_err(|_| CallError::Shutdown)?
    }

    /// End the active call (or cancel an unanswered outgoing one).
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::HangUp { reply }).await?;
        rx.await.map_err(|_| CallError::Shutdown)?
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.send(Command::SetMuted(muted)).await
    }

    pub async fn set_minimized(&self, minimized: bool) -> Result<(), CallError> {
        self.send(Command::SetMinimized(minimized)).await
    }

    /// Route a push-wake payload as if the `call-request` had arrived on
    /// the inbox.
    pub async fn handle_push_wake(&self, payload: IncomingCallPayload) -> Result<(), CallError> {
        self.send(Command::PushWake(payload)).await
    }

    /// Route a native call UI action back into the state machine.
    pub async fn handle_native_event(&self, event: NativeUiEvent) -> Result<(), CallError> {
        self.send(Command::NativeUi(event)).await
    }

    /// Subscribe to the coordinator's event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the current session, if any.
    pub fn session_snapshot(&self) -> Option<ActiveCallSession> {
        self.snapshot.borrow().clone()
    }

    /// Watch the session as it changes. Handy for UIs and tests.
    pub fn watch_session(&self) -> watch::Receiver<Option<ActiveCallSession>> {
        self.snapshot.clone()
    }

    /// Stop the coordinator, tearing down any active call first.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn send(&self, command: Command) -> Result<(), CallError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CallError::Shutdown)
    }
}

impl fmt::Debug for CallSessionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSessionCoordinator")
            .field("account_id", &self.account_id)
            .field("session", &self.session_snapshot().map(|s| s.call_id))
            .finish()
    }
}

/// Everything owned by the coordinator task for one active call.
struct SessionCtx {
    info: ActiveCallSession,
    negotiation: NegotiationState,
    engine: Option<Arc<dyn MediaEngine>>,
    engine_pump: Option<JoinHandle<()>>,
    room_sub: Option<SubscriptionHandle>,
    room_pump: Option<JoinHandle<()>>,
    ring_timer: Option<JoinHandle<()>>,
}

struct CoordinatorCore {
    account_id: AccountId,
    config: CoordinatorConfig,
    transport: Arc<dyn SignalingTransport>,
    engine_factory: Arc<dyn MediaEngineFactory>,
    bridge: NativeUiBridge,
    call_log: Arc<dyn CallLog>,
    events: CallEvents,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Sender<Option<ActiveCallSession>>,
    inbox_sub: Option<SubscriptionHandle>,
    session: Option<SessionCtx>,
}

async fn run(mut core: CoordinatorCore, mut commands: mpsc::Receiver<Command>) {
    while let Some(command) = commands.recv().await {
        let shutdown = matches!(command, Command::Shutdown);
        core.handle(command).await;
        core.publish_snapshot();
        if shutdown {
            break;
        }
    }
    debug!("coordinator loop for {} finished", core.account_id);
}

impl CoordinatorCore {
    async fn handle(&mut self, command: Command) {
        match command {
            Command::StartCall {
                peer,
                peer_name,
                media,
                reply,
            } => {
                let result = self.handle_start_call(peer, peer_name, media).await;
                let _ = reply.send(result);
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.handle_accept().await);
            }
            Command::Reject { reply } => {
                let _ = reply.send(self.handle_reject().await);
            }
            Command::HangUp { reply } => {
                let _ = reply.send(self.handle_hang_up().await);
            }
            Command::SetMuted(muted) => self.handle_set_muted(muted).await,
            Command::SetMinimized(minimized) => self.handle_set_minimized(minimized),
            Command::PushWake(payload) => self.handle_push_wake(payload).await,
            Command::NativeUi(event) => self.handle_native_event(event).await,
            Command::Inbound(signal) => self.handle_inbound(signal).await,
            Command::Engine { call_id, event } => self.handle_engine(call_id, event).await,
            Command::RingTimeout { call_id } => self.handle_ring_timeout(call_id).await,
            Command::Shutdown => {
                if self.session.is_some() {
                    self.teardown(EndCallReason::UserEnded, false).await;
                }
                if let Some(handle) = self.inbox_sub.take() {
                    let _ = self.transport.unsubscribe(handle).await;
                }
            }
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = self.session.as_ref().map(|ctx| ctx.info.clone());
        self.snapshot.send_replace(snapshot);
    }

    // ==================== Local actions ====================

    async fn handle_start_call(
        &mut self,
        peer: AccountId,
        peer_name: Option<String>,
        media: MediaKind,
    ) -> Result<CallId, CallError> {
        if self.session.is_some() {
            return Err(CallError::AlreadyInCall);
        }

        let call_id = CallId::generate();
        let room_id = RoomId::for_participants(&self.account_id, &peer);

        let room = self.subscribe_room_bounded(&room_id).await?;
        let room_pump = spawn_signal_pump(room.signals, self.commands.clone());

        let info = ActiveCallSession::new_outgoing(
            call_id.clone(),
            room_id.clone(),
            peer.clone(),
            peer_name,
            media,
        );

        let request = CallSignal::new(
            SignalKind::CallRequest,
            call_id.clone(),
            room_id.clone(),
            self.account_id.clone(),
            self.account_id.clone(),
            peer.clone(),
            media,
        );
        if let Err(e) = self.transport.send_to_inbox(&peer, request).await {
            room_pump.abort();
            let _ = self.transport.unsubscribe(room.handle).await;
            return Err(e.into());
        }

        info!(
            "outgoing {} call {} to {}",
            media_label(media),
            call_id,
            peer
        );

        self.call_log.call_started(log_entry(&info)).await;
        self.bridge.on_outgoing_started(&info).await;
        self.events.emit(CallEvent::OutgoingStarted {
            session: info.clone(),
        });

        let ring_timer = self.spawn_ring_timer(call_id.clone());
        self.session = Some(SessionCtx {
            info,
            negotiation: NegotiationState::new(),
            engine: None,
            engine_pump: None,
            room_sub: Some(room.handle),
            room_pump: Some(room_pump),
            ring_timer: Some(ring_timer),
        });

        Ok(call_id)
    }

    async fn handle_accept(&mut self) -> Result<(), CallError> {
        let Some(ctx) = self.session.as_mut() else {
            return Err(CallError::NoActiveCall);
        };
        ctx.info.apply_transition(CallTransition::LocalAccepted)?;
        if let Some(timer) = ctx.ring_timer.take() {
            timer.abort();
        }
        let room_id = ctx.info.room_id.clone();

        // Accept-then-offer: the caller only starts media setup once this
        // signal arrives, so nothing is allocated for unanswered calls.
        let accept = self.room_signal(SignalKind::CallAccept);
        if let Err(e) = self.transport.send_to_room(&room_id, accept).await {
            self.fail_session(EndCallReason::TransportFailed, e.to_string())
                .await;
            return Err(e.into());
        }

        self.emit_phase_changed();
        Ok(())
    }

    async fn handle_reject(&mut self) -> Result<(), CallError> {
        let Some(ctx) = self.session.as_ref() else {
            return Err(CallError::NoActiveCall);
        };
        if !ctx.info.phase.can_reject() {
            return Err(CallError::InvalidTransition(InvalidTransition {
                current_phase: format!("{:?}", ctx.info.phase),
                attempted: "LocalRejected".to_string(),
            }));
        }
        let room_id = ctx.info.room_id.clone();

        let reject = self.room_signal(SignalKind::CallReject);
        if let Err(e) = self.transport.send_to_room(&room_id, reject).await {
            debug!("failed to send call-reject: {}", e);
        }
        // The reject already told the peer; skip the call-end.
        self.teardown(EndCallReason::Declined, true).await;
        Ok(())
    }

    async fn handle_hang_up(&mut self) -> Result<(), CallError> {
        if self.session.is_none() {
            return Err(CallError::NoActiveCall);
        }
        self.teardown(EndCallReason::UserEnded, false).await;
        Ok(())
    }

    async fn handle_set_muted(&mut self, muted: bool) {
        let Some(ctx) = self.session.as_mut() else {
            debug!("mute change with no active session, ignoring");
            return;
        };
        ctx.info.is_muted = muted;
        let call_id = ctx.info.call_id.clone();
        if let Some(engine) = ctx.engine.clone() {
            engine.set_muted(muted).await;
        }
        self.events.emit(CallEvent::MuteChanged { call_id, muted });
    }

    fn handle_set_minimized(&mut self, minimized: bool) {
        if let Some(ctx) = self.session.as_mut() {
            ctx.info.is_minimized = minimized;
        }
    }

    async fn handle_push_wake(&mut self, payload: IncomingCallPayload) {
        debug!(
            "push wake for call {} from {}",
            payload.call_id, payload.caller_id
        );
        let caller_name = payload.caller_name.clone();
        let signal = payload.into_signal(self.account_id.clone());
        self.handle_call_request(signal, caller_name).await;
    }

    async fn handle_native_event(&mut self, event: NativeUiEvent) {
        let Some(ctx) = self.session.as_ref() else {
            debug!("native ui event with no active session, ignoring");
            return;
        };
        if ctx.info.call_id != *event.call_id() {
            debug!(
                "native ui event for stale call {}, ignoring",
                event.call_id()
            );
            return;
        }
        let can_reject = ctx.info.phase.can_reject();
        match event {
            NativeUiEvent::Answer { .. } => {
                if let Err(e) = self.handle_accept().await {
                    warn!("native answer failed: {}", e);
                }
            }
            NativeUiEvent::End { .. } => {
                let result = if can_reject {
                    self.handle_reject().await
                } else {
                    self.handle_hang_up().await
                };
                if let Err(e) = result {
                    warn!("native end failed: {}", e);
                }
            }
            NativeUiEvent::Mute { .. } => self.handle_set_muted(true).await,
            NativeUiEvent::Unmute { .. } => self.handle_set_muted(false).await,
            // No hold primitive in the engine; mute stands in.
            NativeUiEvent::Hold { .. } => self.handle_set_muted(true).await,
            NativeUiEvent::Unhold { .. } => self.handle_set_muted(false).await,
        }
    }

    // ==================== Inbound signals ====================

    async fn handle_inbound(&mut self, signal: CallSignal) {
        if signal.sender_id == self.account_id {
            // Room channels echo our own publishes back to us.
            return;
        }
        debug!(
            "received {} for call {} from {}",
            signal.kind, signal.call_id, signal.sender_id
        );

        if signal.kind == SignalKind::CallRequest {
            self.handle_call_request(signal, None).await;
            return;
        }

        {
            let Some(ctx) = self.session.as_ref() else {
                debug!("{} with no active session, discarding", signal.kind);
                return;
            };
            if ctx.info.call_id != signal.call_id {
                debug!(
                    "{} for call {} but active call is {}, discarding",
                    signal.kind, signal.call_id, ctx.info.call_id
                );
                return;
            }
        }

        match signal.kind {
            SignalKind::CallRinging => self.handle_remote_ringing(),
            SignalKind::CallAccept => self.handle_remote_accept().await,
            SignalKind::CallReject => {
                info!("call {} rejected by peer", signal.call_id);
                self.teardown(EndCallReason::Declined, true).await;
            }
            SignalKind::CallEnd => {
                info!("call {} ended by peer", signal.call_id);
                self.teardown(EndCallReason::RemoteEnded, true).await;
            }
            SignalKind::Offer => self.handle_offer(signal).await,
            SignalKind::Answer => self.handle_answer(signal).await,
            SignalKind::IceCandidate => self.handle_ice_candidate(signal).await,
            SignalKind::CallRequest => unreachable!("handled above"),
        }
    }

    async fn handle_call_request(&mut self, signal: CallSignal, caller_name: Option<String>) {
        if let Some(ctx) = &self.session {
            if ctx.info.room_id == signal.room_id {
                debug!("duplicate call-request for active room, ignoring");
            } else {
                // Busy: auto-reject the new caller without touching the
                // active session.
                info!(
                    "busy: rejecting call {} from {} while in call {}",
                    signal.call_id, signal.caller_id, ctx.info.call_id
                );
                let reject = CallSignal::new(
                    SignalKind::CallReject,
                    signal.call_id.clone(),
                    signal.room_id.clone(),
                    self.account_id.clone(),
                    signal.caller_id.clone(),
                    signal.callee_id.clone(),
                    signal.media_kind,
                );
                if let Err(e) = self
                    .transport
                    .send_to_inbox(&signal.caller_id, reject)
                    .await
                {
                    warn!("failed to send busy reject: {}", e);
                }
            }
            return;
        }

        let room = match self.subscribe_room_bounded(&signal.room_id).await {
            Ok(room) => room,
            Err(e) => {
                warn!(
                    "cannot join room for incoming call {}: {}",
                    signal.call_id, e
                );
                self.events.emit(CallEvent::Failure {
                    call_id: signal.call_id.clone(),
                    reason: EndCallReason::TransportFailed,
                    message: e.to_string(),
                });
                return;
            }
        };
        let room_pump = spawn_signal_pump(room.signals, self.commands.clone());

        let info = ActiveCallSession::new_incoming(
            signal.call_id.clone(),
            signal.room_id.clone(),
            signal.caller_id.clone(),
            caller_name,
            signal.media_kind,
        );

        info!(
            "incoming {} call {} from {}",
            media_label(info.media_kind),
            info.call_id,
            info.peer_id
        );

        let ring_timer = self.spawn_ring_timer(info.call_id.clone());
        self.session = Some(SessionCtx {
            info: info.clone(),
            negotiation: NegotiationState::new(),
            engine: None,
            engine_pump: None,
            room_sub: Some(room.handle),
            room_pump: Some(room_pump),
            ring_timer: Some(ring_timer),
        });

        // Tell the caller's UI we are alerting.
        let ringing = self.room_signal(SignalKind::CallRinging);
        if let Err(e) = self.transport.send_to_room(&info.room_id, ringing).await {
            warn!("failed to send call-ringing: {}", e);
        }

        self.call_log.call_started(log_entry(&info)).await;
        self.bridge.on_incoming_offered(&info).await;
        self.events.emit(CallEvent::IncomingCall { session: info });
    }

    fn handle_remote_ringing(&mut self) {
        let Some(ctx) = self.session.as_mut() else {
            return;
        };
        // Advisory: the callee may accept without this ever arriving.
        match ctx.info.apply_transition(CallTransition::RemoteRinging) {
            Ok(()) => self.emit_phase_changed(),
            Err(e) => debug!("ignoring call-ringing: {}", e),
        }
    }

    /// The callee accepted our request: acquire media, create the offer,
    /// and send it through the room. This is the only path that creates an
    /// outgoing offer.
    async fn handle_remote_accept(&mut self) {
        {
            let Some(ctx) = self.session.as_mut() else {
                return;
            };
            if !ctx.info.is_outgoing() {
                debug!("call-accept on incoming call, discarding");
                return;
            }
            match ctx.info.apply_transition(CallTransition::RemoteAccepted) {
                Ok(()) => {}
                Err(e) => {
                    debug!("ignoring call-accept: {}", e);
                    return;
                }
            }
            if let Some(timer) = ctx.ring_timer.take() {
                timer.abort();
            }
        }
        self.emit_phase_changed();

        if let Err(e) = self.setup_engine_and_media().await {
            self.fail_media_setup(e).await;
            return;
        }

        let Some(engine) = self.session.as_ref().and_then(|ctx| ctx.engine.clone()) else {
            return;
        };
        let sdp = match engine.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                self.fail_session(EndCallReason::ConnectionFailed, e.to_string())
                    .await;
                return;
            }
        };
        let Some(ctx) = self.session.as_mut() else {
            return;
        };
        ctx.negotiation.note_local_offer();
        let room_id = ctx.info.room_id.clone();

        let offer = self.room_signal(SignalKind::Offer).with_sdp(sdp);
        if let Err(e) = self.transport.send_to_room(&room_id, offer).await {
            self.fail_session(EndCallReason::TransportFailed, e.to_string())
                .await;
        }
    }

    /// The caller's offer arrived after we accepted: acquire media, apply
    /// the offer, flush any queued candidates, and answer.
    async fn handle_offer(&mut self, signal: CallSignal) {
        let Some(sdp) = signal.sdp().map(str::to_owned) else {
            warn!("offer without sdp payload, discarding");
            return;
        };
        {
            let Some(ctx) = self.session.as_ref() else {
                return;
            };
            if ctx.info.is_outgoing() {
                debug!("offer on outgoing call (glare), discarding");
                return;
            }
            if !ctx.info.phase.is_accepted() {
                debug!("offer before local accept, discarding");
                return;
            }
            if !ctx.negotiation.can_apply_remote_offer() {
                debug!(
                    "offer in phase {:?}, discarding as glare/duplicate",
                    ctx.negotiation.phase()
                );
                return;
            }
        }

        if let Err(e) = self.setup_engine_and_media().await {
            self.fail_media_setup(e).await;
            return;
        }

        let Some(engine) = self.session.as_ref().and_then(|ctx| ctx.engine.clone()) else {
            return;
        };
        if let Err(e) = engine.set_remote_description(SdpKind::Offer, sdp).await {
            self.fail_session(EndCallReason::ConnectionFailed, e.to_string())
                .await;
            return;
        }
        if let Some(ctx) = self.session.as_mut() {
            ctx.negotiation.note_remote_offer();
            Self::flush_pending_candidates(ctx, &engine).await;
        }

        let answer_sdp = match engine.create_answer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                self.fail_session(EndCallReason::ConnectionFailed, e.to_string())
                    .await;
                return;
            }
        };
        let Some(ctx) = self.session.as_mut() else {
            return;
        };
        ctx.negotiation.note_answer_created();
        let room_id = ctx.info.room_id.clone();

        let answer = self.room_signal(SignalKind::Answer).with_sdp(answer_sdp);
        if let Err(e) = self.transport.send_to_room(&room_id, answer).await {
            self.fail_session(EndCallReason::TransportFailed, e.to_string())
                .await;
        }
    }

    async fn handle_answer(&mut self, signal: CallSignal) {
        let Some(sdp) = signal.sdp().map(str::to_owned) else {
            warn!("answer without sdp payload, discarding");
            return;
        };
        let engine = {
            let Some(ctx) = self.session.as_ref() else {
                return;
            };
            // Only applied while our own offer is outstanding; anything
            // else is a duplicate or out-of-order delivery.
            if !ctx.negotiation.can_apply_answer() {
                debug!(
                    "answer in phase {:?}, discarding as duplicate",
                    ctx.negotiation.phase()
                );
                return;
            }
            let Some(engine) = ctx.engine.clone() else {
                debug!("answer with no engine, discarding");
                return;
            };
            engine
        };

        if let Err(e) = engine.set_remote_description(SdpKind::Answer, sdp).await {
            self.fail_session(EndCallReason::ConnectionFailed, e.to_string())
                .await;
            return;
        }
        if let Some(ctx) = self.session.as_mut() {
            ctx.negotiation.note_answer_applied();
            Self::flush_pending_candidates(ctx, &engine).await;
        }
    }

    async fn handle_ice_candidate(&mut self, signal: CallSignal) {
        let Some(ctx) = self.session.as_mut() else {
            return;
        };
        let Some(candidate) = signal.candidate().cloned() else {
            warn!("ice-candidate without payload, discarding");
            return;
        };
        if ctx.negotiation.remote_description_set()
            && let Some(engine) = ctx.engine.clone()
        {
            if let Err(e) = engine.add_ice_candidate(candidate).await {
                warn!("failed to apply ice candidate: {}", e);
            }
        } else {
            // Queued until the remote description lands; applied in
            // arrival order from there.
            ctx.negotiation.push_pending(candidate);
            debug!(
                "queued ice candidate ({} pending)",
                ctx.negotiation.pending_len()
            );
        }
    }

    // ==================== Engine events & timers ====================

    async fn handle_engine(&mut self, call_id: CallId, event: EngineEvent) {
        {
            let Some(ctx) = self.session.as_ref() else {
                debug!("engine event after teardown, discarding");
                return;
            };
            if ctx.info.call_id != call_id {
                debug!("engine event for stale call {}, discarding", call_id);
                return;
            }
        }

        match event {
            EngineEvent::IceCandidate(candidate) => {
                // Candidates are sent as soon as the engine produces them,
                // even before the peer has a remote description; the peer
                // buffers them.
                let room_id = self.session.as_ref().map(|ctx| ctx.info.room_id.clone());
                let Some(room_id) = room_id else { return };
                let signal = self
                    .room_signal(SignalKind::IceCandidate)
                    .with_candidate(candidate);
                if let Err(e) = self.transport.send_to_room(&room_id, signal).await {
                    warn!("failed to send ice candidate: {}", e);
                }
            }
            EngineEvent::ConnectionState(state) => self.handle_connection_state(state).await,
            EngineEvent::RemoteMedia => {
                self.events.emit(CallEvent::RemoteMedia { call_id });
            }
        }
    }

    async fn handle_connection_state(&mut self, state: ConnectionState) {
        let Some(ctx) = self.session.as_mut() else {
            return;
        };
        match state {
            ConnectionState::Connected => {
                match ctx.info.apply_transition(CallTransition::MediaConnected) {
                    Ok(()) => {
                        info!("call {} connected", ctx.info.call_id);
                        let info = ctx.info.clone();
                        self.bridge.on_connected(&info).await;
                        self.emit_phase_changed();
                    }
                    Err(e) => debug!("ignoring connected state: {}", e),
                }
            }
            ConnectionState::Failed | ConnectionState::Disconnected | ConnectionState::Closed => {
                let call_id = ctx.info.call_id.clone();
                info!("call {} transport {:?}, tearing down", call_id, state);
                self.events.emit(CallEvent::Failure {
                    call_id,
                    reason: EndCallReason::ConnectionFailed,
                    message: "media connection lost, check your connection".to_string(),
                });
                self.teardown(EndCallReason::ConnectionFailed, false).await;
            }
            ConnectionState::New | ConnectionState::Connecting => {
                debug!("engine state {:?}", state);
            }
        }
    }

    async fn handle_ring_timeout(&mut self, call_id: CallId) {
        let Some(ctx) = self.session.as_ref() else {
            return;
        };
        if ctx.info.call_id != call_id || !ctx.info.phase.is_ringing() {
            return;
        }
        let reason = if ctx.info.is_outgoing() {
            EndCallReason::NoAnswer
        } else {
            EndCallReason::Missed
        };
        info!("call {} rang out: {}", call_id, reason);
        // A missed incoming call sends nothing; the caller runs its own
        // timer. An unanswered outgoing call tells the callee to stop
        // alerting.
        let suppress_end = !ctx.info.is_outgoing();
        self.teardown(reason, suppress_end).await;
    }

    // ==================== Teardown ====================

    /// The single teardown procedure, shared by every exit path. Invoking
    /// it without an active session is a no-op, which is what makes a
    /// local end racing a received `call-end` safe.
    async fn teardown(&mut self, reason: EndCallReason, received_end: bool) {
        let Some(mut ctx) = self.session.take() else {
            debug!("teardown with no active session, ignoring");
            return;
        };

        if let Some(timer) = ctx.ring_timer.take() {
            timer.abort();
        }

        // Media first: stop capture, then close the peer connection.
        if let Some(engine) = ctx.engine.take() {
            engine.release_media().await;
            engine.close().await;
        }
        if let Some(pump) = ctx.engine_pump.take() {
            pump.abort();
        }

        if !received_end {
            let (caller, callee) = participants(&self.account_id, &ctx.info);
            let end = CallSignal::new(
                SignalKind::CallEnd,
                ctx.info.call_id.clone(),
                ctx.info.room_id.clone(),
                self.account_id.clone(),
                caller,
                callee,
                ctx.info.media_kind,
            );
            if let Err(e) = self.transport.send_to_room(&ctx.info.room_id, end).await {
                debug!("best-effort call-end failed: {}", e);
            }
        }

        ctx.negotiation.close();

        if let Some(handle) = ctx.room_sub.take() {
            if let Err(e) = self.transport.unsubscribe(handle).await {
                debug!("room unsubscribe failed: {}", e);
            }
        }
        if let Some(pump) = ctx.room_pump.take() {
            pump.abort();
        }

        if let Err(e) = ctx
            .info
            .apply_transition(CallTransition::Terminated { reason })
        {
            debug!("session already ended: {}", e);
        }
        let duration_secs = match &ctx.info.phase {
            CallPhase::Ended { duration_secs, .. } => *duration_secs,
            _ => None,
        };

        self.call_log
            .call_finished(&ctx.info.call_id, reason, duration_secs)
            .await;
        self.bridge.on_ended(&ctx.info, reason).await;
        self.events.emit(CallEvent::Ended {
            call_id: ctx.info.call_id.clone(),
            reason,
            duration_secs,
        });
        info!("call {} ended: {}", ctx.info.call_id, reason);
    }

    async fn fail_session(&mut self, reason: EndCallReason, message: String) {
        if let Some(ctx) = self.session.as_ref() {
            warn!("call {} failed: {}", ctx.info.call_id, message);
            self.events.emit(CallEvent::Failure {
                call_id: ctx.info.call_id.clone(),
                reason,
                message,
            });
        }
        self.teardown(reason, false).await;
    }

    async fn fail_media_setup(&mut self, error: EngineError) {
        let reason = match error {
            EngineError::PermissionDenied(_) => EndCallReason::PermissionDenied,
            _ => EndCallReason::ConnectionFailed,
        };
        self.fail_session(reason, error.to_string()).await;
    }

    // ==================== Helpers ====================

    /// Create the engine for the active call and acquire local media.
    async fn setup_engine_and_media(&mut self) -> Result<(), EngineError> {
        let engine = self.engine_factory.create_engine();
        let (call_id, media_kind, muted) = {
            let Some(ctx) = self.session.as_mut() else {
                return Err(EngineError::Closed);
            };
            ctx.engine_pump = Some(spawn_engine_pump(
                engine.subscribe(),
                ctx.info.call_id.clone(),
                self.commands.clone(),
            ));
            ctx.engine = Some(engine.clone());
            (
                ctx.info.call_id.clone(),
                ctx.info.media_kind,
                ctx.info.is_muted,
            )
        };

        debug!("acquiring {} media for call {}", media_label(media_kind), call_id);
        engine.acquire_media(media_kind).await?;
        if muted {
            engine.set_muted(true).await;
        }
        Ok(())
    }

    async fn flush_pending_candidates(ctx: &mut SessionCtx, engine: &Arc<dyn MediaEngine>) {
        let pending = ctx.negotiation.drain_pending();
        if pending.is_empty() {
            return;
        }
        debug!("applying {} buffered ice candidates", pending.len());
        for candidate in pending {
            if let Err(e) = engine.add_ice_candidate(candidate).await {
                warn!("failed to apply buffered ice candidate: {}", e);
            }
        }
    }

    fn room_signal(&self, kind: SignalKind) -> CallSignal {
        let info = &self
            .session
            .as_ref()
            .expect("room_signal requires an active session")
            .info;
        let (caller, callee) = participants(&self.account_id, info);
        CallSignal::new(
            kind,
            info.call_id.clone(),
            info.room_id.clone(),
            self.account_id.clone(),
            caller,
            callee,
            info.media_kind,
        )
    }

    fn emit_phase_changed(&self) {
        if let Some(ctx) = self.session.as_ref() {
            self.events.emit(CallEvent::PhaseChanged {
                call_id: ctx.info.call_id.clone(),
                phase: ctx.info.phase.clone(),
            });
        }
    }

    fn spawn_ring_timer(&self, call_id: CallId) -> JoinHandle<()> {
        let commands = self.commands.clone();
        let ring_timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(ring_timeout).await;
            let _ = commands.send(Command::RingTimeout { call_id }).await;
        })
    }

    async fn subscribe_room_bounded(
        &self,
        room_id: &RoomId,
    ) -> Result<Subscription, TransportError> {
        match timeout(
            self.config.subscribe_timeout,
            self.transport.subscribe_room(room_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

fn participants(local: &AccountId, info: &ActiveCallSession) -> (AccountId, AccountId) {
    match info.direction {
        CallDirection::Outgoing => (local.clone(), info.peer_id.clone()),
        CallDirection::Incoming => (info.peer_id.clone(), local.clone()),
    }
}

fn log_entry(info: &ActiveCallSession) -> CallLogEntry {
    CallLogEntry {
        call_id: info.call_id.clone(),
        peer_id: info.peer_id.clone(),
        direction: info.direction,
        media_kind: info.media_kind,
        started_at: Utc::now(),
        ended_at: None,
        reason: None,
        duration_secs: None,
    }
}

fn media_label(media: MediaKind) -> &'static str {
    match media {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}

fn spawn_signal_pump(
    mut signals: mpsc::Receiver<CallSignal>,
    commands: mpsc::Sender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            if commands.send(Command::Inbound(signal)).await.is_err() {
                break;
            }
        }
    })
}

fn spawn_engine_pump(
    mut events: broadcast::Receiver<EngineEvent>,
    call_id: CallId,
    commands: mpsc::Sender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let command = Command::Engine {
                        call_id: call_id.clone(),
                        event,
                    };
                    if commands.send(command).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("engine event stream lagged by {}", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
