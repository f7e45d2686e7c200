//! Session Coordinator
//!
//! Zustandsautomat eines Clients:
//! `Idle → Ringing(Outgoing|Incoming) → Accepted → Connected → Ended → Idle`
//!
//! Eingaben kommen aus drei Quellen: Aktionen der Oberfläche, Events vom
//! Relay ([`SignalingEvent`]) und Events des Negotiators. Jeder Anruf
//! bekommt eine Sequenznummer; Events eines früheren Anrufs werden verworfen.

use super::media::{LocalStream, MediaConstraints, MediaDevices, MediaKind, RemoteStream};
use super::negotiator::{NegotiationError, NegotiationEvent, Negotiator, NegotiatorFactory, Role};
use super::state::{CallEvent, CallPhase, CallState, Direction, Notice};
use crate::config::CallTimeouts;
use crate::signaling::{
    ConnectionId, SignalPayload, SignalingError, SignalingEvent, SignalingTransport,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Größe des Event-Channels für die Oberfläche
const EVENT_CHANNEL: usize = 100;

/// Puffer für Negotiator-Events
const NEGOTIATION_QUEUE: usize = 32;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CoordinatorError {
    #[error("No local media available: {0}")]
    MediaUnavailable(String),

    #[error("Already in a call")]
    Busy,

    #[error("Not registered with the relay")]
    NotRegistered,

    #[error("Cannot call own connection id")]
    CannotCallSelf,

    #[error("No incoming call to accept")]
    NoIncomingCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Signaling failed: {0}")]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// INTERNAL STATE
// ============================================================================

/// Für welchen Anruf eine Beendigung gilt
#[derive(Debug, Clone, Copy)]
enum Scope {
    /// Der gerade laufende Anruf
    Current,
    /// Nur wenn der Anruf mit dieser Sequenznummer noch läuft
    Call(u64),
    /// Zusätzlich muss die Phase noch stimmen (Timeouts)
    Phase(u64, CallPhase),
}

#[derive(Default)]
struct Inner {
    state: CallState,
    seq: u64,
    /// Eigener Anzeigename für die ausgehende Einladung
    display_name: String,
    negotiator: Option<Arc<dyn Negotiator>>,
    remote_stream: Option<RemoteStream>,
    invite_sent: bool,
    timer: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

/// Wohin ein Signal des Negotiators geht
enum Reply {
    /// Einladung an das gewählte Ziel, mit eigenem Anzeigenamen
    Invite(ConnectionId, String),
    /// Answer an den Anrufer
    Answer(ConnectionId),
}

/// Ressourcen eines beendeten Anrufs
struct Released {
    seq: u64,
    negotiator: Option<Arc<dyn Negotiator>>,
    timer: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Released {
    fn abort_tasks(self) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        if let Some(pump) = self.pump {
            pump.abort();
        }
    }
}

impl Inner {
    fn in_scope(&self, scope: Scope) -> bool {
        match scope {
            Scope::Current => true,
            Scope::Call(seq) => self.seq == seq,
            Scope::Phase(seq, phase) => self.seq == seq && self.state.phase == phase,
        }
    }

    /// Weiß die Gegenseite von diesem Anruf?
    fn peer_knows_call(&self) -> bool {
        match self.state.phase {
            CallPhase::Ringing(Direction::Outgoing) => self.invite_sent,
            _ => true,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Löst alle Ressourcen vom Anruf; spätere Events laufen ins Leere
    fn release(&mut self) -> Released {
        self.seq += 1;
        self.remote_stream = None;
        self.invite_sent = false;
        Released {
            seq: self.seq,
            negotiator: self.negotiator.take(),
            timer: self.timer.take(),
            pump: self.pump.take(),
        }
    }
}

// ============================================================================
// SESSION COORDINATOR
// ============================================================================

/// Steuert Anrufzustand und Aushandlung eines Clients
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Mutex<Inner>>,
    transport: Arc<dyn SignalingTransport>,
    factory: Arc<dyn NegotiatorFactory>,
    local_stream: Option<LocalStream>,
    timeouts: CallTimeouts,
    event_tx: broadcast::Sender<CallEvent>,
}

impl SessionCoordinator {
    /// Erstellt den Coordinator und fordert einmalig die lokalen Medien an
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        factory: Arc<dyn NegotiatorFactory>,
        devices: &dyn MediaDevices,
        timeouts: CallTimeouts,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL);
        let mut inner = Inner::default();

        let local_stream = match devices.acquire(MediaConstraints::default()) {
            Ok(stream) => {
                tracing::info!("Local media ready: {} tracks", stream.tracks().len());
                Some(stream)
            }
            Err(e) => {
                tracing::warn!("Could not acquire local media, calls disabled: {}", e);
                inner.state.media_warning = Some(e.to_string());
                None
            }
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
            transport,
            factory,
            local_stream,
            timeouts,
            event_tx,
        }
    }

    /// Startet die Verarbeitung der Relay-Events
    pub fn spawn_event_loop(&self) -> JoinHandle<()> {
        // Vor dem Spawn abonnieren, damit nichts verloren geht
        let mut events = self.transport.subscribe();
        let this = self.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => this.handle_signaling_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Coordinator lagged behind, {} relay events skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    // ========================================================================
    // OBSERVABLES
    // ========================================================================

    pub fn state(&self) -> CallState {
        self.inner.lock().state.clone()
    }

    pub fn local_stream(&self) -> Option<LocalStream> {
        self.local_stream.clone()
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.inner.lock().remote_stream.clone()
    }

    /// Ob gerade ein Negotiator gehalten wird
    pub fn has_negotiator(&self) -> bool {
        self.inner.lock().negotiator.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    // ========================================================================
    // ACTIONS
    // ========================================================================

    /// Ruft `target` an.
    ///
    /// Kehrt zurück, sobald die Aushandlung läuft. Die Einladung geht raus,
    /// wenn der Negotiator sein Offer meldet.
    pub async fn place_call(
        &self,
        target: ConnectionId,
        name: impl Into<String>,
    ) -> Result<(), CoordinatorError> {
        let stream = self.require_media()?;
        let own_id = self.transport.local_id().ok_or(CoordinatorError::NotRegistered)?;
        if own_id == target {
            return Err(CoordinatorError::CannotCallSelf);
        }

        let seq = {
            let mut inner = self.inner.lock();
            if !inner.state.phase.is_idle() {
                return Err(CoordinatorError::Busy);
            }
            inner.seq += 1;
            inner.display_name = name.into();
            inner.state = CallState {
                phase: CallPhase::Ringing(Direction::Outgoing),
                dialed_target: Some(target.clone()),
                ..inner.state.cleared()
            };
            self.arm_timer(&mut inner, self.timeouts.invite);
            self.publish_state(&inner);
            inner.seq
        };

        tracing::info!("Calling {}", target);
        self.start_negotiation(seq, Role::Initiator, stream, None)
            .await
    }

    /// Nimmt den eingehenden Anruf an
    pub async fn accept_call(&self) -> Result<(), CoordinatorError> {
        let stream = self.require_media()?;

        let (seq, offer) = {
            let mut inner = self.inner.lock();
            if inner.state.phase != CallPhase::Ringing(Direction::Incoming) {
                return Err(CoordinatorError::NoIncomingCall);
            }
            let offer = inner
                .state
                .pending_invite_offer
                .take()
                .ok_or(CoordinatorError::NoIncomingCall)?;

            inner.state.phase = CallPhase::Accepted;
            inner.state.accepted = true;
            inner.state.receiving_invite = false;
            self.arm_timer(&mut inner, self.timeouts.connect);
            self.publish_state(&inner);
            (inner.seq, offer)
        };

        tracing::info!("Accepting call");
        self.start_negotiation(seq, Role::Responder, stream, Some(offer))
            .await
    }

    /// Legt auf und benachrichtigt die Gegenseite
    pub async fn end_call(&self) -> Result<(), CoordinatorError> {
        if self.conclude(Scope::Current, true, None).await {
            Ok(())
        } else {
            Err(CoordinatorError::NoActiveCall)
        }
    }

    /// Schaltet das Mikrofon stumm bzw. wieder an. Gibt `muted` zurück.
    pub fn toggle_mute(&self) -> Result<bool, CoordinatorError> {
        let stream = self.require_media()?;
        let muted = !stream.toggle(MediaKind::Audio);

        let mut inner = self.inner.lock();
        inner.state.muted = muted;
        self.publish_state(&inner);
        Ok(muted)
    }

    /// Schaltet die Kamera aus bzw. an. Gibt `video_off` zurück.
    pub fn toggle_video(&self) -> Result<bool, CoordinatorError> {
        let stream = self.require_media()?;
        let video_off = !stream.toggle(MediaKind::Video);

        let mut inner = self.inner.lock();
        inner.state.video_off = video_off;
        self.publish_state(&inner);
        Ok(video_off)
    }

    /// Verwirft den Anruf ohne Nachricht an die Gegenseite.
    ///
    /// Der lokale Stream bleibt erhalten.
    pub async fn reset(&self) {
        let released = {
            let mut inner = self.inner.lock();
            let released = inner.release();
            inner.state = inner.state.cleared();
            released
        };

        if let Some(negotiator) = &released.negotiator {
            negotiator.destroy().await;
        }

        {
            let inner = self.inner.lock();
            if inner.seq == released.seq {
                self.publish_state(&inner);
            }
        }
        released.abort_tasks();
    }

    // ========================================================================
    // RELAY EVENTS
    // ========================================================================

    async fn handle_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::IncomingCall { from, name, signal } => {
                self.on_incoming_call(from, name, signal);
            }

            SignalingEvent::CallAccepted { signal } => {
                let accepted = {
                    let mut inner = self.inner.lock();
                    match (inner.state.phase, inner.negotiator.clone()) {
                        (CallPhase::Ringing(Direction::Outgoing), Some(negotiator)) => {
                            inner.state.phase = CallPhase::Accepted;
                            inner.state.accepted = true;
                            self.arm_timer(&mut inner, self.timeouts.connect);
                            self.publish_state(&inner);
                            Some((inner.seq, negotiator))
                        }
                        _ => None,
                    }
                };

                let Some((seq, negotiator)) = accepted else {
                    tracing::debug!("Ignoring callAccepted outside of outgoing ringing");
                    return;
                };

                tracing::info!("Call accepted by remote");
                if let Err(e) = negotiator.signal(signal).await {
                    tracing::error!("Failed to apply answer: {}", e);
                    self.conclude(
                        Scope::Call(seq),
                        true,
                        Some(Notice::NegotiationFailed(e.to_string())),
                    )
                    .await;
                }
            }

            SignalingEvent::CallEnded => {
                if self
                    .conclude(Scope::Current, false, Some(Notice::RemoteEnded))
                    .await
                {
                    tracing::info!("Call ended by remote");
                }
            }

            SignalingEvent::PeerUnreachable { target } => {
                let seq = {
                    let inner = self.inner.lock();
                    let dialing = inner.state.phase == CallPhase::Ringing(Direction::Outgoing)
                        && inner.state.dialed_target.as_ref() == Some(&target);
                    dialing.then_some(inner.seq)
                };

                if let Some(seq) = seq {
                    tracing::info!("Peer {} is not connected to the relay", target);
                    self.conclude(
                        Scope::Phase(seq, CallPhase::Ringing(Direction::Outgoing)),
                        false,
                        Some(Notice::PeerUnreachable(target)),
                    )
                    .await;
                }
            }

            SignalingEvent::Disconnected => {
                tracing::warn!("Relay connection lost");
                self.conclude(Scope::Current, false, Some(Notice::RelayLost))
                    .await;
            }

            SignalingEvent::Registered { id } => {
                tracing::debug!("Coordinator registered as {}", id);
            }

            SignalingEvent::Connected => {}

            SignalingEvent::Error { code, message } => {
                tracing::warn!("Relay reported error {}: {}", code, message);
            }
        }
    }

    fn on_incoming_call(&self, from: ConnectionId, name: String, signal: SignalPayload) {
        {
            let mut inner = self.inner.lock();
            if inner.state.phase.is_idle() {
                tracing::info!("Incoming call from {} ({})", name, from);
                inner.seq += 1;
                inner.state = CallState {
                    phase: CallPhase::Ringing(Direction::Incoming),
                    receiving_invite: true,
                    peer_connection_id: Some(from),
                    peer_display_name: Some(name),
                    pending_invite_offer: Some(signal),
                    ..inner.state.cleared()
                };
                self.arm_timer(&mut inner, self.timeouts.invite);
                self.publish_state(&inner);
                return;
            }

            if inner.state.peer_connection_id.as_ref() == Some(&from) {
                tracing::debug!("Ignoring repeated invite from current peer {}", from);
                return;
            }
        }

        tracing::info!("Busy, declining call from {} ({})", name, from);
        if let Err(e) = self.transport.end_call(from.clone()) {
            tracing::warn!("Failed to decline call: {}", e);
        }
        self.publish(CallEvent::Notice(Notice::BusyRejected { from, name }));
    }

    // ========================================================================
    // NEGOTIATION
    // ========================================================================

    async fn start_negotiation(
        &self,
        seq: u64,
        role: Role,
        stream: LocalStream,
        offer: Option<SignalPayload>,
    ) -> Result<(), CoordinatorError> {
        let (tx, rx) = mpsc::channel(NEGOTIATION_QUEUE);

        let negotiator = match self.factory.create(role, stream, tx).await {
            Ok(negotiator) => negotiator,
            Err(e) => {
                tracing::error!("Failed to create negotiator: {}", e);
                self.conclude(
                    Scope::Call(seq),
                    true,
                    Some(Notice::NegotiationFailed(e.to_string())),
                )
                .await;
                return Err(e.into());
            }
        };

        let installed = {
            let mut inner = self.inner.lock();
            if inner.seq == seq && inner.state.phase.is_active() {
                inner.negotiator = Some(Arc::clone(&negotiator));
                inner.pump = Some(self.spawn_pump(seq, rx));
                true
            } else {
                false
            }
        };

        if !installed {
            // Anruf wurde währenddessen beendet
            tracing::debug!("Call {} ended during negotiator setup", seq);
            negotiator.destroy().await;
            return Ok(());
        }

        if let Some(offer) = offer {
            if let Err(e) = negotiator.signal(offer).await {
                tracing::error!("Failed to apply offer: {}", e);
                self.conclude(
                    Scope::Call(seq),
                    true,
                    Some(Notice::NegotiationFailed(e.to_string())),
                )
                .await;
                return Err(e.into());
            }
        }

        Ok(())
    }

    fn spawn_pump(&self, seq: u64, mut rx: mpsc::Receiver<NegotiationEvent>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.handle_negotiation_event(seq, event).await;
            }
        })
    }

    async fn handle_negotiation_event(&self, seq: u64, event: NegotiationEvent) {
        match event {
            NegotiationEvent::Signal(payload) => {
                let reply = {
                    let mut inner = self.inner.lock();
                    if inner.seq != seq {
                        return;
                    }
                    let role = inner.negotiator.as_ref().map(|n| n.role());

                    match (role, inner.state.phase) {
                        (Some(Role::Initiator), CallPhase::Ringing(Direction::Outgoing))
                            if !inner.invite_sent =>
                        {
                            inner.invite_sent = true;
                            inner
                                .state
                                .dialed_target
                                .clone()
                                .map(|to| Reply::Invite(to, inner.display_name.clone()))
                        }
                        (Some(Role::Responder), CallPhase::Accepted | CallPhase::Connected) => {
                            inner.state.peer_connection_id.clone().map(Reply::Answer)
                        }
                        _ => {
                            tracing::debug!("Ignoring extra signal in {:?}", inner.state.phase);
                            return;
                        }
                    }
                };

                let sent = match reply {
                    Some(Reply::Invite(to, name)) => self.transport.call_user(to, payload, name),
                    Some(Reply::Answer(to)) => self.transport.answer_call(to, payload),
                    None => Err(SignalingError::NotConnected),
                };
                if let Err(e) = sent {
                    tracing::error!("Failed to send signal to relay: {}", e);
                    // Die Einladung ist nie angekommen
                    {
                        let mut inner = self.inner.lock();
                        if inner.seq == seq {
                            inner.invite_sent = false;
                        }
                    }
                    self.conclude(Scope::Call(seq), false, Some(Notice::RelayLost))
                        .await;
                }
            }

            NegotiationEvent::Stream(stream) => {
                let mut inner = self.inner.lock();
                if inner.seq != seq || !inner.state.phase.is_active() {
                    return;
                }
                let merged = match inner.remote_stream.take() {
                    Some(mut existing) if existing.id == stream.id => {
                        existing.merge(&stream);
                        existing
                    }
                    _ => stream,
                };
                tracing::info!("Remote stream attached: {:?}", merged.kinds);
                inner.remote_stream = Some(merged.clone());
                self.publish(CallEvent::RemoteStreamAttached(merged));
            }

            NegotiationEvent::Connected => {
                let mut inner = self.inner.lock();
                if inner.seq != seq || inner.state.phase != CallPhase::Accepted {
                    return;
                }
                tracing::info!("Media connected");
                inner.state.phase = CallPhase::Connected;
                inner.state.connected = true;
                inner.cancel_timer();
                self.publish_state(&inner);
            }

            NegotiationEvent::Failed(reason) => {
                tracing::error!("Negotiation failed: {}", reason);
                self.conclude(
                    Scope::Call(seq),
                    true,
                    Some(Notice::NegotiationFailed(reason)),
                )
                .await;
            }

            NegotiationEvent::Closed => {
                self.conclude(
                    Scope::Call(seq),
                    true,
                    Some(Notice::NegotiationFailed("connection closed".to_string())),
                )
                .await;
            }
        }
    }

    // ========================================================================
    // TIMEOUTS
    // ========================================================================

    /// Startet den Timer für die aktuelle Phase (ersetzt einen laufenden)
    fn arm_timer(&self, inner: &mut Inner, duration: Duration) {
        inner.cancel_timer();

        let seq = inner.seq;
        let phase = inner.state.phase;
        let this = self.clone();
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            this.on_timeout(seq, phase).await;
        }));
    }

    async fn on_timeout(&self, seq: u64, phase: CallPhase) {
        let notice = match phase {
            CallPhase::Ringing(Direction::Outgoing) => Notice::InviteTimedOut,
            CallPhase::Ringing(Direction::Incoming) => Notice::InviteExpired,
            _ => Notice::NegotiationTimedOut,
        };

        if self
            .conclude(Scope::Phase(seq, phase), true, Some(notice))
            .await
        {
            tracing::info!("Call timed out in {:?}", phase);
        }
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Beendet den Anruf: `Ended` veröffentlichen, ggf. `endCall` senden,
    /// Negotiator freigeben und zurück nach `Idle`.
    ///
    /// Gibt `false` zurück, wenn kein passender Anruf lief.
    async fn conclude(&self, scope: Scope, notify_peer: bool, notice: Option<Notice>) -> bool {
        let (target, released) = {
            let mut inner = self.inner.lock();
            if !inner.in_scope(scope) || !inner.state.phase.is_active() {
                return false;
            }

            let target = if notify_peer && inner.peer_knows_call() {
                inner.state.end_target().cloned()
            } else {
                None
            };

            inner.state.phase = CallPhase::Ended;
            inner.state.ended = true;
            inner.state.receiving_invite = false;
            self.publish_state(&inner);
            (target, inner.release())
        };

        if let Some(to) = target {
            tracing::info!("Sending endCall to {}", to);
            if let Err(e) = self.transport.end_call(to) {
                tracing::warn!("Failed to send endCall: {}", e);
            }
        }

        if let Some(notice) = notice {
            self.publish(CallEvent::Notice(notice));
        }

        if let Some(negotiator) = &released.negotiator {
            negotiator.destroy().await;
        }

        {
            let mut inner = self.inner.lock();
            if inner.seq == released.seq && inner.state.phase == CallPhase::Ended {
                inner.state = inner.state.cleared();
                self.publish_state(&inner);
            }
        }

        // Kann den eigenen Task treffen, daher ganz am Ende
        released.abort_tasks();
        true
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn require_media(&self) -> Result<LocalStream, CoordinatorError> {
        match &self.local_stream {
            Some(stream) => Ok(stream.clone()),
            None => Err(CoordinatorError::MediaUnavailable(
                self.inner
                    .lock()
                    .state
                    .media_warning
                    .clone()
                    .unwrap_or_default(),
            )),
        }
    }

    fn publish_state(&self, inner: &Inner) {
        self.publish(CallEvent::StateChanged(inner.state.clone()));
    }

    fn publish(&self, event: CallEvent) {
        // Ohne Abonnenten geht das Event verloren
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("state", &self.inner.lock().state)
            .field("has_local_stream", &self.local_stream.is_some())
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
