use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::{
    ConnectionState, EngineError, EngineEvent, MediaEngine, Role, SignalingState,
};
use crate::protocol::{Envelope, ProtocolError, SdpKind, SessionDescription, SignalingMessage};
use crate::registry::ConnectionId;

/// Websocket close code sent when a session is torn down by an engine failure.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

const MAX_CLOSE_REASON: usize = 120;

/// Everything a session actor reacts to, in arrival order.
#[derive(Debug)]
pub enum SessionEvent {
    Remote(Envelope),
    Engine(EngineEvent),
    OfferReady {
        generation: u64,
        result: Result<SessionDescription, EngineError>,
    },
    AnswerReady(Result<SessionDescription, EngineError>),
}

/// Frames a session asks the transport to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Signal(SignalingMessage),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    DescriptionApplied(SdpKind),
    Ignored,
    CandidateAdded,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("transport connection closed")]
    TransportClosed,
}

impl SessionError {
    /// Protocol errors only cost the offending message; the rest end the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::Protocol(_))
    }
}

/// Perfect negotiation state for one remote peer.
pub struct NegotiationSession {
    connection: ConnectionId,
    role: Role,
    making_offer: bool,
    /// Bumped whenever a remote offer is applied; offers started earlier are stale.
    offer_generation: u64,
    signaling_state: SignalingState,
    engine: Arc<dyn MediaEngine>,
    outbound: mpsc::UnboundedSender<Outbound>,
    continuations: mpsc::UnboundedSender<SessionEvent>,
}

impl NegotiationSession {
    pub fn new(
        connection: ConnectionId,
        role: Role,
        engine: Arc<dyn MediaEngine>,
        outbound: mpsc::UnboundedSender<Outbound>,
        continuations: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            connection,
            role,
            making_offer: false,
            offer_generation: 0,
            signaling_state: SignalingState::Stable,
            engine,
            outbound,
            continuations,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn making_offer(&self) -> bool {
        self.making_offer
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    pub async fn handle(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        match event {
            SessionEvent::Remote(envelope) => self.on_remote_message(envelope).await.map(|_| ()),
            SessionEvent::OfferReady { generation, result } => {
                self.on_offer_ready(generation, result).await
            }
            SessionEvent::AnswerReady(result) => self.on_answer_ready(result).await,
            SessionEvent::Engine(EngineEvent::NegotiationNeeded) => {
                self.on_local_negotiation_needed();
                Ok(())
            }
            SessionEvent::Engine(EngineEvent::LocalCandidate {
                mline_index,
                candidate,
            }) => self.on_local_candidate(mline_index, candidate),
            SessionEvent::Engine(EngineEvent::SignalingStateChanged(state)) => {
                self.on_signaling_state_changed(state);
                Ok(())
            }
            SessionEvent::Engine(EngineEvent::ConnectionStateChanged(state)) => {
                self.on_connection_state_changed(state);
                Ok(())
            }
            SessionEvent::Engine(EngineEvent::Fault(reason)) => {
                Err(SessionError::Engine(EngineError::Fault(reason)))
            }
        }
    }

    /// Starts creating an offer unless one is already in flight.
    pub fn on_local_negotiation_needed(&mut self) {
        if self.making_offer {
            debug!(connection = %self.connection, "offer already in progress; coalescing negotiation request");
            return;
        }
        debug!(connection = %self.connection, "negotiation needed; creating offer");
        self.making_offer = true;

        let generation = self.offer_generation;
        let engine = Arc::clone(&self.engine);
        let continuations = self.continuations.clone();
        tokio::spawn(async move {
            let result = engine.create_offer().await;
            let ready = SessionEvent::OfferReady { generation, result };
            if continuations.send(ready).is_err() {
                debug!("offer completed after session closed; discarding");
            }
        });
    }

    pub async fn on_offer_ready(
        &mut self,
        generation: u64,
        result: Result<SessionDescription, EngineError>,
    ) -> Result<(), SessionError> {
        let outcome = if generation != self.offer_generation {
            info!(
                connection = %self.connection,
                generation,
                current = self.offer_generation,
                "discarding local offer started before a remote offer was applied"
            );
            Ok(())
        } else {
            self.apply_local_offer(result).await
        };
        self.making_offer = false;
        outcome
    }

    async fn apply_local_offer(
        &mut self,
        result: Result<SessionDescription, EngineError>,
    ) -> Result<(), SessionError> {
        let offer = result?;
        let live = self.engine.signaling_state();
        if live != SignalingState::Stable {
            info!(
                connection = %self.connection,
                state = %live,
                "discarding local offer; signaling is no longer stable"
            );
            return Ok(());
        }

        self.engine.set_local_description(offer.clone()).await?;
        debug!(connection = %self.connection, "sending local offer");
        self.send(SignalingMessage::Sdp(offer))
    }

    /// Applies one validated inbound message according to the perfect negotiation rules.
    pub async fn on_remote_message(
        &mut self,
        envelope: Envelope,
    ) -> Result<RemoteOutcome, SessionError> {
        match SignalingMessage::try_from(envelope)? {
            SignalingMessage::Sdp(description) => match description.kind {
                SdpKind::Offer => self.on_remote_offer(description).await,
                SdpKind::Answer => {
                    debug!(connection = %self.connection, "applying remote answer");
                    self.engine.set_remote_description(description).await?;
                    Ok(RemoteOutcome::DescriptionApplied(SdpKind::Answer))
                }
            },
            SignalingMessage::Ice {
                mline_index,
                candidate,
            } => {
                self.engine.add_ice_candidate(mline_index, candidate).await?;
                Ok(RemoteOutcome::CandidateAdded)
            }
        }
    }

    async fn on_remote_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<RemoteOutcome, SessionError> {
        let collision = self.signaling_state != SignalingState::Stable || self.making_offer;
        if collision && !self.role.is_polite() {
            info!(
                connection = %self.connection,
                state = %self.signaling_state,
                making_offer = self.making_offer,
                "ignoring colliding remote offer"
            );
            return Ok(RemoteOutcome::Ignored);
        }
        if collision {
            info!(connection = %self.connection, "offer collision; yielding to remote offer");
        }

        self.offer_generation += 1;
        self.engine.set_remote_description(offer).await?;
        Ok(RemoteOutcome::DescriptionApplied(SdpKind::Offer))
    }

    pub fn on_signaling_state_changed(&mut self, state: SignalingState) {
        if !self.signaling_state.can_transition_to(state) {
            warn!(
                connection = %self.connection,
                from = %self.signaling_state,
                to = %state,
                "unexpected signaling state transition"
            );
        }
        debug!(connection = %self.connection, state = %state, "signaling state changed");
        self.signaling_state = state;

        if state == SignalingState::HaveRemoteOffer {
            self.request_answer();
        }
    }

    fn request_answer(&self) {
        let engine = Arc::clone(&self.engine);
        let continuations = self.continuations.clone();
        tokio::spawn(async move {
            let result = engine.create_answer().await;
            if continuations.send(SessionEvent::AnswerReady(result)).is_err() {
                debug!("answer completed after session closed; discarding");
            }
        });
    }

    pub async fn on_answer_ready(
        &mut self,
        result: Result<SessionDescription, EngineError>,
    ) -> Result<(), SessionError> {
        let answer = result?;
        let live = self.engine.signaling_state();
        if live != SignalingState::HaveRemoteOffer {
            info!(
                connection = %self.connection,
                state = %live,
                "discarding stale local answer"
            );
            return Ok(());
        }

        self.engine.set_local_description(answer.clone()).await?;
        debug!(connection = %self.connection, "sending local answer");
        self.send(SignalingMessage::Sdp(answer))
    }

    pub fn on_local_candidate(
        &mut self,
        mline_index: u32,
        candidate: String,
    ) -> Result<(), SessionError> {
        self.send(SignalingMessage::Ice {
            mline_index,
            candidate,
        })
    }

    pub fn on_connection_state_changed(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Failed => {
                warn!(connection = %self.connection, "peer connection failed")
            }
            ConnectionState::Connected => {
                info!(connection = %self.connection, "peer connection established")
            }
            other => debug!(connection = %self.connection, state = ?other, "peer connection state changed"),
        }
    }

    fn send(&self, message: SignalingMessage) -> Result<(), SessionError> {
        self.outbound
            .send(Outbound::Signal(message))
            .map_err(|_| SessionError::TransportClosed)
    }

    fn fail(&self, err: &SessionError) {
        let close = Outbound::Close {
            code: CLOSE_INTERNAL_ERROR,
            reason: close_reason(err),
        };
        if self.outbound.send(close).is_err() {
            debug!(connection = %self.connection, "transport already gone; close frame not sent");
        }
    }
}

fn close_reason(err: &SessionError) -> String {
    let mut reason = err.to_string();
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

struct Control {
    closed: AtomicBool,
    shutdown: Notify,
}

/// Shared handle to a running session actor.
pub struct SessionHandle {
    connection: ConnectionId,
    events: mpsc::UnboundedSender<SessionEvent>,
    control: Arc<Control>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("connection", &format_args!("{}", self.connection))
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionHandle {
    /// Spawns the actor that owns `session` and drains `events` one at a time.
    pub fn spawn(
        session: NegotiationSession,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Arc<Self> {
        let control = Arc::new(Control {
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        let handle = Arc::new(Self {
            connection: session.connection(),
            events: events_tx,
            control: Arc::clone(&control),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(run_session(session, events_rx, control));
        *handle.task.lock() = Some(task);
        handle
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.control.closed.load(Ordering::SeqCst)
    }

    /// Queues an inbound envelope. Returns false once the session is closing.
    pub fn deliver(&self, envelope: Envelope) -> bool {
        if self.is_closed() {
            return false;
        }
        self.events.send(SessionEvent::Remote(envelope)).is_ok()
    }

    /// Asks the actor to stop. Only the first call has any effect.
    pub fn close(&self) -> bool {
        if self.control.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.control.shutdown.notify_one();
        true
    }

    /// Waits for the actor, and with it the engine, to finish.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(connection = %self.connection, error = %err, "session task ended abnormally");
            }
        }
    }
}

async fn run_session(
    mut session: NegotiationSession,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    control: Arc<Control>,
) {
    let connection = session.connection();
    debug!(connection = %connection, role = ?session.role(), "session started");

    loop {
        let event = tokio::select! {
            biased;
            _ = control.shutdown.notified() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if let Err(err) = session.handle(event).await {
            if err.is_fatal() {
                error!(connection = %connection, error = %err, "tearing down negotiation session");
                control.closed.store(true, Ordering::SeqCst);
                session.fail(&err);
                break;
            }
            warn!(connection = %connection, error = %err, "dropping signaling message");
        }
    }

    session.engine.stop().await;
    info!(connection = %connection, "negotiation session closed");
}
