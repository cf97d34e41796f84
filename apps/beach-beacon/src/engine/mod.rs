use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::SessionDescription;
use crate::session::SessionEvent;

pub mod mock;
pub mod webrtc;

/// Negotiation role of the local side in perfect negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Yields to a racing remote offer.
    Polite,
    /// Ignores a racing remote offer.
    Impolite,
}

impl Role {
    pub fn is_polite(self) -> bool {
        matches!(self, Role::Polite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPrAnswer,
    HaveRemotePrAnswer,
    Closed,
}

impl SignalingState {
    /// Whether the offer/answer state machine permits moving to `next`.
    /// Staying in the same state is always allowed; `Closed` is terminal.
    pub fn can_transition_to(self, next: SignalingState) -> bool {
        use SignalingState::*;

        if self == next {
            return true;
        }
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Stable, HaveLocalOffer | HaveRemoteOffer) => true,
            (HaveLocalOffer, HaveRemotePrAnswer | Stable) => true,
            (HaveRemoteOffer, HaveLocalPrAnswer | Stable) => true,
            (HaveLocalPrAnswer | HaveRemotePrAnswer, Stable) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPrAnswer => "have-local-pranswer",
            SignalingState::HaveRemotePrAnswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not start media engine: {0}")]
    Startup(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid ice candidate: {0}")]
    InvalidCandidate(String),
    #[error("media engine rejected {operation}: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },
    #[error("media engine fault: {0}")]
    Fault(String),
}

impl EngineError {
    pub fn rejected(operation: &'static str, reason: impl fmt::Display) -> Self {
        EngineError::Rejected {
            operation,
            reason: reason.to_string(),
        }
    }

    /// Faults that leave the whole process unable to serve peers.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Startup(_))
    }
}

/// Notifications raised by a media engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    NegotiationNeeded,
    LocalCandidate { mline_index: u32, candidate: String },
    SignalingStateChanged(SignalingState),
    ConnectionStateChanged(ConnectionState),
    Fault(String),
}

/// Sink an engine instance uses to notify the session that owns it.
///
/// Events raised after the session has gone away are dropped.
#[derive(Clone)]
pub struct EngineEvents {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EngineEvents {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    pub fn negotiation_needed(&self) {
        self.emit(EngineEvent::NegotiationNeeded);
    }

    pub fn local_candidate(&self, mline_index: u32, candidate: impl Into<String>) {
        self.emit(EngineEvent::LocalCandidate {
            mline_index,
            candidate: candidate.into(),
        });
    }

    pub fn signaling_state_changed(&self, state: SignalingState) {
        self.emit(EngineEvent::SignalingStateChanged(state));
    }

    pub fn connection_state_changed(&self, state: ConnectionState) {
        self.emit(EngineEvent::ConnectionStateChanged(state));
    }

    pub fn fault(&self, reason: impl Into<String>) {
        self.emit(EngineEvent::Fault(reason.into()));
    }

    fn emit(&self, event: EngineEvent) {
        if self.tx.send(SessionEvent::Engine(event)).is_err() {
            tracing::trace!("engine event dropped; session already closed");
        }
    }
}

/// One media pipeline dedicated to a single negotiation session.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Attaches media and starts the pipeline. Usually raises negotiation-needed.
    async fn start(&self) -> Result<(), EngineError>;

    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), EngineError>;

    /// Applying a remote offer while a local offer is pending rolls the local
    /// offer back first.
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    /// Candidates that arrive before a remote description are buffered.
    async fn add_ice_candidate(&self, mline_index: u32, candidate: String)
        -> Result<(), EngineError>;

    /// Current signaling state as seen by the engine right now.
    fn signaling_state(&self) -> SignalingState;

    /// Stops the pipeline. Resources may be released asynchronously.
    async fn stop(&self);
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        role: Role,
        events: EngineEvents,
    ) -> Result<Arc<dyn MediaEngine>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaling_transitions_follow_offer_answer_machine() {
        use SignalingState::*;

        assert!(Stable.can_transition_to(HaveLocalOffer));
        assert!(Stable.can_transition_to(HaveRemoteOffer));
        assert!(HaveLocalOffer.can_transition_to(Stable));
        assert!(HaveLocalOffer.can_transition_to(HaveRemotePrAnswer));
        assert!(HaveRemoteOffer.can_transition_to(HaveLocalPrAnswer));
        assert!(HaveRemotePrAnswer.can_transition_to(Stable));
        assert!(HaveRemoteOffer.can_transition_to(Closed));

        assert!(!Stable.can_transition_to(HaveLocalPrAnswer));
        assert!(!HaveLocalOffer.can_transition_to(HaveRemoteOffer));
        assert!(!HaveRemoteOffer.can_transition_to(HaveRemotePrAnswer));
        assert!(!Closed.can_transition_to(Stable));
    }

    #[test]
    fn only_startup_failures_are_fatal() {
        assert!(EngineError::Startup("no api".into()).is_fatal());
        assert!(!EngineError::InvalidDescription("garbage".into()).is_fatal());
        assert!(!EngineError::rejected("add_ice_candidate", "bad").is_fatal());
    }
}
