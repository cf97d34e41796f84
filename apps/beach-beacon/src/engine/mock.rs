//! In-memory media engine that emulates the offer/answer state machine.
//!
//! Used by the unit and integration tests, and handy for exercising the
//! signaling server without a real WebRTC stack.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{
    EngineError, EngineEvents, EngineFactory, MediaEngine, Role, SignalingState,
};
use crate::protocol::{SdpKind, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Start,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddIceCandidate { mline_index: u32, candidate: String },
    Stop,
}

#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// `create_offer` waits for [`MockEngine::release_offer`].
    pub hold_offers: bool,
    /// `start` raises negotiation-needed, like a pipeline with send-only media.
    pub negotiate_on_start: bool,
    pub fail_start: bool,
    /// The factory refuses to build engines with a recoverable error.
    pub fail_create: bool,
    /// The factory refuses to build engines with a fatal startup error.
    pub fatal_create: bool,
}

pub struct MockEngine {
    role: Role,
    events: EngineEvents,
    behavior: MockBehavior,
    state: Mutex<SignalingState>,
    calls: Mutex<Vec<EngineCall>>,
    offer_gate: Notify,
    version: AtomicU64,
}

impl MockEngine {
    pub fn new(role: Role, events: EngineEvents, behavior: MockBehavior) -> Self {
        Self {
            role,
            events,
            behavior,
            state: Mutex::new(SignalingState::Stable),
            calls: Mutex::new(Vec::new()),
            offer_gate: Notify::new(),
            version: AtomicU64::new(1),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    /// Lets one held `create_offer` complete.
    pub fn release_offer(&self) {
        self.offer_gate.notify_one();
    }

    /// Polls the recorded calls until `predicate` holds or two seconds pass.
    pub async fn wait_for<F>(&self, predicate: F) -> bool
    where
        F: Fn(&[EngineCall]) -> bool,
    {
        for _ in 0..200 {
            let satisfied = predicate(&self.calls.lock());
            if satisfied {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }

    fn transition(&self, next: SignalingState) {
        let changed = {
            let mut state = self.state.lock();
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            self.events.signaling_state_changed(next);
        }
    }

    fn description(&self, kind: SdpKind) -> SessionDescription {
        let version = self.version.fetch_add(1, Ordering::SeqCst);
        let sdp = format!(
            "v=0\r\no=- 4611731400430051336 {version} IN IP4 127.0.0.1\r\ns=beach-beacon-mock\r\nt=0 0\r\n"
        );
        SessionDescription { kind, sdp }
    }
}

fn validate(description: &SessionDescription) -> Result<(), EngineError> {
    if description.sdp.starts_with("v=0") {
        Ok(())
    } else {
        Err(EngineError::InvalidDescription(format!(
            "{} does not start with a version line",
            description.kind
        )))
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn start(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Start);
        if self.behavior.fail_start {
            return Err(EngineError::rejected("start", "mock pipeline refused to start"));
        }
        if self.behavior.negotiate_on_start {
            self.events.negotiation_needed();
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateOffer);
        if self.behavior.hold_offers {
            self.offer_gate.notified().await;
        }
        Ok(self.description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateAnswer);
        if self.signaling_state() != SignalingState::HaveRemoteOffer {
            return Err(EngineError::rejected(
                "create_answer",
                "no remote offer to answer",
            ));
        }
        Ok(self.description(SdpKind::Answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::SetLocalDescription(description.clone()));
        validate(&description)?;

        let current = self.signaling_state();
        let next = match (current, description.kind) {
            (SignalingState::Stable | SignalingState::HaveLocalOffer, SdpKind::Offer) => {
                SignalingState::HaveLocalOffer
            }
            (SignalingState::HaveRemoteOffer, SdpKind::Answer) => SignalingState::Stable,
            (state, kind) => {
                return Err(EngineError::rejected(
                    "set_local_description",
                    format!("local {kind} in state {state}"),
                ))
            }
        };
        self.transition(next);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::SetRemoteDescription(description.clone()));
        validate(&description)?;

        let current = self.signaling_state();
        match (current, description.kind) {
            (SignalingState::Stable | SignalingState::HaveRemoteOffer, SdpKind::Offer) => {
                self.transition(SignalingState::HaveRemoteOffer);
            }
            (SignalingState::HaveLocalOffer, SdpKind::Offer) => {
                // the pending local offer is dropped before the remote one applies
                self.transition(SignalingState::Stable);
                self.transition(SignalingState::HaveRemoteOffer);
            }
            (SignalingState::HaveLocalOffer, SdpKind::Answer) => {
                self.transition(SignalingState::Stable);
            }
            (state, kind) => {
                return Err(EngineError::rejected(
                    "set_remote_description",
                    format!("remote {kind} in state {state}"),
                ))
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        mline_index: u32,
        candidate: String,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::AddIceCandidate {
            mline_index,
            candidate: candidate.clone(),
        });
        if !candidate.is_empty() && !candidate.starts_with("candidate:") {
            return Err(EngineError::InvalidCandidate(candidate));
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        *self.state.lock()
    }

    async fn stop(&self) {
        self.record(EngineCall::Stop);
        self.transition(SignalingState::Closed);
    }
}

/// Builds [`MockEngine`]s and keeps them around for inspection.
#[derive(Default)]
pub struct MockEngineFactory {
    behavior: MockBehavior,
    engines: Mutex<Vec<Arc<MockEngine>>>,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            engines: Mutex::new(Vec::new()),
        }
    }

    pub fn engines(&self) -> Vec<Arc<MockEngine>> {
        self.engines.lock().clone()
    }

    pub fn last_engine(&self) -> Option<Arc<MockEngine>> {
        self.engines.lock().last().cloned()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(
        &self,
        role: Role,
        events: EngineEvents,
    ) -> Result<Arc<dyn MediaEngine>, EngineError> {
        if self.behavior.fatal_create {
            return Err(EngineError::Startup("mock factory is broken".into()));
        }
        if self.behavior.fail_create {
            return Err(EngineError::rejected("create", "mock factory declined"));
        }
        let engine = Arc::new(MockEngine::new(role, events, self.behavior.clone()));
        self.engines.lock().push(Arc::clone(&engine));
        Ok(engine)
    }
}
