use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as RtcMediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{
    ConnectionState, EngineError, EngineEvents, EngineFactory, MediaEngine, Role, SignalingState,
};
use crate::protocol::{SdpKind, SessionDescription};

const STREAM_ID: &str = "beach-beacon";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebRtcEngineConfig {
    /// STUN/TURN urls. Empty means host candidates only.
    pub ice_servers: Vec<String>,
    /// Reply sent for each string message on a browser-opened data channel.
    pub data_channel_reply: Option<String>,
}

/// Builds one `RTCPeerConnection` per negotiation session.
pub struct WebRtcEngineFactory {
    config: WebRtcEngineConfig,
}

impl WebRtcEngineFactory {
    pub fn new(config: WebRtcEngineConfig) -> Self {
        Self { config }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

fn build_api() -> Result<API, EngineError> {
    let mut media_engine = RtcMediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|err| EngineError::Startup(format!("register codecs: {err}")))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|err| EngineError::Startup(format!("register interceptors: {err}")))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        role: Role,
        events: EngineEvents,
    ) -> Result<Arc<dyn MediaEngine>, EngineError> {
        let engine = WebRtcEngine::new(
            self.rtc_configuration(),
            self.config.data_channel_reply.clone(),
            events,
        )
        .await?;
        debug!(role = ?role, "peer connection created");
        Ok(Arc::new(engine))
    }
}

/// Engine events tied to one peer connection. Once the engine replaces that
/// connection its callbacks go quiet.
#[derive(Clone)]
struct EventScope {
    events: EngineEvents,
    current: Arc<AtomicU64>,
    generation: u64,
}

impl EventScope {
    fn live(&self) -> Option<&EngineEvents> {
        (self.current.load(Ordering::SeqCst) == self.generation).then_some(&self.events)
    }
}

async fn open_peer_connection(
    api: &API,
    configuration: &RTCConfiguration,
    scope: EventScope,
    reply: Option<String>,
) -> Result<Arc<RTCPeerConnection>, EngineError> {
    let pc = api
        .new_peer_connection(configuration.clone())
        .await
        .map_err(|err| EngineError::rejected("new_peer_connection", err))?;
    let pc = Arc::new(pc);
    install_handlers(&pc, scope, reply);
    Ok(pc)
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, scope: EventScope, reply: Option<String>) {
    let negotiation_scope = scope.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let scope = negotiation_scope.clone();
        Box::pin(async move {
            if let Some(events) = scope.live() {
                events.negotiation_needed();
            }
        })
    }));

    let candidate_scope = scope.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let scope = candidate_scope.clone();
        Box::pin(async move {
            let Some(events) = scope.live() else {
                return;
            };
            let Some(candidate) = candidate else {
                trace!("local candidate gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let mline_index = u32::from(init.sdp_mline_index.unwrap_or(0));
                    events.local_candidate(mline_index, init.candidate);
                }
                Err(err) => events.fault(format!("serialize local candidate: {err}")),
            }
        })
    }));

    let signaling_scope = scope.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let scope = signaling_scope.clone();
        Box::pin(async move {
            let Some(events) = scope.live() else {
                trace!(state = %state, "signaling change from a replaced peer connection");
                return;
            };
            match signaling_state_from_rtc(state) {
                Some(state) => events.signaling_state_changed(state),
                None => trace!(state = %state, "ignoring unspecified signaling state"),
            }
        })
    }));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let scope = scope.clone();
        Box::pin(async move {
            if let (Some(events), Some(state)) = (scope.live(), connection_state_from_rtc(state)) {
                events.connection_state_changed(state);
            }
        })
    }));

    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let reply = reply.clone();
        Box::pin(async move {
            observe_data_channel(channel, reply);
        })
    }));
}

fn observe_data_channel(channel: Arc<RTCDataChannel>, reply: Option<String>) {
    let label = channel.label().to_string();
    info!(label = %label, "data channel announced by peer");

    let open_label = label.clone();
    channel.on_open(Box::new(move || {
        let label = open_label.clone();
        Box::pin(async move {
            info!(label = %label, "data channel opened");
        })
    }));

    let close_label = label.clone();
    channel.on_close(Box::new(move || {
        let label = close_label.clone();
        Box::pin(async move {
            info!(label = %label, "data channel closed");
        })
    }));

    let error_label = label.clone();
    channel.on_error(Box::new(move |err: webrtc::Error| {
        let label = error_label.clone();
        Box::pin(async move {
            warn!(label = %label, error = %err, "data channel error");
        })
    }));

    let weak: Weak<RTCDataChannel> = Arc::downgrade(&channel);
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let weak = weak.clone();
        let reply = reply.clone();
        let label = label.clone();
        Box::pin(async move {
            if !message.is_string {
                debug!(label = %label, bytes = message.data.len(), "binary data channel message");
                return;
            }
            let text = String::from_utf8_lossy(&message.data).into_owned();
            info!(label = %label, message = %text, "data channel message");

            let (Some(reply), Some(channel)) = (reply, weak.upgrade()) else {
                return;
            };
            if let Err(err) = channel.send_text(reply).await {
                warn!(label = %label, error = %err, "data channel reply failed");
            }
        })
    }));
}

/// A media engine backed by a `webrtc` peer connection with send-only media.
///
/// `webrtc` cannot roll back a local offer. When a remote offer collides with
/// one, the engine drops its peer connection and answers from a fresh one
/// that carries the same local tracks.
pub struct WebRtcEngine {
    api: API,
    configuration: RTCConfiguration,
    reply: Option<String>,
    events: EngineEvents,
    pc: RwLock<Arc<RTCPeerConnection>>,
    generation: Arc<AtomicU64>,
    tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    pending_candidates: AsyncMutex<Vec<RTCIceCandidateInit>>,
    stopped: AtomicBool,
}

impl WebRtcEngine {
    async fn new(
        configuration: RTCConfiguration,
        reply: Option<String>,
        events: EngineEvents,
    ) -> Result<Self, EngineError> {
        let api = build_api()?;
        let generation = Arc::new(AtomicU64::new(0));
        let scope = EventScope {
            events: events.clone(),
            current: Arc::clone(&generation),
            generation: 0,
        };
        let pc = open_peer_connection(&api, &configuration, scope, reply.clone()).await?;

        Ok(Self {
            api,
            configuration,
            reply,
            events,
            pc: RwLock::new(pc),
            generation,
            tracks: Mutex::new(Vec::new()),
            pending_candidates: AsyncMutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    fn pc(&self) -> Arc<RTCPeerConnection> {
        self.pc.read().clone()
    }

    async fn add_local_track(
        &self,
        mime_type: &str,
        clock_rate: u32,
        channels: u16,
        track_id: &str,
    ) -> Result<(), EngineError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                clock_rate,
                channels,
                ..Default::default()
            },
            track_id.to_owned(),
            STREAM_ID.to_owned(),
        ));
        attach_track(&self.pc(), Arc::clone(&track)).await?;
        self.tracks.lock().push(track);
        Ok(())
    }

    /// Swaps in a fresh peer connection and closes the old one. The mirror is
    /// told the pending local offer is gone.
    async fn replace_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, EngineError> {
        let generation = self.generation.load(Ordering::SeqCst) + 1;
        let scope = EventScope {
            events: self.events.clone(),
            current: Arc::clone(&self.generation),
            generation,
        };
        let pc = open_peer_connection(&self.api, &self.configuration, scope, self.reply.clone())
            .await?;

        self.generation.store(generation, Ordering::SeqCst);
        let previous = std::mem::replace(&mut *self.pc.write(), Arc::clone(&pc));
        if let Err(err) = previous.close().await {
            warn!(error = %err, "failed to close replaced peer connection");
        }
        self.events.signaling_state_changed(SignalingState::Stable);
        debug!(generation, "peer connection replaced");
        Ok(pc)
    }

    async fn reattach_tracks(&self, pc: &RTCPeerConnection) -> Result<(), EngineError> {
        let tracks = self.tracks.lock().clone();
        for track in tracks {
            attach_track(pc, track).await?;
        }
        Ok(())
    }

    async fn flush_pending_candidates(&self, pc: &RTCPeerConnection) -> Result<(), EngineError> {
        let pending = std::mem::take(&mut *self.pending_candidates.lock().await);
        if !pending.is_empty() {
            debug!(count = pending.len(), "applying buffered remote candidates");
        }
        for candidate in pending {
            pc.add_ice_candidate(candidate)
                .await
                .map_err(|err| EngineError::InvalidCandidate(err.to_string()))?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn buffered_candidates(&self) -> usize {
        self.pending_candidates.lock().await.len()
    }
}

async fn attach_track(
    pc: &RTCPeerConnection,
    track: Arc<TrackLocalStaticSample>,
) -> Result<(), EngineError> {
    let sender = pc
        .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|err| EngineError::rejected("add_track", err))?;

    // drain RTCP so interceptors keep running
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while sender.read(&mut rtcp_buf).await.is_ok() {}
    });
    Ok(())
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|err| EngineError::InvalidDescription(err.to_string()))
}

fn from_rtc_description(
    description: RTCSessionDescription,
) -> Result<SessionDescription, EngineError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(EngineError::rejected(
                "describe",
                format!("unexpected sdp type {other}"),
            ))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

pub(crate) fn signaling_state_from_rtc(state: RTCSignalingState) -> Option<SignalingState> {
    match state {
        RTCSignalingState::Stable => Some(SignalingState::Stable),
        RTCSignalingState::HaveLocalOffer => Some(SignalingState::HaveLocalOffer),
        RTCSignalingState::HaveRemoteOffer => Some(SignalingState::HaveRemoteOffer),
        RTCSignalingState::HaveLocalPranswer => Some(SignalingState::HaveLocalPrAnswer),
        RTCSignalingState::HaveRemotePranswer => Some(SignalingState::HaveRemotePrAnswer),
        RTCSignalingState::Closed => Some(SignalingState::Closed),
        RTCSignalingState::Unspecified => None,
    }
}

pub(crate) fn connection_state_from_rtc(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn start(&self) -> Result<(), EngineError> {
        self.add_local_track(MIME_TYPE_H264, 90_000, 0, "video").await?;
        self.add_local_track(MIME_TYPE_OPUS, 48_000, 2, "audio").await?;
        debug!("local video and audio tracks attached");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .pc()
            .create_offer(None)
            .await
            .map_err(|err| EngineError::rejected("create_offer", err))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc()
            .create_answer(None)
            .await
            .map_err(|err| EngineError::rejected("create_answer", err))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc_description(description)?;
        self.pc()
            .set_local_description(description)
            .await
            .map_err(|err| EngineError::rejected("set_local_description", err))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc_description(description)?;
        let mut pc = self.pc();
        let yielding = description.sdp_type == RTCSdpType::Offer
            && pc.signaling_state() == RTCSignalingState::HaveLocalOffer;
        if yielding {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(EngineError::rejected("set_remote_description", "engine stopped"));
            }
            debug!("dropping pending local offer for the remote offer");
            pc = self.replace_peer_connection().await?;
        }

        pc.set_remote_description(description)
            .await
            .map_err(|err| EngineError::rejected("set_remote_description", err))?;
        if yielding {
            // added after the remote offer, so they are offered again once stable
            self.reattach_tracks(&pc).await?;
        }
        self.flush_pending_candidates(&pc).await
    }

    async fn add_ice_candidate(
        &self,
        mline_index: u32,
        candidate: String,
    ) -> Result<(), EngineError> {
        let sdp_mline_index = u16::try_from(mline_index).map_err(|_| {
            EngineError::InvalidCandidate(format!("sdpMLineIndex {mline_index} out of range"))
        })?;
        let init = RTCIceCandidateInit {
            candidate,
            sdp_mid: None,
            sdp_mline_index: Some(sdp_mline_index),
            username_fragment: None,
        };

        let pc = self.pc();
        if pc.remote_description().await.is_none() {
            trace!("buffering remote candidate until a remote description is set");
            self.pending_candidates.lock().await.push(init);
            return Ok(());
        }
        pc.add_ice_candidate(init)
            .await
            .map_err(|err| EngineError::InvalidCandidate(err.to_string()))
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state_from_rtc(self.pc().signaling_state()).unwrap_or(SignalingState::Stable)
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.pc().close().await {
            warn!(error = %err, "failed to close peer connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::engine::EngineEvent;
    use crate::session::SessionEvent;

    #[test]
    fn signaling_states_map_one_to_one() {
        assert_eq!(
            signaling_state_from_rtc(RTCSignalingState::HaveLocalPranswer),
            Some(SignalingState::HaveLocalPrAnswer)
        );
        assert_eq!(
            signaling_state_from_rtc(RTCSignalingState::HaveRemoteOffer),
            Some(SignalingState::HaveRemoteOffer)
        );
        assert_eq!(signaling_state_from_rtc(RTCSignalingState::Unspecified), None);
        assert_eq!(
            connection_state_from_rtc(RTCPeerConnectionState::Failed),
            Some(ConnectionState::Failed)
        );
    }

    #[test]
    fn empty_ice_server_list_means_no_stun() {
        let factory = WebRtcEngineFactory::new(WebRtcEngineConfig::default());
        assert!(factory.rtc_configuration().ice_servers.is_empty());

        let factory = WebRtcEngineFactory::new(WebRtcEngineConfig {
            ice_servers: vec!["stun:stun.example.org:3478".into()],
            data_channel_reply: None,
        });
        let config = factory.rtc_configuration();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
    }

    #[tokio::test]
    async fn start_raises_negotiation_and_offers_both_tracks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = WebRtcEngineFactory::new(WebRtcEngineConfig::default());
        let engine = factory
            .create(Role::Polite, EngineEvents::new(tx))
            .await
            .expect("engine");

        engine.start().await.expect("start");
        let negotiation = timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                if matches!(event, SessionEvent::Engine(EngineEvent::NegotiationNeeded)) {
                    return true;
                }
            }
            false
        })
        .await
        .expect("negotiation needed in time");
        assert!(negotiation);

        let offer = engine.create_offer().await.expect("offer");
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.starts_with("v=0"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("m=audio"));
        assert_eq!(engine.signaling_state(), SignalingState::Stable);

        engine.stop().await;
    }

    async fn local_engine(events: mpsc::UnboundedSender<SessionEvent>) -> WebRtcEngine {
        WebRtcEngine::new(RTCConfiguration::default(), None, EngineEvents::new(events))
            .await
            .expect("engine")
    }

    /// A second peer connection playing the browser, with a data channel
    /// like the shipped page opens at load.
    async fn browser_offer() -> (RTCPeerConnection, RTCSessionDescription) {
        let browser = build_api()
            .expect("api")
            .new_peer_connection(RTCConfiguration::default())
            .await
            .expect("browser peer connection");
        browser
            .create_data_channel("channel", None)
            .await
            .expect("data channel");
        let offer = browser.create_offer(None).await.expect("browser offer");
        browser
            .set_local_description(offer.clone())
            .await
            .expect("browser local offer");
        (browser, offer)
    }

    fn signaling_states(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SignalingState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Engine(EngineEvent::SignalingStateChanged(state)) = event {
                states.push(state);
            }
        }
        states
    }

    #[tokio::test]
    async fn colliding_remote_offer_is_answered_from_a_fresh_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = local_engine(tx).await;
        engine.start().await.expect("start");
        let offer = engine.create_offer().await.expect("offer");
        engine.set_local_description(offer).await.expect("local offer");
        assert_eq!(engine.signaling_state(), SignalingState::HaveLocalOffer);

        let (browser, browser_offer) = browser_offer().await;
        engine
            .set_remote_description(SessionDescription::offer(browser_offer.sdp))
            .await
            .expect("yield to the browser offer");
        assert_eq!(engine.signaling_state(), SignalingState::HaveRemoteOffer);

        let answer = engine.create_answer().await.expect("answer");
        assert_eq!(answer.kind, SdpKind::Answer);
        assert!(answer.sdp.contains("m=application"));
        engine
            .set_local_description(answer.clone())
            .await
            .expect("local answer");
        assert_eq!(engine.signaling_state(), SignalingState::Stable);
        browser
            .set_remote_description(RTCSessionDescription::answer(answer.sdp).expect("answer sdp"))
            .await
            .expect("browser applies answer");

        // the replaced connection closing must not reach the session
        tokio::time::sleep(Duration::from_millis(100)).await;
        let states = signaling_states(&mut rx);
        assert!(!states.contains(&SignalingState::Closed), "{states:?}");
        assert_eq!(
            states,
            vec![
                SignalingState::HaveLocalOffer,
                SignalingState::Stable,
                SignalingState::HaveRemoteOffer,
                SignalingState::Stable,
            ]
        );

        engine.stop().await;
        let _ = browser.close().await;
    }

    #[tokio::test]
    async fn early_remote_candidates_wait_for_the_remote_description() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = local_engine(tx).await;

        engine
            .add_ice_candidate(0, "candidate:1 1 UDP 2122252543 192.0.2.4 50000 typ host".into())
            .await
            .expect("buffered");
        assert_eq!(engine.buffered_candidates().await, 1);

        let (browser, browser_offer) = browser_offer().await;
        engine
            .set_remote_description(SessionDescription::offer(browser_offer.sdp))
            .await
            .expect("remote offer");
        assert_eq!(engine.buffered_candidates().await, 0);

        engine
            .add_ice_candidate(0, "candidate:2 1 UDP 2122252543 192.0.2.4 50001 typ host".into())
            .await
            .expect("applied directly");
        assert_eq!(engine.buffered_candidates().await, 0);

        let err = engine
            .add_ice_candidate(70_000, "candidate:3 1 UDP 1 192.0.2.4 50002 typ host".into())
            .await
            .expect_err("index out of range");
        assert!(matches!(err, EngineError::InvalidCandidate(_)));

        engine.stop().await;
        let _ = browser.close().await;
    }

    #[tokio::test]
    async fn garbage_descriptions_are_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = WebRtcEngineFactory::new(WebRtcEngineConfig::default());
        let engine = factory
            .create(Role::Polite, EngineEvents::new(tx))
            .await
            .expect("engine");

        let err = engine
            .set_remote_description(SessionDescription::offer("not sdp"))
            .await
            .expect_err("rejected");
        assert!(matches!(
            err,
            EngineError::InvalidDescription(_) | EngineError::Rejected { .. }
        ));
        engine.stop().await;
    }
}
