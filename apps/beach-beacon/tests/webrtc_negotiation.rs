use std::sync::Arc;
use std::time::Duration;

use beach_beacon::engine::webrtc::{WebRtcEngineConfig, WebRtcEngineFactory};
use beach_beacon::protocol::{Envelope, SdpKind, SessionDescription, SignalingMessage};
use beach_beacon::registry::{ConnectionId, ConnectionRegistry};
use beach_beacon::session::Outbound;
use tokio::sync::mpsc;
use tokio::time::timeout;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

async fn next_description(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> SessionDescription {
    loop {
        let frame = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("outbound frame in time")
            .expect("outbound channel open");
        match frame {
            Outbound::Signal(SignalingMessage::Sdp(description)) => return description,
            Outbound::Signal(SignalingMessage::Ice { .. }) => continue,
            Outbound::Close { code, reason } => panic!("session closed with {code}: {reason}"),
        }
    }
}

async fn browser() -> RTCPeerConnection {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().expect("codecs");
    APIBuilder::new()
        .with_media_engine(media_engine)
        .build()
        .new_peer_connection(RTCConfiguration::default())
        .await
        .expect("browser peer connection")
}

#[tokio::test]
async fn polite_session_answers_a_racing_browser_offer() {
    let registry = ConnectionRegistry::new(Arc::new(WebRtcEngineFactory::new(
        WebRtcEngineConfig::default(),
    )));
    let (outbound, mut rx) = mpsc::unbounded_channel();
    let handle = registry
        .open(ConnectionId::new(), outbound)
        .await
        .expect("open");

    let server_offer = next_description(&mut rx).await;
    assert_eq!(server_offer.kind, SdpKind::Offer);
    assert!(server_offer.sdp.contains("m=video"));

    // the browser opens its data channel before it has seen the server offer
    let browser = browser().await;
    browser
        .create_data_channel("channel", None)
        .await
        .expect("data channel");
    let browser_offer = browser.create_offer(None).await.expect("browser offer");
    browser
        .set_local_description(browser_offer.clone())
        .await
        .expect("browser local offer");

    let envelope = Envelope::try_from(SignalingMessage::Sdp(SessionDescription::offer(
        browser_offer.sdp,
    )))
    .expect("envelope");
    assert!(handle.deliver(envelope));

    let answer = next_description(&mut rx).await;
    assert_eq!(answer.kind, SdpKind::Answer);
    browser
        .set_remote_description(RTCSessionDescription::answer(answer.sdp).expect("answer sdp"))
        .await
        .expect("browser applies answer");
    assert!(!handle.is_closed());

    registry.shutdown().await;
    let _ = browser.close().await;
}
