//! WebRTC implementation of the media engine capability.
//!
//! Wraps an `RTCPeerConnection` from the `webrtc` crate: local Opus/VP8
//! RTP tracks, offer/answer handling, ICE candidate exchange, and the
//! connection-state callbacks the session coordinator drives teardown
//! from. Device capture feeding the local tracks is the embedding
//! application's concern; the engine exposes the tracks and the mute flag.

use crate::negotiation::engine::{
    ConnectionState, EngineError, EngineEvent, MediaEngine, MediaEngineFactory, SdpKind,
};
use crate::signaling::message::IceCandidate;
use crate::types::call::MediaKind;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, broadcast};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as RtcMediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

const EVENT_CAPACITY: usize = 64;

/// Default STUN configuration, sufficient for most direct connections.
/// Deployments behind symmetric NAT add their own TURN servers.
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

#[derive(Clone)]
pub struct WebRtcEngineConfig {
    pub ice_servers: Vec<RTCIceServer>,
}

impl Default for WebRtcEngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }
}

/// Media engine backed by a `webrtc` peer connection.
pub struct WebRtcEngine {
    config: WebRtcEngineConfig,
    peer_connection: Mutex<Option<Arc<RTCPeerConnection>>>,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticRTP>>>,
    muted: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<EngineEvent>,
}

impl WebRtcEngine {
    pub fn new(config: WebRtcEngineConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            config,
            peer_connection: Mutex::new(None),
            local_tracks: Mutex::new(Vec::new()),
            muted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
        })
    }

    /// Local RTP tracks for the capture layer to write samples into.
    pub async fn local_tracks(&self) -> Vec<Arc<TrackLocalStaticRTP>> {
        self.local_tracks.lock().await.clone()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    async fn peer_connection(&self) -> Result<Arc<RTCPeerConnection>, EngineError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(EngineError::Closed);
        }
        let mut guard = self.peer_connection.lock().await;
        if let Some(pc) = guard.as_ref() {
            return Ok(Arc::clone(pc));
        }
        let pc = self.create_peer_connection().await?;
        *guard = Some(Arc::clone(&pc));
        Ok(pc)
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, EngineError> {
        let mut media_engine = RtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| EngineError::PeerConnection(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| EngineError::PeerConnection(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.config.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| EngineError::PeerConnection(e.to_string()))?,
        );

        self.install_handlers(&pc);
        Ok(pc)
    }

    fn install_handlers(&self, pc: &Arc<RTCPeerConnection>) {
        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            debug!("peer connection state: {:?}", s);
            if let Some(state) = map_connection_state(s) {
                let _ = events.send(EngineEvent::ConnectionState(state));
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = events.send(EngineEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("failed to serialize ice candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        pc.on_track(Box::new(move |track, _, _| {
            let events = events.clone();
            Box::pin(async move {
                debug!("remote track: {:?}", track.codec());
                let _ = events.send(EngineEvent::RemoteMedia);
            })
        }));
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn acquire_media(&self, kind: MediaKind) -> Result<(), EngineError> {
        let pc = self.peer_connection().await?;

        let mut tracks = vec![Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            "peercall".to_string(),
        ))];

        if kind.is_video() {
            tracks.push(Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: "video/vp8".to_string(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_string(),
                "peercall".to_string(),
            )));
        }

        for track in &tracks {
            pc.add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| EngineError::PeerConnection(e.to_string()))?;
        }

        *self.local_tracks.lock().await = tracks;
        Ok(())
    }

    async fn release_media(&self) {
        self.local_tracks.lock().await.clear();
    }

    async fn set_muted(&self, muted: bool) {
        // The capture layer checks this flag before writing samples into
        // the local tracks.
        self.muted.store(muted, Ordering::Relaxed);
    }

    async fn create_offer(&self) -> Result<String, EngineError> {
        let pc = self.peer_connection().await?;
        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| EngineError::Sdp(e.to_string()))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| EngineError::Sdp(e.to_string()))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, EngineError> {
        let pc = self.peer_connection().await?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::Sdp(e.to_string()))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| EngineError::Sdp(e.to_string()))?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), EngineError> {
        let pc = self.peer_connection().await?;
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| EngineError::Sdp(e.to_string()))?;
        pc.set_remote_description(description)
            .await
            .map_err(|e| EngineError::Sdp(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let pc = self.peer_connection().await?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        pc.add_ice_candidate(init)
            .await
            .map_err(|e| EngineError::Ice(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.local_tracks.lock().await.clear();
        if let Some(pc) = self.peer_connection.lock().await.take() {
            if let Err(e) = pc.close().await {
                warn!("error closing peer connection: {}", e);
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

/// Factory producing one [`WebRtcEngine`] per call.
#[derive(Default)]
pub struct WebRtcEngineFactory {
    config: WebRtcEngineConfig,
}

impl WebRtcEngineFactory {
    pub fn new(config: WebRtcEngineConfig) -> Self {
        Self { config }
    }
}

impl MediaEngineFactory for WebRtcEngineFactory {
    fn create_engine(&self) -> Arc<dyn MediaEngine> {
        WebRtcEngine::new(self.config.clone())
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
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
