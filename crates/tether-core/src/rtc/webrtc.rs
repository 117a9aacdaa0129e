//! WebRTC connector
//!
//! Wraps the webrtc crate to implement `RtcConnector` for production use.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::NegotiationState;
use super::connector::{Role, RtcConnector, RtcEvent, RtcSession};
use crate::config::TetherConfig;
use crate::error::{Result, TetherError};
use crate::transport::DataChannel;

/// Label of the single data channel each peer connection carries
pub const DATA_CHANNEL_LABEL: &str = "tether";

fn negotiation_error(e: impl std::fmt::Display) -> TetherError {
    TetherError::Negotiation(e.to_string())
}

/// Real WebRTC peer connection factory
pub struct WebRtcConnector {
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    pub fn from_config(config: &TetherConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(negotiation_error)?;

        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(negotiation_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        api.new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(negotiation_error)
    }
}

#[async_trait]
impl RtcConnector for WebRtcConnector {
    async fn create_session(
        &self,
        role: Role,
    ) -> Result<(Arc<dyn RtcSession>, mpsc::UnboundedReceiver<RtcEvent>)> {
        let pc = self.new_peer_connection().await?;
        let (tx, rx) = mpsc::unbounded_channel();

        // work must happen inside the returned futures
        let candidate_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let event = match candidate.map(|c| c.to_json()) {
                    Some(Ok(init)) => RtcEvent::LocalCandidate {
                        candidate: init.candidate,
                        mid: init.sdp_mid,
                    },
                    Some(Err(e)) => {
                        debug!("Skipping unserializable candidate: {}", e);
                        return;
                    }
                    None => RtcEvent::GatheringComplete,
                };
                let _ = tx.send(event);
            })
        }));

        let state_tx = tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::Connected => Some(NegotiationState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(NegotiationState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(NegotiationState::Failed),
                    RTCPeerConnectionState::Closed => Some(NegotiationState::Closed),
                    _ => None,
                };
                if let Some(state) = mapped {
                    let _ = tx.send(RtcEvent::StateChange(state));
                }
            })
        }));

        match role {
            Role::Offerer => {
                let dc = pc
                    .create_data_channel(DATA_CHANNEL_LABEL, None)
                    .await
                    .map_err(negotiation_error)?;
                wire_channel(dc, tx);
            }
            Role::Answerer => {
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        debug!("Remote opened data channel {}", dc.label());
                        wire_channel(dc, tx);
                    })
                }));
            }
        }

        Ok((Arc::new(WebRtcSession { pc }), rx))
    }
}

fn wire_channel(dc: Arc<RTCDataChannel>, tx: mpsc::UnboundedSender<RtcEvent>) {
    let weak: Weak<RTCDataChannel> = Arc::downgrade(&dc);
    let open_tx = tx.clone();
    dc.on_open(Box::new(move || {
        let tx = open_tx.clone();
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(dc) = weak.upgrade() {
                let _ = tx.send(RtcEvent::ChannelOpen(Arc::new(WebRtcChannel { dc })));
            }
        })
    }));

    let message_tx = tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = message_tx.clone();
        Box::pin(async move {
            let _ = tx.send(RtcEvent::Message(msg.data));
        })
    }));

    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(RtcEvent::ChannelClosed);
        })
    }));
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl RtcSession for WebRtcSession {
    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation_error)?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string()).map_err(negotiation_error)?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(negotiation_error)?;

        let answer = self.pc.create_answer(None).await.map_err(negotiation_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation_error)?;
        Ok(answer.sdp)
    }

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string()).map_err(negotiation_error)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(negotiation_error)
    }

    async fn add_candidate(&self, candidate: &str, mid: Option<&str>) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: mid.map(str::to_string),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(negotiation_error)
    }

    async fn local_description(&self) -> Option<String> {
        self.pc.local_description().await.map(|desc| desc.sdp)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("Error closing peer connection: {}", e);
        }
    }
}

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    async fn send(&self, data: Bytes) -> Result<()> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| TetherError::DataChannel(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}
