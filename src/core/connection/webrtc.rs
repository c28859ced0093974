//! webrtc-rs implementation of the native transport seam.

use super::native::{
    ConnectionState, DataChannel, EventSink, Frame, IceCandidate, IceServer, PeerConnection,
    PeerConnector, PeerEvent, SessionDescription, SignalingState,
};
use crate::core::config::ICE_INCLUDE_LOOPBACK;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

// ── Connector ────────────────────────────────────────────────────────────────

/// Builds peer connections from one shared webrtc-rs `API`.
pub struct WebRtcConnector {
    api: API,
}

impl WebRtcConnector {
    pub fn new() -> Result<Self> {
        let mut me = MediaEngine::default();
        let reg = register_default_interceptors(Registry::new(), &mut me)?;

        let mut se = SettingEngine::default();
        se.set_include_loopback_candidate(ICE_INCLUDE_LOOPBACK);

        Ok(Self {
            api: APIBuilder::new()
                .with_setting_engine(se)
                .with_media_engine(me)
                .with_interceptor_registry(reg)
                .build(),
        })
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
        sink: EventSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .context("failed to create peer connection")?,
        );

        let state_sink = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                let state = from_rtc_connection_state(s);
                match state {
                    ConnectionState::Connected => {
                        info!(event = "webrtc_connected", peer = %sink.peer_id(), "WebRTC connection established");
                    }
                    ConnectionState::Failed => {
                        error!(event = "webrtc_failed", peer = %sink.peer_id(), "WebRTC connection failed");
                    }
                    ConnectionState::Disconnected => {
                        warn!(event = "webrtc_disconnected", peer = %sink.peer_id(), "WebRTC connection disconnected");
                    }
                    ConnectionState::Closed => {
                        info!(event = "webrtc_closed", peer = %sink.peer_id(), "WebRTC connection closed");
                    }
                    _ => {
                        debug!(event = "webrtc_state", peer = %sink.peer_id(), ?state);
                    }
                }
                sink.emit(|peer_id| PeerEvent::StateChanged { peer_id, state });
            })
        }));

        let ice_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let sink = ice_sink.clone();
            Box::pin(async move {
                let candidate = match c {
                    None => None,
                    Some(c) => match c.to_json() {
                        Ok(init) => Some(from_rtc_candidate(init)),
                        Err(e) => {
                            warn!(event = "candidate_to_json_failure", peer = %sink.peer_id(), error = %e);
                            return;
                        }
                    },
                };
                sink.emit(|peer_id| PeerEvent::LocalCandidate { peer_id, candidate });
            })
        }));

        let dc_sink = sink.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = dc_sink.clone();
            Box::pin(async move {
                info!(
                    event = "dc_announced",
                    peer = %sink.peer_id(),
                    label = %dc.label(),
                    "Remote peer opened a data channel"
                );
                let channel: Arc<dyn DataChannel> = RtcChannel::attach(dc, sink.clone()).await;
                sink.emit(|peer_id| PeerEvent::ChannelAnnounced { peer_id, channel });
            })
        }));

        Ok(Arc::new(RtcPeer { pc, sink }))
    }
}

// ── Peer connection ──────────────────────────────────────────────────────────

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    sink: EventSink,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .context("failed to create data channel")?;
        Ok(RtcChannel::attach(dc, self.sink.clone()).await)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.local_description().await
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_description().await
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let rtc: RTCSessionDescription = serde_json::from_value(serde_json::to_value(&desc)?)
            .context("invalid session description")?;
        self.pc.set_remote_description(rtc).await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>) -> Result<()> {
        // An empty candidate is webrtc-rs' end-of-candidates marker.
        let init = candidate.map(to_rtc_candidate).unwrap_or_default();
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        from_rtc_connection_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

impl RtcPeer {
    async fn local_description(&self) -> Result<SessionDescription> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| anyhow!("No local description after negotiation"))?;
        Ok(serde_json::from_value(serde_json::to_value(&desc)?)?)
    }
}

// ── Data channel ─────────────────────────────────────────────────────────────

struct RtcChannel {
    dc: Arc<RTCDataChannel>,
    drained: Arc<Notify>,
}

impl RtcChannel {
    /// Wrap `dc` and route its callbacks into `sink`.
    async fn attach(dc: Arc<RTCDataChannel>, sink: EventSink) -> Arc<Self> {
        let drained = Arc::new(Notify::new());

        let open_sink = sink.clone();
        let label = dc.label().to_string();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                info!(event = "dc_open", peer = %open_sink.peer_id(), channel = %label, "DataChannel open");
                open_sink.emit(|peer_id| PeerEvent::ChannelOpened { peer_id });
            })
        }));

        let close_sink = sink.clone();
        let close_drained = drained.clone();
        let label = dc.label().to_string();
        dc.on_close(Box::new(move || {
            let sink = close_sink.clone();
            let drained = close_drained.clone();
            let label = label.clone();
            Box::pin(async move {
                warn!(event = "dc_closed", peer = %sink.peer_id(), channel = %label, "DataChannel closed by transport");
                drained.notify_one();
                sink.emit(|peer_id| PeerEvent::ChannelClosed { peer_id });
            })
        }));

        let label = dc.label().to_string();
        dc.on_error(Box::new(move |err| {
            let label = label.clone();
            Box::pin(async move {
                error!(event = "dc_error", channel = %label, %err, "DataChannel transport error");
            })
        }));

        let msg_sink = sink.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = msg_sink.clone();
            Box::pin(async move {
                let frame = if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => Frame::Text(text),
                        Err(_) => Frame::Binary(msg.data),
                    }
                } else {
                    Frame::Binary(msg.data)
                };
                sink.emit(|peer_id| PeerEvent::Message { peer_id, frame });
            })
        }));

        let low = drained.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let low = low.clone();
            Box::pin(async move {
                low.notify_one();
            })
        }))
        .await;

        if dc.ready_state() == RTCDataChannelState::Open {
            sink.emit(|peer_id| PeerEvent::ChannelOpened { peer_id });
        }

        Arc::new(Self { dc, drained })
    }
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
    }

    async fn drained(&self) {
        self.drained.notified().await;
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}

// ── Conversions ──────────────────────────────────────────────────────────────

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_candidate(c: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_mline_index: c.sdp_m_line_index,
        username_fragment: c.username_fragment,
    }
}

fn from_rtc_candidate(c: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_m_line_index: c.sdp_mline_index,
        username_fragment: c.username_fragment,
    }
}

fn from_rtc_connection_state(s: RTCPeerConnectionState) -> ConnectionState {
    match s {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}
