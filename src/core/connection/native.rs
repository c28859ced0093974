//! Native transport seam: the peer-connection and data-channel handles the
//! registry drives, and the events they report.
//!
//! The production implementation lives in [`super::webrtc`]; tests use the
//! in-memory doubles in `super::testing`. Callbacks never touch registry or
//! engine state directly: they are converted into [`PeerEvent`]s and queued
//! on the coordinator's channel, so every state transition is processed one
//! at a time in arrival order.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

// ── Wire-visible negotiation types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// `{type, sdp}` exactly as browsers serialize `RTCSessionDescription`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }
}

/// `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Host candidates describe a directly reachable local address.
    pub fn is_host(&self) -> bool {
        self.candidate.contains(" typ host")
    }
}

/// ICE server entry as the relay sends it. `urls` may be a single string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            ..Default::default()
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

// ── States ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// `failed`, `closed` and `disconnected` all end the session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed | Self::Disconnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

// ── Events ───────────────────────────────────────────────────────────────────

/// One data-channel message. Text frames carry control JSON, binary
/// frames carry raw chunk bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

pub enum PeerEvent {
    StateChanged {
        peer_id: String,
        state: ConnectionState,
    },
    /// A locally gathered candidate; `None` marks the end of gathering.
    LocalCandidate {
        peer_id: String,
        candidate: Option<IceCandidate>,
    },
    /// The remote side opened a data channel towards us.
    ChannelAnnounced {
        peer_id: String,
        channel: Arc<dyn DataChannel>,
    },
    ChannelOpened {
        peer_id: String,
    },
    ChannelClosed {
        peer_id: String,
    },
    Message {
        peer_id: String,
        frame: Frame,
    },
}

impl PeerEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            Self::StateChanged { peer_id, .. }
            | Self::LocalCandidate { peer_id, .. }
            | Self::ChannelAnnounced { peer_id, .. }
            | Self::ChannelOpened { peer_id }
            | Self::ChannelClosed { peer_id }
            | Self::Message { peer_id, .. } => peer_id,
        }
    }
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged { peer_id, state } => f
                .debug_struct("StateChanged")
                .field("peer_id", peer_id)
                .field("state", state)
                .finish(),
            Self::LocalCandidate { peer_id, candidate } => f
                .debug_struct("LocalCandidate")
                .field("peer_id", peer_id)
                .field("candidate", candidate)
                .finish(),
            Self::ChannelAnnounced { peer_id, channel } => f
                .debug_struct("ChannelAnnounced")
                .field("peer_id", peer_id)
                .field("label", &channel.label())
                .finish(),
            Self::ChannelOpened { peer_id } => {
                f.debug_struct("ChannelOpened").field("peer_id", peer_id).finish()
            }
            Self::ChannelClosed { peer_id } => {
                f.debug_struct("ChannelClosed").field("peer_id", peer_id).finish()
            }
            Self::Message { peer_id, frame } => f
                .debug_struct("Message")
                .field("peer_id", peer_id)
                .field("frame", frame)
                .finish(),
        }
    }
}

/// Per-peer event forwarder handed to native callbacks.
///
/// Detaching is how handlers are removed: callbacks keep firing inside the
/// native stack but their events no longer reach the coordinator.
#[derive(Clone)]
pub struct EventSink {
    peer_id: Arc<str>,
    tx: mpsc::UnboundedSender<PeerEvent>,
    attached: Arc<AtomicBool>,
}

impl EventSink {
    pub fn new(peer_id: &str, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            peer_id: Arc::from(peer_id),
            tx,
            attached: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Build and forward an event; silently no-ops once detached.
    pub fn emit(&self, build: impl FnOnce(String) -> PeerEvent) {
        if self.attached.load(Ordering::Acquire) {
            let _ = self.tx.send(build(self.peer_id.to_string()));
        }
    }

    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

// ── Handles ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn send_binary(&self, data: Bytes) -> Result<()>;

    /// Bytes queued in the transport send buffer.
    async fn buffered_amount(&self) -> usize;

    async fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Resolves on the next buffered-amount-low signal. May resolve early
    /// for a signal that fired before the call; callers re-check the
    /// buffered amount afterwards.
    async fn drained(&self);

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Open a locally initiated data channel. Its events go to the same
    /// sink as the connection's.
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    /// Create an offer, apply it as the local description and return it.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer, apply it as the local description and return it.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn has_remote_description(&self) -> bool;

    /// Apply a remote candidate; `None` signals end of candidates.
    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    async fn close(&self) -> Result<()>;
}

/// Factory for native connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
        sink: EventSink,
    ) -> Result<Arc<dyn PeerConnection>>;
}
