//! Relay wire messages.
//!
//! Requests go out as `{"type": "...", "data": {...}}`; responses arrive flat,
//! `{"type": "...", ...}`. Both use camelCase field names.

use crate::core::connection::sdp::SdpPayload;
use crate::core::connection::{IceCandidate, IceServer};
use serde::{Deserialize, Serialize};

/// Whether this device is visible to everyone on the network or reachable
/// only through its pairing code.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryMode {
    #[default]
    Network,
    #[serde(alias = "HIDDEN")]
    Direct,
}

impl std::fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayRequest {
    #[serde(rename_all = "camelCase")]
    Connect {
        name: String,
        auth_token: Option<String>,
        discovery_mode: DiscoveryMode,
    },
    #[serde(rename_all = "camelCase")]
    ChangeSettings {
        name: String,
        discovery_mode: DiscoveryMode,
    },
    /// Pairing-code lookup.
    #[serde(rename_all = "camelCase")]
    PeerConnect { connection_id: String },
    /// Re-link a previously paired peer after a relay reconnect.
    #[serde(rename_all = "camelCase")]
    PeerReconnect { peer_id: String },
    #[serde(rename_all = "camelCase")]
    Offer {
        offer: SdpPayload,
        peer_id: String,
        discovery_mode: DiscoveryMode,
    },
    #[serde(rename_all = "camelCase")]
    Answer { answer: SdpPayload, peer_id: String },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        peer_id: String,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    EndOfIceCandidates { peer_id: String },
}

impl RelayRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "CONNECT",
            Self::ChangeSettings { .. } => "CHANGE_SETTINGS",
            Self::PeerConnect { .. } => "PEER_CONNECT",
            Self::PeerReconnect { .. } => "PEER_RECONNECT",
            Self::Offer { .. } => "OFFER",
            Self::Answer { .. } => "ANSWER",
            Self::IceCandidate { .. } => "ICE_CANDIDATE",
            Self::EndOfIceCandidates { .. } => "END_OF_ICE_CANDIDATES",
        }
    }
}

// ── Responses ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayResponse {
    /// Identity assignment after our CONNECT.
    #[serde(rename_all = "camelCase")]
    Connect {
        #[serde(default)]
        peer_id: Option<String>,
        #[serde(default)]
        auth_token: Option<String>,
        #[serde(default)]
        connection_id: Option<String>,
        #[serde(default)]
        ice_servers: Vec<IceServer>,
    },
    /// A peer left the relay.
    #[serde(rename_all = "camelCase")]
    Disconnect { peer_id: String },
    /// Relay heartbeat.
    #[serde(rename_all = "camelCase")]
    PingPong {
        #[serde(default)]
        auth_token: Option<String>,
        #[serde(default)]
        ice_servers: Vec<IceServer>,
    },
    /// The relay asks us to make an offer to this peer.
    #[serde(rename_all = "camelCase")]
    Offer {
        peer_id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        device: String,
        #[serde(default, alias = "connectionType")]
        discovery_mode: DiscoveryMode,
    },
    /// A peer's offer, forwarded to us for answering.
    #[serde(rename_all = "camelCase")]
    Answer {
        peer_id: String,
        offer: SdpPayload,
        #[serde(default)]
        name: String,
        #[serde(default)]
        device: String,
        #[serde(default, alias = "connectionType")]
        discovery_mode: DiscoveryMode,
    },
    /// The answer to our offer.
    #[serde(rename_all = "camelCase")]
    ApproveAnswer { peer_id: String, answer: SdpPayload },
    /// Outcome of a pairing-code lookup.
    #[serde(rename_all = "camelCase")]
    PeerConnect {
        #[serde(default)]
        peer_id: Option<String>,
        is_connected: bool,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        peer_id: String,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    EndOfIceCandidates { peer_id: String },
    #[serde(other)]
    Unknown,
}

// ── Sender seam ──────────────────────────────────────────────────────────────

/// Fire-and-forget outbound path to the relay.
///
/// Delivery is best effort: while the link is down, requests are dropped.
pub trait RelaySender: Send + Sync {
    fn send(&self, request: RelayRequest);
}
