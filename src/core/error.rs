//! Error taxonomy shared by the registry, the transfer engine and the
//! coordinator.
//!
//! Native layers (webrtc-rs, WebSocket, filesystem) report `anyhow::Error`;
//! it is wrapped into [`PeerError::Transport`] at the component boundary.
//! Nothing in this enum is ever surfaced to the user as an exception; the
//! coordinator logs it and turns user-relevant outcomes into notices.
//! A denied share is a normal outcome, not an error; it travels as
//! `TransferEvent::Denied`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    /// Relay connection closed or erroring. Recovered by the reconnect loop.
    #[error("relay link unavailable: {0}")]
    SignalingTransient(String),

    /// An answer or candidate arrived for a connection that is no longer in
    /// the expected signaling state.
    #[error("stale negotiation with peer {peer_id}: {reason}")]
    NegotiationStale { peer_id: String, reason: String },

    /// The data channel for this peer is missing or not open.
    #[error("data channel to peer {peer_id} is not open")]
    ChannelUnavailable { peer_id: String },

    /// A frame from the peer broke the data-channel protocol.
    #[error("protocol violation from peer {peer_id}: {reason}")]
    ProtocolViolation { peer_id: String, reason: String },

    /// An outbound batch to this peer is already pending or streaming.
    #[error("a transfer to peer {peer_id} is already in progress")]
    Busy { peer_id: String },

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl PeerError {
    pub fn channel_unavailable(peer_id: &str) -> Self {
        Self::ChannelUnavailable {
            peer_id: peer_id.to_string(),
        }
    }

    pub fn violation(peer_id: &str, reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            peer_id: peer_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn stale(peer_id: &str, reason: impl Into<String>) -> Self {
        Self::NegotiationStale {
            peer_id: peer_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error should tear down the peer's connection.
    pub fn is_fatal_for_peer(&self) -> bool {
        matches!(
            self,
            Self::ChannelUnavailable { .. } | Self::ProtocolViolation { .. }
        )
    }
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
