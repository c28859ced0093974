use super::native::{DataChannel, EventSink, IceCandidate, PeerConnection};
use std::sync::Arc;

/// One live remote peer, owned by the registry.
pub struct PeerSession {
    pub peer_id: String,
    pub name: String,
    pub device: String,
    pub pc: Arc<dyn PeerConnection>,
    pub channel: Option<Arc<dyn DataChannel>>,
    /// Remote candidates received before the remote description was set,
    /// in arrival order. `None` is the end-of-candidates marker.
    pub pending_candidates: Vec<Option<IceCandidate>>,
    /// Set when the link came from a pairing code; such peers are persisted
    /// for reconnection.
    pub manually_linked: bool,
    pub(super) sink: EventSink,
}

impl PeerSession {
    /// Public view for listings.
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.peer_id.clone(),
            name: self.name.clone(),
            device: self.device.clone(),
            connected: self.channel.as_ref().is_some_and(|c| c.is_open()),
            manually_linked: self.manually_linked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub peer_id: String,
    pub name: String,
    pub device: String,
    pub connected: bool,
    pub manually_linked: bool,
}
