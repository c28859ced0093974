pub mod native;
mod registry;
pub mod sdp;
mod session;
pub mod webrtc;

#[cfg(test)]
pub mod testing;

pub use native::{
    ConnectionState, DataChannel, EventSink, Frame, IceCandidate, IceServer, PeerConnection,
    PeerConnector, PeerEvent, SdpKind, SessionDescription, SignalingState,
};
pub use registry::{default_ice_servers, PeerConnectionRegistry};
pub use session::{PeerSession, PeerSummary};
pub use webrtc::WebRtcConnector;
