//! In-memory doubles for the native transport seam.

use super::native::{
    ConnectionState, DataChannel, EventSink, Frame, IceCandidate, IceServer, PeerConnection,
    PeerConnector, PeerEvent, SdpKind, SessionDescription, SignalingState,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const MOCK_SDP: &str = "v=0\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
a=candidate:1 1 udp 2122260223 192.168.1.20 50000 typ host\r\n\
a=candidate:2 1 udp 1686052607 203.0.113.7 61000 typ srflx raddr 192.168.1.20 rport 50000\r\n";

// ── Channel ──────────────────────────────────────────────────────────────────

/// Records every frame it is asked to send.
///
/// With `accumulate` on, every binary send adds its length to the buffered
/// amount, modelling a peer that never reads until [`MockChannel::drain`].
pub struct MockChannel {
    label: String,
    open: AtomicBool,
    accumulate: AtomicBool,
    buffered: AtomicUsize,
    threshold: AtomicUsize,
    drained: Notify,
    sent: Mutex<Vec<Frame>>,
    closed: AtomicBool,
}

impl MockChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(true),
            accumulate: AtomicBool::new(false),
            buffered: AtomicUsize::new(0),
            threshold: AtomicUsize::new(0),
            drained: Notify::new(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn set_accumulate(&self, on: bool) {
        self.accumulate.store(on, Ordering::SeqCst);
    }

    pub fn set_buffered(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
    }

    /// Empty the send buffer and fire the low-water signal.
    pub fn drain(&self) {
        self.buffered.store(0, Ordering::SeqCst);
        self.drained.notify_one();
    }

    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }

    /// Control frames, parsed.
    pub fn texts(&self) -> Vec<serde_json::Value> {
        self.sent()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Text(t) => serde_json::from_str(&t).ok(),
                Frame::Binary(_) => None,
            })
            .collect()
    }

    pub fn text_types(&self) -> Vec<String> {
        self.texts()
            .iter()
            .filter_map(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
            .collect()
    }

    pub fn binaries(&self) -> Vec<Bytes> {
        self.sent()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Binary(b) => Some(b),
                Frame::Text(_) => None,
            })
            .collect()
    }

    fn check_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("mock channel '{}' not open", self.label))
        }
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.check_open()?;
        self.sent.lock().unwrap().push(Frame::Text(text));
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.check_open()?;
        if self.accumulate.load(Ordering::SeqCst) {
            self.buffered.fetch_add(data.len(), Ordering::SeqCst);
        }
        self.sent.lock().unwrap().push(Frame::Binary(data));
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.threshold.store(threshold, Ordering::SeqCst);
    }

    async fn drained(&self) {
        self.drained.notified().await;
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ── Peer connection ──────────────────────────────────────────────────────────

/// Enforces the offer/answer signaling states; rejects candidates until a
/// remote description exists.
pub struct MockPeer {
    sink: EventSink,
    state: Mutex<ConnectionState>,
    signaling: Mutex<SignalingState>,
    remote: Mutex<Option<SessionDescription>>,
    applied: Mutex<Vec<Option<IceCandidate>>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    closed: AtomicBool,
}

impl MockPeer {
    fn new(sink: EventSink) -> Arc<Self> {
        Arc::new(Self {
            sink,
            state: Mutex::new(ConnectionState::New),
            signaling: Mutex::new(SignalingState::Stable),
            remote: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Simulate a native state-change callback.
    pub fn fire_state(&self, state: ConnectionState) {
        self.set_connection_state(state);
        self.sink
            .emit(|peer_id| PeerEvent::StateChanged { peer_id, state });
    }

    pub fn applied_candidates(&self) -> Vec<Option<IceCandidate>> {
        self.applied.lock().unwrap().clone()
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().unwrap().clone()
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let dc = MockChannel::new(label);
        self.channels.lock().unwrap().push(dc.clone());
        Ok(dc)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        *self.signaling.lock().unwrap() = SignalingState::HaveLocalOffer;
        Ok(SessionDescription::new(SdpKind::Offer, MOCK_SDP))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut signaling = self.signaling.lock().unwrap();
        if *signaling != SignalingState::HaveRemoteOffer {
            return Err(anyhow!("create_answer in state {:?}", *signaling));
        }
        *signaling = SignalingState::Stable;
        Ok(SessionDescription::new(SdpKind::Answer, MOCK_SDP))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut signaling = self.signaling.lock().unwrap();
        *signaling = match (desc.kind, *signaling) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, state) => return Err(anyhow!("remote {kind:?} in state {state:?}")),
        };
        *self.remote.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.remote.lock().unwrap().is_some()
    }

    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>) -> Result<()> {
        if self.remote.lock().unwrap().is_none() {
            return Err(anyhow!("candidate before remote description"));
        }
        self.applied.lock().unwrap().push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        *self.signaling.lock().unwrap()
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        *self.state.lock().unwrap() = ConnectionState::Closed;
        Ok(())
    }
}

// ── Connector ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockConnector {
    peers: Mutex<HashMap<String, Arc<MockPeer>>>,
    connects: AtomicUsize,
    last_ice_servers: Mutex<Vec<IceServer>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Most recent connection created for `peer_id`.
    pub fn peer(&self, peer_id: &str) -> Arc<MockPeer> {
        self.peers
            .lock()
            .unwrap()
            .get(peer_id)
            .cloned()
            .unwrap_or_else(|| panic!("no mock connection for {peer_id}"))
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_ice_servers(&self) -> Vec<IceServer> {
        self.last_ice_servers.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
        sink: EventSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_ice_servers.lock().unwrap() = ice_servers.to_vec();
        let peer = MockPeer::new(sink.clone());
        self.peers
            .lock()
            .unwrap()
            .insert(sink.peer_id().to_string(), peer.clone());
        Ok(peer)
    }
}

/// Open, connected channel pair endpoint for engine tests.
pub fn open_channel() -> Arc<MockChannel> {
    MockChannel::new("test-channel")
}
