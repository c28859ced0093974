//! PeerConnectionRegistry: the table of live per-peer connections.
//!
//! # Lifecycle
//!
//! ```text
//! establish ─► negotiating (offer/answer, candidates buffered)
//!           ─► connected (pc connected + data channel open)
//!           ─► failed | closed | disconnected ─► close() ─► removed
//! ```
//!
//! The registry never talks to the relay itself: `create_offer` and
//! `create_answer` return descriptions for the coordinator to forward.
//! Negotiation problems are logged here and never reach the user.

use super::native::{
    ConnectionState, DataChannel, EventSink, IceCandidate, IceServer, PeerConnection,
    PeerConnector, PeerEvent, SessionDescription, SignalingState,
};
use super::sdp::host_only;
use super::session::{PeerSession, PeerSummary};
use crate::core::config::{CHUNK_SIZE, FALLBACK_STUN_URL, MAX_EARLY_CANDIDATES};
use crate::core::error::{PeerError, PeerResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct PeerConnectionRegistry {
    connector: Arc<dyn PeerConnector>,
    events: mpsc::UnboundedSender<PeerEvent>,
    ice_servers: Vec<IceServer>,
    sessions: HashMap<String, PeerSession>,
    /// Candidates that arrived before any session existed for the peer.
    early_candidates: HashMap<String, Vec<Option<IceCandidate>>>,
}

impl PeerConnectionRegistry {
    pub fn new(connector: Arc<dyn PeerConnector>, events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            connector,
            events,
            ice_servers: default_ice_servers(),
            sessions: HashMap::new(),
            early_candidates: HashMap::new(),
        }
    }

    /// Replace the ICE servers used for connections created from now on.
    /// An empty list falls back to the public STUN server.
    pub fn set_ice_servers(&mut self, servers: Vec<IceServer>) {
        self.ice_servers = if servers.is_empty() {
            default_ice_servers()
        } else {
            servers
        };
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    // ── Negotiation ──────────────────────────────────────────────────────

    /// Return the peer's connection, creating it if absent.
    pub async fn establish(
        &mut self,
        peer_id: &str,
        name: &str,
        device: &str,
    ) -> PeerResult<Arc<dyn PeerConnection>> {
        if let Some(session) = self.sessions.get(peer_id) {
            return Ok(session.pc.clone());
        }

        let sink = EventSink::new(peer_id, self.events.clone());
        let pc = self.connector.connect(&self.ice_servers, sink.clone()).await?;
        let pending_candidates = self.early_candidates.remove(peer_id).unwrap_or_default();

        info!(
            event = "peer_session_created",
            peer = %peer_id,
            name = %name,
            device = %device,
            early_candidates = pending_candidates.len(),
            "Peer session created"
        );

        self.sessions.insert(
            peer_id.to_string(),
            PeerSession {
                peer_id: peer_id.to_string(),
                name: name.to_string(),
                device: device.to_string(),
                pc: pc.clone(),
                channel: None,
                pending_candidates,
                manually_linked: false,
                sink,
            },
        );
        Ok(pc)
    }

    /// Open the peer's data channel and produce a host-only local offer.
    pub async fn create_offer(
        &mut self,
        peer_id: &str,
        name: &str,
        device: &str,
    ) -> PeerResult<SessionDescription> {
        let pc = self.establish(peer_id, name, device).await?;

        let session = self.session_mut(peer_id)?;
        if session.channel.is_none() {
            let label = Uuid::new_v4().to_string();
            let dc = pc.create_data_channel(&label).await?;
            dc.set_buffered_amount_low_threshold(CHUNK_SIZE).await;
            debug!(event = "dc_created", peer = %peer_id, channel = %label);
            session.channel = Some(dc);
        }

        let offer = pc.create_offer().await?;
        Ok(host_only(offer))
    }

    /// Apply a remote offer and produce a host-only local answer.
    ///
    /// The remote side's first data channel is adopted through
    /// [`Self::adopt_channel`] when its announcement event arrives.
    pub async fn create_answer(
        &mut self,
        peer_id: &str,
        offer: SessionDescription,
        name: &str,
        device: &str,
    ) -> PeerResult<SessionDescription> {
        let pc = self.establish(peer_id, name, device).await?;
        pc.set_remote_description(offer).await?;
        self.replay_candidates(peer_id).await;

        let answer = pc.create_answer().await?;
        info!(event = "answer_created", peer = %peer_id, "Created an answer");
        Ok(host_only(answer))
    }

    /// Apply the remote answer to our outstanding offer.
    ///
    /// An answer in any state other than have-local-offer is stale: it is
    /// logged and ignored.
    pub async fn approve_answer(&mut self, peer_id: &str, answer: SessionDescription) -> PeerResult<()> {
        let Some(session) = self.sessions.get(peer_id) else {
            warn!(event = "answer_without_session", peer = %peer_id, "Ignored answer for unknown peer");
            return Ok(());
        };

        let state = session.pc.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            warn!(event = "stale_answer", peer = %peer_id, ?state, "Ignored answer, no local offer pending");
            return Ok(());
        }

        session.pc.set_remote_description(answer).await?;
        self.replay_candidates(peer_id).await;
        Ok(())
    }

    /// Apply a remote candidate now, or buffer it until a remote description
    /// exists. `None` is the end-of-candidates marker and is ordered like any
    /// other candidate.
    pub async fn add_ice_candidate(&mut self, peer_id: &str, candidate: Option<IceCandidate>) {
        let Some(session) = self.sessions.get_mut(peer_id) else {
            let early = self.early_candidates.entry(peer_id.to_string()).or_default();
            if early.len() >= MAX_EARLY_CANDIDATES {
                warn!(event = "early_candidate_overflow", peer = %peer_id, "Dropped candidate for unknown peer");
            } else {
                debug!(event = "early_candidate_buffered", peer = %peer_id);
                early.push(candidate);
            }
            return;
        };

        if session.pc.has_remote_description().await {
            if let Err(e) = session.pc.add_ice_candidate(candidate).await {
                warn!(event = "ice_candidate_rejected", peer = %peer_id, error = %e);
            }
        } else {
            debug!(
                event = "ice_candidate_buffered",
                peer = %peer_id,
                buffered = session.pending_candidates.len() + 1
            );
            session.pending_candidates.push(candidate);
        }
    }

    async fn replay_candidates(&mut self, peer_id: &str) {
        let Some(session) = self.sessions.get_mut(peer_id) else {
            return;
        };
        let pending = std::mem::take(&mut session.pending_candidates);
        if pending.is_empty() {
            return;
        }
        debug!(event = "ice_candidates_replayed", peer = %peer_id, count = pending.len());
        for candidate in pending {
            if let Err(e) = session.pc.add_ice_candidate(candidate).await {
                warn!(event = "ice_candidate_rejected", peer = %peer_id, error = %e);
            }
        }
    }

    /// Adopt the first channel the remote side opens; later ones are closed.
    pub async fn adopt_channel(&mut self, peer_id: &str, channel: Arc<dyn DataChannel>) -> bool {
        let Some(session) = self.sessions.get_mut(peer_id) else {
            warn!(event = "dc_without_session", peer = %peer_id, "Closing channel for unknown peer");
            let _ = channel.close().await;
            return false;
        };
        if session.channel.is_some() {
            warn!(
                event = "dc_extra_channel",
                peer = %peer_id,
                label = %channel.label(),
                "Peer already has a data channel, closing the new one"
            );
            let _ = channel.close().await;
            return false;
        }
        channel.set_buffered_amount_low_threshold(CHUNK_SIZE).await;
        session.channel = Some(channel);
        true
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Detach handlers, close channel and connection, forget the session.
    /// Returns whether a session existed.
    pub async fn close(&mut self, peer_id: &str) -> bool {
        self.early_candidates.remove(peer_id);
        let Some(session) = self.sessions.remove(peer_id) else {
            return false;
        };

        warn!(event = "peer_session_closed", peer = %peer_id, "Closing peer connection");
        session.sink.detach();
        if let Some(dc) = session.channel {
            if let Err(e) = dc.close().await {
                debug!(event = "dc_close_failure", peer = %peer_id, error = %e);
            }
        }
        if let Err(e) = session.pc.close().await {
            debug!(event = "pc_close_failure", peer = %peer_id, error = %e);
        }
        true
    }

    /// Close every session. Returns the ids that were closed.
    pub async fn invalidate_all(&mut self) -> Vec<String> {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in &ids {
            self.close(id).await;
        }
        self.early_candidates.clear();
        ids
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// The peer's channel, if both the connection and the channel are open.
    pub fn open_channel(&self, peer_id: &str) -> PeerResult<Arc<dyn DataChannel>> {
        let session = self
            .sessions
            .get(peer_id)
            .ok_or_else(|| PeerError::channel_unavailable(peer_id))?;
        match &session.channel {
            Some(dc) if dc.is_open() && session.pc.connection_state() == ConnectionState::Connected => {
                Ok(dc.clone())
            }
            _ => Err(PeerError::channel_unavailable(peer_id)),
        }
    }

    /// Flag the session as linked through a pairing code.
    pub fn mark_linked(&mut self, peer_id: &str) -> bool {
        match self.sessions.get_mut(peer_id) {
            Some(session) => {
                session.manually_linked = true;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.sessions.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerSession> {
        self.sessions.get(peer_id)
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut out: Vec<PeerSummary> = self.sessions.values().map(PeerSession::summary).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.peer_id.cmp(&b.peer_id)));
        out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn session_mut(&mut self, peer_id: &str) -> PeerResult<&mut PeerSession> {
        self.sessions
            .get_mut(peer_id)
            .ok_or_else(|| PeerError::stale(peer_id, "session closed during negotiation"))
    }
}

pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer::stun(FALLBACK_STUN_URL)]
}
