//! SessionCoordinator: identity, relay reconnection, and the bridge between
//! relay messages, peer-connection events, transfer reports and user
//! commands.
//!
//! Everything runs on one task. [`SessionCoordinator::run`] selects over the
//! relay link, native peer events, transfer task reports and front-end
//! commands, and handles each to completion before taking the next one.

use crate::core::config::RECONNECT_DELAY;
use crate::core::connection::sdp::SdpPayload;
use crate::core::connection::{
    IceServer, PeerConnectionRegistry, PeerConnector, PeerEvent, PeerSummary, SessionDescription,
};
use crate::core::error::PeerError;
use crate::core::notify::{NotificationGateway, Notice};
use crate::core::signaling::{
    DiscoveryMode, LinkStatus, RelayRequest, RelayResponse, RelaySender, SignalEvent,
    SignalingChannel,
};
use crate::core::store::{SessionKey, SessionStore, StoreExt};
use crate::core::transfer::{OutgoingFile, TransferEngine, TransferEvent, TransferSignal};
use crate::utils::sos::SignalOfStop;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "eager", "gentle", "happy", "jolly", "kind", "lively", "lucky",
    "mellow", "nimble", "proud", "quiet", "rapid", "shy", "swift", "witty",
];

const ANIMALS: &[&str] = &[
    "badger", "beaver", "bison", "crane", "dolphin", "falcon", "ferret", "gecko", "heron",
    "koala", "lemur", "lynx", "marmot", "otter", "panda", "puffin", "raven", "salmon", "tapir",
    "walrus", "wombat", "yak",
];

/// A fresh title-cased display name such as "Quiet Otter".
pub fn random_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("otter");
    format!("{} {}", title_case(adjective), title_case(animal))
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Device label announced to peers.
pub fn local_device() -> String {
    match std::env::consts::OS {
        "linux" => "Linux".to_string(),
        "macos" => "macOS".to_string(),
        "windows" => "Windows".to_string(),
        other => other.to_string(),
    }
}

/// Connect off the session loop. A failed attempt comes back as
/// `LinkStatus::Unreachable`.
fn spawn_connect(
    link: Arc<SignalingChannel>,
    events: mpsc::UnboundedSender<SignalEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = link.connect(events.clone()).await {
            warn!(
                event = "relay_connect_failure",
                error = %e,
                retry_ms = RECONNECT_DELAY.as_millis() as u64,
                "Relay unreachable, retrying"
            );
            let _ = events.send(SignalEvent::Status(LinkStatus::Unreachable));
        }
    })
}

// ── Wiring ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Overrides the persisted display name.
    pub name: Option<String>,
    /// Overrides the persisted discovery mode.
    pub mode: Option<DiscoveryMode>,
    /// Pairing code to link with once the relay is up.
    pub pairing_code: Option<String>,
    pub compress_sdp: bool,
}

/// Receivers the coordinator's loop drains.
pub struct Inbox {
    pub peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    pub signals: mpsc::UnboundedReceiver<TransferSignal>,
    pub transfer_events: mpsc::UnboundedReceiver<TransferEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityInfo {
    pub name: String,
    pub mode: DiscoveryMode,
    pub peer_id: Option<String>,
    pub connection_id: Option<String>,
}

/// Front-end intents.
pub enum Command {
    Send {
        peer_id: String,
        files: Vec<OutgoingFile>,
    },
    Cancel {
        peer_id: String,
    },
    /// Link with the device showing this pairing code.
    Link {
        code: String,
    },
    Unlink {
        peer_id: String,
    },
    Close {
        peer_id: String,
    },
    Rename {
        name: String,
    },
    SetMode(DiscoveryMode),
    Peers {
        reply: oneshot::Sender<Vec<PeerSummary>>,
    },
    Identity {
        reply: oneshot::Sender<IdentityInfo>,
    },
}

pub struct SessionCoordinator {
    store: Arc<dyn SessionStore>,
    relay: Arc<dyn RelaySender>,
    gateway: Arc<dyn NotificationGateway>,
    registry: PeerConnectionRegistry,
    engine: TransferEngine,
    app_events: mpsc::UnboundedSender<TransferEvent>,
    name: String,
    device: String,
    mode: DiscoveryMode,
    pairing_code: Option<String>,
    compress_sdp: bool,
}

impl SessionCoordinator {
    pub fn new(
        settings: Settings,
        store: Arc<dyn SessionStore>,
        relay: Arc<dyn RelaySender>,
        connector: Arc<dyn PeerConnector>,
        gateway: Arc<dyn NotificationGateway>,
        app_events: mpsc::UnboundedSender<TransferEvent>,
    ) -> (Self, Inbox) {
        let (peer_tx, peer_events) = mpsc::unbounded_channel();
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (event_tx, transfer_events) = mpsc::unbounded_channel();

        let name = settings
            .name
            .filter(|n| !n.trim().is_empty())
            .or_else(|| store.name())
            .unwrap_or_else(random_name);
        store.set_as(SessionKey::Name, &name);

        let mode = settings.mode.unwrap_or_else(|| store.discovery_mode());
        store.set_as(SessionKey::ConnectionType, &mode);

        let mut registry = PeerConnectionRegistry::new(connector, peer_tx);
        registry.set_ice_servers(store.ice_servers());

        info!(event = "identity_loaded", name = %name, mode = %mode, "Session identity ready");

        let coordinator = Self {
            engine: TransferEngine::new(gateway.clone(), signal_tx, event_tx),
            store,
            relay,
            gateway,
            registry,
            app_events,
            name,
            device: local_device(),
            mode,
            pairing_code: settings.pairing_code,
            compress_sdp: settings.compress_sdp,
        };
        (
            coordinator,
            Inbox {
                peer_events,
                signals,
                transfer_events,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &PeerConnectionRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    pub fn identity(&self) -> IdentityInfo {
        IdentityInfo {
            name: self.name.clone(),
            mode: self.mode,
            peer_id: self.store.get_as(SessionKey::PeerId),
            connection_id: self.store.get_as(SessionKey::ConnectionId),
        }
    }

    // ── Main loop ────────────────────────────────────────────────────────

    /// Drive the session until `sos` fires or the command sender goes away.
    pub async fn run(
        mut self,
        link: Arc<SignalingChannel>,
        mut inbox: Inbox,
        mut commands: mpsc::UnboundedReceiver<Command>,
        sos: SignalOfStop,
    ) -> anyhow::Result<()> {
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let mut reconnect_at = Some(Instant::now());
        let mut connecting: Option<JoinHandle<()>> = None;

        loop {
            let reconnect = async move {
                match reconnect_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                _ = sos.wait() => break,

                _ = reconnect => {
                    reconnect_at = None;
                    connecting = Some(spawn_connect(link.clone(), relay_tx.clone()));
                }

                Some(event) = relay_rx.recv() => match event {
                    SignalEvent::Status(LinkStatus::Connected) => self.on_relay_open().await,
                    SignalEvent::Status(LinkStatus::Unreachable) => {
                        reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
                    }
                    SignalEvent::Status(LinkStatus::Disconnected) => {
                        let err = PeerError::SignalingTransient("relay link closed".into());
                        warn!(
                            event = "relay_disconnected",
                            error = %err,
                            retry_ms = RECONNECT_DELAY.as_millis() as u64,
                            "Relay connection closed, retrying"
                        );
                        reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
                    }
                    SignalEvent::Message(message) => self.handle_relay(message).await,
                },

                Some(event) = inbox.peer_events.recv() => self.handle_peer_event(event).await,

                Some(signal) = inbox.signals.recv() => self.handle_signal(signal).await,

                Some(event) = inbox.transfer_events.recv() => self.handle_transfer_event(event),

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }

        info!(event = "session_shutdown", "Shutting down session");
        if let Some(handle) = connecting {
            handle.abort();
        }
        self.shutdown().await;
        link.close();
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        self.engine.abandon_all();
        self.registry.invalidate_all().await;
    }

    // ── Relay ────────────────────────────────────────────────────────────

    /// Fresh relay link: the old identity may be gone, so every session is
    /// dropped before announcing ourselves again.
    pub async fn on_relay_open(&mut self) {
        let closed = self.registry.invalidate_all().await;
        self.engine.abandon_all();
        if !closed.is_empty() {
            info!(event = "sessions_invalidated", count = closed.len());
        }

        self.relay.send(RelayRequest::Connect {
            name: self.name.clone(),
            auth_token: self.store.get_as(SessionKey::AuthToken),
            discovery_mode: self.mode,
        });

        for peer_id in self.store.linked_peers() {
            if !self.registry.contains(&peer_id) {
                debug!(event = "peer_reconnect_requested", peer = %peer_id);
                self.relay.send(RelayRequest::PeerReconnect { peer_id });
            }
        }

        if let Some(code) = self.pairing_code.take() {
            info!(event = "pairing_requested", code = %code);
            self.relay.send(RelayRequest::PeerConnect {
                connection_id: code,
            });
        }
    }

    pub async fn handle_relay(&mut self, message: RelayResponse) {
        match message {
            RelayResponse::Connect {
                peer_id,
                auth_token,
                connection_id,
                ice_servers,
            } => {
                info!(
                    event = "relay_identity",
                    peer_id = ?peer_id,
                    connection_id = ?connection_id,
                    ice_servers = ice_servers.len(),
                    "Registered with relay"
                );
                self.store.set_opt(SessionKey::PeerId, peer_id.as_deref());
                if auth_token.is_some() {
                    self.store.set_opt(SessionKey::AuthToken, auth_token.as_deref());
                }
                self.store
                    .set_opt(SessionKey::ConnectionId, connection_id.as_deref());
                self.update_ice_servers(ice_servers);
                self.gateway.notify(Notice::Connected { connection_id });
            }
            RelayResponse::Disconnect { peer_id } => {
                info!(event = "peer_left", peer = %peer_id, "Peer left the relay");
                self.teardown(&peer_id).await;
            }
            RelayResponse::PingPong {
                auth_token,
                ice_servers,
            } => {
                debug!(event = "relay_ping_pong");
                if auth_token.is_some() {
                    self.store.set_opt(SessionKey::AuthToken, auth_token.as_deref());
                }
                self.update_ice_servers(ice_servers);
            }
            RelayResponse::Offer {
                peer_id,
                name,
                device,
                discovery_mode,
            } => {
                self.make_offer(peer_id, name, device, discovery_mode).await;
            }
            RelayResponse::Answer {
                peer_id,
                offer,
                name,
                device,
                discovery_mode,
            } => {
                self.make_answer(peer_id, offer, name, device, discovery_mode)
                    .await;
            }
            RelayResponse::ApproveAnswer { peer_id, answer } => {
                let answer = match answer.decode() {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(event = "answer_decode_failure", peer = %peer_id, error = %e);
                        return;
                    }
                };
                if let Err(e) = self.registry.approve_answer(&peer_id, answer).await {
                    warn!(event = "answer_apply_failure", peer = %peer_id, error = %e);
                }
            }
            RelayResponse::PeerConnect {
                peer_id,
                is_connected,
            } => {
                if is_connected {
                    info!(event = "pairing_succeeded", peer = ?peer_id);
                    self.gateway.notify(Notice::PeerLinked { peer_id });
                } else {
                    info!(event = "pairing_failed");
                    self.gateway.notify(Notice::PeerNotFound);
                }
            }
            RelayResponse::IceCandidate { peer_id, candidate } => {
                self.registry.add_ice_candidate(&peer_id, Some(candidate)).await;
            }
            RelayResponse::EndOfIceCandidates { peer_id } => {
                self.registry.add_ice_candidate(&peer_id, None).await;
            }
            RelayResponse::Unknown => {}
        }
    }

    fn update_ice_servers(&mut self, servers: Vec<IceServer>) {
        if servers.is_empty() {
            return;
        }
        self.store.set_as(SessionKey::IceServers, &servers);
        self.registry.set_ice_servers(servers);
    }

    async fn make_offer(&mut self, peer_id: String, name: String, device: String, mode: DiscoveryMode) {
        let offer = match self.registry.create_offer(&peer_id, &name, &device).await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(event = "offer_failure", peer = %peer_id, error = %e);
                self.teardown(&peer_id).await;
                return;
            }
        };
        if mode == DiscoveryMode::Direct {
            self.link_peer(&peer_id);
        }
        let Some(offer) = self.encode(&peer_id, offer) else {
            return;
        };
        info!(event = "offer_sent", peer = %peer_id, name = %name);
        self.relay.send(RelayRequest::Offer {
            offer,
            peer_id,
            discovery_mode: mode,
        });
    }

    async fn make_answer(
        &mut self,
        peer_id: String,
        offer: SdpPayload,
        name: String,
        device: String,
        mode: DiscoveryMode,
    ) {
        let offer = match offer.decode() {
            Ok(o) => o,
            Err(e) => {
                warn!(event = "offer_decode_failure", peer = %peer_id, error = %e);
                return;
            }
        };
        let answer = match self
            .registry
            .create_answer(&peer_id, offer, &name, &device)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!(event = "answer_failure", peer = %peer_id, error = %e);
                self.teardown(&peer_id).await;
                return;
            }
        };
        if mode == DiscoveryMode::Direct {
            self.link_peer(&peer_id);
        }
        let Some(answer) = self.encode(&peer_id, answer) else {
            return;
        };
        self.relay.send(RelayRequest::Answer { answer, peer_id });
    }

    fn encode(&self, peer_id: &str, desc: SessionDescription) -> Option<SdpPayload> {
        match SdpPayload::encode(desc, self.compress_sdp) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(event = "sdp_encode_failure", peer = %peer_id, error = %e);
                None
            }
        }
    }

    fn link_peer(&mut self, peer_id: &str) {
        self.registry.mark_linked(peer_id);
        if self.store.add_linked_peer(peer_id) {
            info!(event = "peer_linked", peer = %peer_id, "Remembering peer for reconnection");
        }
    }

    // ── Peer events ──────────────────────────────────────────────────────

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::StateChanged { peer_id, state } => {
                if state.is_terminal() {
                    warn!(event = "pc_state_terminal", peer = %peer_id, ?state, "Peer connection ended");
                    self.teardown(&peer_id).await;
                } else {
                    debug!(event = "pc_state", peer = %peer_id, ?state);
                }
            }
            PeerEvent::LocalCandidate { peer_id, candidate } => {
                if !self.registry.contains(&peer_id) {
                    return;
                }
                match candidate {
                    Some(c) if c.is_host() => {
                        self.relay.send(RelayRequest::IceCandidate {
                            peer_id,
                            candidate: c,
                        });
                    }
                    Some(c) => {
                        debug!(event = "ice_candidate_skipped", peer = %peer_id, candidate = %c.candidate);
                    }
                    None => {
                        self.relay.send(RelayRequest::EndOfIceCandidates { peer_id });
                    }
                }
            }
            PeerEvent::ChannelAnnounced { peer_id, channel } => {
                self.registry.adopt_channel(&peer_id, channel).await;
            }
            PeerEvent::ChannelOpened { peer_id } => {
                info!(event = "dc_open", peer = %peer_id, "Data channel open");
            }
            PeerEvent::ChannelClosed { peer_id } => {
                info!(event = "dc_closed", peer = %peer_id, "Data channel closed");
                self.teardown(&peer_id).await;
            }
            PeerEvent::Message { peer_id, frame } => {
                let Some(channel) = self.registry.get(&peer_id).and_then(|s| s.channel.clone())
                else {
                    debug!(event = "message_without_channel", peer = %peer_id);
                    return;
                };
                if let Err(e) = self.engine.handle_frame(&peer_id, &channel, frame).await {
                    self.on_peer_error(&peer_id, e).await;
                }
            }
        }
    }

    pub async fn handle_signal(&mut self, signal: TransferSignal) {
        let peer_id = match &signal {
            TransferSignal::Sent { peer_id, .. }
            | TransferSignal::SendFinished { peer_id, .. }
            | TransferSignal::Decision { peer_id, .. } => peer_id.clone(),
        };
        if let Err(e) = self.engine.handle_signal(signal).await {
            self.on_peer_error(&peer_id, e).await;
        }
    }

    /// Surface finished outcomes as notices and hand every event to the
    /// front-end.
    pub fn handle_transfer_event(&mut self, event: TransferEvent) {
        match &event {
            TransferEvent::Denied { peer_id } => self.gateway.notify(Notice::ShareDenied {
                peer_id: peer_id.clone(),
            }),
            TransferEvent::SendComplete { peer_id, files } => {
                self.gateway.notify(Notice::TransferFinished {
                    peer_id: peer_id.clone(),
                    files: *files,
                })
            }
            TransferEvent::FileReceived { peer_id, name, .. } => {
                self.gateway.notify(Notice::FileReceived {
                    peer_id: peer_id.clone(),
                    name: name.clone(),
                })
            }
            _ => {}
        }
        let _ = self.app_events.send(event);
    }

    async fn on_peer_error(&mut self, peer_id: &str, error: PeerError) {
        if error.is_fatal_for_peer() {
            warn!(event = "peer_error_fatal", peer = %peer_id, error = %error, "Tearing down peer");
            self.teardown(peer_id).await;
            self.gateway.notify(Notice::PeerUnavailable {
                peer_id: peer_id.to_string(),
            });
        } else {
            warn!(event = "peer_error", peer = %peer_id, error = %error);
        }
    }

    /// Close the connection and drop its transfers.
    pub async fn teardown(&mut self, peer_id: &str) {
        let existed = self.registry.close(peer_id).await;
        self.engine.abandon(peer_id);
        if existed {
            info!(event = "peer_teardown", peer = %peer_id);
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────

    pub async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { peer_id, files } => self.send_files(&peer_id, files).await,
            Command::Cancel { peer_id } => {
                if !self.engine.cancel_outbound(&peer_id) {
                    debug!(event = "cancel_nothing", peer = %peer_id);
                }
            }
            Command::Link { code } => {
                self.relay.send(RelayRequest::PeerConnect {
                    connection_id: code,
                });
            }
            Command::Unlink { peer_id } => {
                if self.store.remove_linked_peer(&peer_id) {
                    info!(event = "peer_unlinked", peer = %peer_id);
                }
            }
            Command::Close { peer_id } => self.teardown(&peer_id).await,
            Command::Rename { name } => {
                let name = name.trim().to_string();
                if name.is_empty() {
                    return;
                }
                self.name = name;
                self.store.set_as(SessionKey::Name, &self.name);
                self.push_settings();
            }
            Command::SetMode(mode) => {
                self.mode = mode;
                self.store.set_as(SessionKey::ConnectionType, &mode);
                self.push_settings();
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.registry.summaries());
            }
            Command::Identity { reply } => {
                let _ = reply.send(self.identity());
            }
        }
    }

    async fn send_files(&mut self, peer_id: &str, files: Vec<OutgoingFile>) {
        let channel = match self.registry.open_channel(peer_id) {
            Ok(channel) => channel,
            Err(e) => {
                self.on_peer_error(peer_id, e).await;
                return;
            }
        };
        let name = self.name.clone();
        if let Err(e) = self
            .engine
            .request_share(peer_id, channel, &name, files)
            .await
        {
            self.on_peer_error(peer_id, e).await;
        }
    }

    fn push_settings(&self) {
        info!(event = "settings_changed", name = %self.name, mode = %self.mode);
        self.relay.send(RelayRequest::ChangeSettings {
            name: self.name.clone(),
            discovery_mode: self.mode,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::testing::{MockConnector, MOCK_SDP};
    use crate::core::connection::{ConnectionState, Frame, IceCandidate, SdpKind};
    use crate::core::notify::{Decision, ShareRequest};
    use crate::core::store::MemoryStore;
    use crate::core::transfer::ControlFrame;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRelay {
        sent: Mutex<Vec<RelayRequest>>,
    }

    impl RecordingRelay {
        fn take(&self) -> Vec<RelayRequest> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        fn kinds(&self) -> Vec<&'static str> {
            self.take().iter().map(RelayRequest::kind).collect()
        }
    }

    impl RelaySender for RecordingRelay {
        fn send(&self, request: RelayRequest) {
            self.sent.lock().unwrap().push(request);
        }
    }

    #[derive(Default)]
    struct RecordingGateway {
        notices: Mutex<Vec<Notice>>,
    }

    impl RecordingGateway {
        fn notices(&self) -> Vec<Notice> {
            self.notices.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationGateway for RecordingGateway {
        async fn request(&self, _request: ShareRequest) -> Decision {
            Decision::Accept
        }

        fn notify(&self, notice: Notice) {
            self.notices.lock().unwrap().push(notice);
        }
    }

    struct Harness {
        coordinator: SessionCoordinator,
        inbox: Inbox,
        relay: Arc<RecordingRelay>,
        store: Arc<MemoryStore>,
        connector: Arc<MockConnector>,
        gateway: Arc<RecordingGateway>,
        app: mpsc::UnboundedReceiver<TransferEvent>,
    }

    fn harness_with(settings: Settings, store: Arc<MemoryStore>) -> Harness {
        let relay = Arc::new(RecordingRelay::default());
        let connector = MockConnector::new();
        let gateway = Arc::new(RecordingGateway::default());
        let (app_tx, app) = mpsc::unbounded_channel();
        let (coordinator, inbox) = SessionCoordinator::new(
            settings,
            store.clone(),
            relay.clone(),
            connector.clone(),
            gateway.clone(),
            app_tx,
        );
        Harness {
            coordinator,
            inbox,
            relay,
            store,
            connector,
            gateway,
            app,
        }
    }

    fn harness() -> Harness {
        harness_with(Settings::default(), Arc::new(MemoryStore::new()))
    }

    fn candidate(kind: &str) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:1 1 udp 1 10.0.0.2 5000 typ {kind}"),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    fn offer_from(peer_id: &str, mode: DiscoveryMode) -> RelayResponse {
        RelayResponse::Answer {
            peer_id: peer_id.into(),
            offer: SdpPayload::Plain(SessionDescription::new(SdpKind::Offer, MOCK_SDP)),
            name: "Brave Lynx".into(),
            device: "Linux".into(),
            discovery_mode: mode,
        }
    }

    #[test]
    fn random_names_are_title_cased() {
        let name = random_name();
        let words: Vec<&str> = name.split(' ').collect();
        assert_eq!(words.len(), 2);
        assert!(words.iter().all(|w| w.chars().next().unwrap().is_uppercase()));
    }

    #[tokio::test]
    async fn identity_is_generated_once_and_persisted() {
        let store = Arc::new(MemoryStore::new());
        let first = harness_with(Settings::default(), store.clone());
        let name = first.coordinator.name().to_string();
        assert_eq!(store.name().as_deref(), Some(name.as_str()));

        let second = harness_with(Settings::default(), store.clone());
        assert_eq!(second.coordinator.name(), name);

        let renamed = harness_with(
            Settings {
                name: Some("Custom Name".into()),
                mode: Some(DiscoveryMode::Direct),
                ..Settings::default()
            },
            store.clone(),
        );
        assert_eq!(renamed.coordinator.name(), "Custom Name");
        assert_eq!(store.discovery_mode(), DiscoveryMode::Direct);
    }

    #[tokio::test]
    async fn relay_open_announces_and_relinks() {
        let store = Arc::new(MemoryStore::new());
        store.add_linked_peer("old-friend");
        store.set_opt(SessionKey::AuthToken, Some("tok"));
        let mut h = harness_with(
            Settings {
                pairing_code: Some("424242".into()),
                ..Settings::default()
            },
            store,
        );

        // A session from the previous link gets invalidated.
        h.coordinator
            .handle_relay(offer_from("stale", DiscoveryMode::Network))
            .await;
        h.relay.take();

        h.coordinator.on_relay_open().await;
        let sent = h.relay.take();
        assert_eq!(
            sent.iter().map(RelayRequest::kind).collect::<Vec<_>>(),
            vec!["CONNECT", "PEER_RECONNECT", "PEER_CONNECT"]
        );
        assert!(matches!(
            &sent[0],
            RelayRequest::Connect { auth_token: Some(t), .. } if t == "tok"
        ));
        assert!(!h.coordinator.registry().contains("stale"));
        assert!(h.connector.peer("stale").is_closed());

        // The pairing code is used once.
        h.coordinator.on_relay_open().await;
        assert_eq!(h.relay.kinds(), vec!["CONNECT", "PEER_RECONNECT"]);
    }

    #[tokio::test]
    async fn connect_response_updates_identity() {
        let mut h = harness();
        h.coordinator
            .handle_relay(RelayResponse::Connect {
                peer_id: Some("me".into()),
                auth_token: Some("tok".into()),
                connection_id: Some("123456".into()),
                ice_servers: vec![IceServer::stun("stun:relay.example:3478")],
            })
            .await;

        let id = h.coordinator.identity();
        assert_eq!(id.peer_id.as_deref(), Some("me"));
        assert_eq!(id.connection_id.as_deref(), Some("123456"));
        assert_eq!(h.store.get_as::<String>(SessionKey::AuthToken).as_deref(), Some("tok"));
        assert_eq!(h.store.ice_servers().len(), 1);
        assert_eq!(
            h.coordinator.registry().ice_servers()[0].urls,
            vec!["stun:relay.example:3478"]
        );
        assert_eq!(
            h.gateway.notices(),
            vec![Notice::Connected {
                connection_id: Some("123456".into())
            }]
        );

        // An empty heartbeat list keeps the known servers.
        h.coordinator
            .handle_relay(RelayResponse::PingPong {
                auth_token: None,
                ice_servers: Vec::new(),
            })
            .await;
        assert_eq!(h.store.ice_servers().len(), 1);
        assert_eq!(h.store.get_as::<String>(SessionKey::AuthToken).as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn offer_request_produces_host_only_offer() {
        let mut h = harness();
        h.coordinator
            .handle_relay(RelayResponse::Offer {
                peer_id: "p1".into(),
                name: "Brave Lynx".into(),
                device: "Linux".into(),
                discovery_mode: DiscoveryMode::Network,
            })
            .await;

        let sent = h.relay.take();
        let [RelayRequest::Offer {
            offer,
            peer_id,
            discovery_mode,
        }] = sent.as_slice()
        else {
            panic!("expected a single OFFER, got {sent:?}");
        };
        assert_eq!(peer_id, "p1");
        assert_eq!(*discovery_mode, DiscoveryMode::Network);
        let desc = offer.clone().decode().unwrap();
        assert!(!desc.sdp.contains("typ srflx"));
        assert!(h.store.linked_peers().is_empty());
        assert_eq!(h.connector.peer("p1").channels().len(), 1);
    }

    #[tokio::test]
    async fn direct_answer_links_peer_and_compresses() {
        let mut h = harness_with(
            Settings {
                compress_sdp: true,
                ..Settings::default()
            },
            Arc::new(MemoryStore::new()),
        );
        h.coordinator
            .handle_relay(RelayResponse::IceCandidate {
                peer_id: "p2".into(),
                candidate: candidate("host"),
            })
            .await;
        h.coordinator
            .handle_relay(offer_from("p2", DiscoveryMode::Direct))
            .await;

        let sent = h.relay.take();
        let [RelayRequest::Answer { answer, peer_id }] = sent.as_slice() else {
            panic!("expected a single ANSWER, got {sent:?}");
        };
        assert_eq!(peer_id, "p2");
        assert!(matches!(answer, SdpPayload::Compact(_)));
        assert_eq!(answer.clone().decode().unwrap().kind, SdpKind::Answer);

        assert_eq!(h.store.linked_peers(), vec!["p2"]);
        assert!(h.coordinator.registry().get("p2").unwrap().manually_linked);
        assert_eq!(h.connector.peer("p2").applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn local_candidates_are_filtered_to_host() {
        let mut h = harness();
        h.coordinator
            .handle_relay(offer_from("p1", DiscoveryMode::Network))
            .await;
        h.relay.take();

        for c in [Some(candidate("srflx")), Some(candidate("host")), None] {
            h.coordinator
                .handle_peer_event(PeerEvent::LocalCandidate {
                    peer_id: "p1".into(),
                    candidate: c,
                })
                .await;
        }
        assert_eq!(h.relay.kinds(), vec!["ICE_CANDIDATE", "END_OF_ICE_CANDIDATES"]);

        // Nothing is trickled for unknown peers.
        h.coordinator
            .handle_peer_event(PeerEvent::LocalCandidate {
                peer_id: "ghost".into(),
                candidate: Some(candidate("host")),
            })
            .await;
        assert!(h.relay.take().is_empty());
    }

    #[tokio::test]
    async fn terminal_state_tears_down_session_and_transfers() {
        let mut h = harness();
        h.coordinator
            .handle_relay(offer_from("p1", DiscoveryMode::Network))
            .await;

        // Incoming share request leaves a pending prompt.
        let channel = crate::core::connection::testing::open_channel();
        h.coordinator
            .registry
            .adopt_channel("p1", channel.clone())
            .await;
        let request = ControlFrame::RequestedFileShare {
            name: "Brave Lynx".into(),
            metadata: vec![crate::core::transfer::FileMeta::new("a", 4, "")],
        };
        h.coordinator
            .handle_peer_event(PeerEvent::Message {
                peer_id: "p1".into(),
                frame: Frame::Text(request.to_json()),
            })
            .await;
        assert!(!h.coordinator.engine().is_idle());

        h.coordinator
            .handle_peer_event(PeerEvent::StateChanged {
                peer_id: "p1".into(),
                state: ConnectionState::Disconnected,
            })
            .await;
        assert!(!h.coordinator.registry().contains("p1"));
        assert!(h.coordinator.engine().is_idle());
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn send_without_channel_reports_unavailable() {
        let mut h = harness();
        h.coordinator
            .handle_command(Command::Send {
                peer_id: "nobody".into(),
                files: vec![OutgoingFile::from_bytes("a", "", vec![1u8])],
            })
            .await;
        assert_eq!(
            h.gateway.notices(),
            vec![Notice::PeerUnavailable {
                peer_id: "nobody".into()
            }]
        );
    }

    #[tokio::test]
    async fn send_on_closed_channel_tears_peer_down() {
        let mut h = harness();
        h.coordinator
            .handle_relay(RelayResponse::Offer {
                peer_id: "p1".into(),
                name: "Brave Lynx".into(),
                device: "Linux".into(),
                discovery_mode: DiscoveryMode::Network,
            })
            .await;
        let peer = h.connector.peer("p1");
        peer.set_connection_state(ConnectionState::Connected);
        peer.channels()[0].set_open(false);

        h.coordinator
            .handle_command(Command::Send {
                peer_id: "p1".into(),
                files: vec![OutgoingFile::from_bytes("a", "", vec![1u8])],
            })
            .await;

        assert!(!h.coordinator.registry().contains("p1"));
        assert!(peer.channels()[0].text_types().is_empty());
        assert_eq!(
            h.gateway.notices(),
            vec![Notice::PeerUnavailable {
                peer_id: "p1".into()
            }]
        );
    }

    #[tokio::test]
    async fn commands_are_served_while_relay_connect_hangs() {
        // Accept the socket but never answer the WebSocket handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let Harness {
            coordinator, inbox, ..
        } = harness();
        let name = coordinator.name().to_string();
        let link = Arc::new(SignalingChannel::new(&format!("ws://{addr}")));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let sos = SignalOfStop::new();
        let session = tokio::spawn(coordinator.run(link.clone(), inbox, command_rx, sos.clone()));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let (reply, rx) = oneshot::channel();
        command_tx.send(Command::Identity { reply }).unwrap();
        let identity = tokio::time::timeout(std::time::Duration::from_secs(2), rx)
            .await
            .expect("session loop blocked on relay connect")
            .unwrap();
        assert_eq!(identity.name, name);
        assert!(!link.is_connected());

        sos.cancel();
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn send_over_open_channel_requests_share() {
        let mut h = harness();
        h.coordinator
            .handle_relay(RelayResponse::Offer {
                peer_id: "p1".into(),
                name: "Brave Lynx".into(),
                device: "Linux".into(),
                discovery_mode: DiscoveryMode::Network,
            })
            .await;
        let peer = h.connector.peer("p1");
        peer.set_connection_state(ConnectionState::Connected);

        h.coordinator
            .handle_command(Command::Send {
                peer_id: "p1".into(),
                files: vec![OutgoingFile::from_bytes("a.txt", "text/plain", b"hi".to_vec())],
            })
            .await;
        assert_eq!(peer.channels()[0].text_types(), vec!["REQUESTED_FILE_SHARE"]);
        assert!(h.coordinator.engine().outbound("p1").is_some());

        // Denial travels back as a notice.
        h.coordinator
            .handle_peer_event(PeerEvent::Message {
                peer_id: "p1".into(),
                frame: Frame::Text(ControlFrame::DeniedFileShare.to_json()),
            })
            .await;
        let event = h.inbox.transfer_events.recv().await.unwrap();
        h.coordinator.handle_transfer_event(event);
        assert!(matches!(h.app.try_recv(), Ok(TransferEvent::Denied { .. })));
        assert!(h.coordinator.engine().outbound("p1").is_none());
        assert!(h.coordinator.registry().contains("p1"));
        assert_eq!(
            h.gateway.notices(),
            vec![Notice::ShareDenied {
                peer_id: "p1".into()
            }]
        );
    }

    #[tokio::test]
    async fn pairing_outcomes_become_notices() {
        let mut h = harness();
        h.coordinator
            .handle_relay(RelayResponse::PeerConnect {
                peer_id: None,
                is_connected: false,
            })
            .await;
        h.coordinator
            .handle_relay(RelayResponse::PeerConnect {
                peer_id: Some("p1".into()),
                is_connected: true,
            })
            .await;
        assert_eq!(
            h.gateway.notices(),
            vec![
                Notice::PeerNotFound,
                Notice::PeerLinked {
                    peer_id: Some("p1".into())
                }
            ]
        );
    }

    #[tokio::test]
    async fn settings_changes_reach_relay_and_store() {
        let mut h = harness();
        h.coordinator
            .handle_command(Command::Rename {
                name: "  New Name ".into(),
            })
            .await;
        h.coordinator
            .handle_command(Command::SetMode(DiscoveryMode::Direct))
            .await;

        let sent = h.relay.take();
        assert_eq!(sent.len(), 2);
        assert!(matches!(
            &sent[1],
            RelayRequest::ChangeSettings { name, discovery_mode: DiscoveryMode::Direct } if name == "New Name"
        ));
        assert_eq!(h.store.name().as_deref(), Some("New Name"));
        assert_eq!(h.store.discovery_mode(), DiscoveryMode::Direct);

        h.store.add_linked_peer("p9");
        h.coordinator
            .handle_command(Command::Unlink {
                peer_id: "p9".into(),
            })
            .await;
        assert!(h.store.linked_peers().is_empty());

        let (reply, rx) = oneshot::channel();
        h.coordinator.handle_command(Command::Identity { reply }).await;
        assert_eq!(rx.await.unwrap().name, "New Name");
    }
}
