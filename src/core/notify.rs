//! Notification gateway: the single external resolver of share prompts and
//! the sink for user-facing notices.

use crate::core::transfer::FileMeta;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

/// An incoming file-share request awaiting the local user's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareRequest {
    pub request_id: Uuid,
    pub peer_id: String,
    /// Display name the sender announced.
    pub sender_name: String,
    pub files: Vec<FileMeta>,
}

impl ShareRequest {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Deny,
}

impl Decision {
    pub fn is_accept(self) -> bool {
        self == Self::Accept
    }
}

/// User-facing outcomes. Transport and negotiation errors never show up here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Relay identity assigned; the pairing code others can use to reach us.
    Connected { connection_id: Option<String> },
    PeerLinked { peer_id: Option<String> },
    PeerNotFound,
    ShareDenied { peer_id: String },
    TransferFinished { peer_id: String, files: usize },
    FileReceived { peer_id: String, name: String },
    PeerUnavailable { peer_id: String },
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected {
                connection_id: Some(code),
            } => write!(f, "Connected to P2P network (pairing code {code})"),
            Self::Connected { connection_id: None } => write!(f, "Connected to P2P network"),
            Self::PeerLinked { .. } => write!(f, "Connected with a peer"),
            Self::PeerNotFound => write!(f, "Wrong ID or peer is not online"),
            Self::ShareDenied { peer_id } => write!(f, "Peer {peer_id} denied the file share"),
            Self::TransferFinished { peer_id, files } => {
                write!(f, "Sent {files} file(s) to {peer_id}")
            }
            Self::FileReceived { peer_id, name } => write!(f, "Received {name} from {peer_id}"),
            Self::PeerUnavailable { peer_id } => write!(f, "Peer {peer_id} is not reachable"),
        }
    }
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// Resolves once the user has decided. Dropping the future abandons the
    /// prompt.
    async fn request(&self, request: ShareRequest) -> Decision;

    fn notify(&self, notice: Notice);
}

// ── Front-end bridge ─────────────────────────────────────────────────────────

pub enum GatewayEvent {
    Prompt {
        request: ShareRequest,
        reply: oneshot::Sender<Decision>,
    },
    Notice(Notice),
}

/// Forwards prompts and notices to a front-end over a channel.
///
/// A prompt whose reply is dropped, or that cannot be delivered, is denied.
pub struct ChannelGateway {
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl ChannelGateway {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationGateway for ChannelGateway {
    async fn request(&self, request: ShareRequest) -> Decision {
        let (reply, decision) = oneshot::channel();
        let request_id = request.request_id;
        if self.tx.send(GatewayEvent::Prompt { request, reply }).is_err() {
            debug!(event = "prompt_undeliverable", %request_id);
            return Decision::Deny;
        }
        decision.await.unwrap_or(Decision::Deny)
    }

    fn notify(&self, notice: Notice) {
        let _ = self.tx.send(GatewayEvent::Notice(notice));
    }
}

/// Answers every prompt the same way. Notices only go to the log.
pub struct AutoGateway {
    decision: Decision,
}

impl AutoGateway {
    pub fn accepting() -> Self {
        Self {
            decision: Decision::Accept,
        }
    }

    pub fn denying() -> Self {
        Self {
            decision: Decision::Deny,
        }
    }
}

#[async_trait]
impl NotificationGateway for AutoGateway {
    async fn request(&self, request: ShareRequest) -> Decision {
        info!(
            event = "share_auto_decided",
            peer = %request.peer_id,
            files = request.files.len(),
            decision = ?self.decision,
        );
        self.decision
    }

    fn notify(&self, notice: Notice) {
        info!(event = "notice", "{notice}");
    }
}
