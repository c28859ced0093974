//! TransferEngine: per-peer send and receive bookkeeping over one data
//! channel.
//!
//! # Protocol
//!
//! ```text
//! sender                                  receiver
//!   ── REQUESTED_FILE_SHARE{name, metadata} ──►  prompt user
//!   ◄── ACCEPTED_FILE_SHARE | DENIED_FILE_SHARE ──
//!   ── chunk, chunk, ..., EOF{name} ──►          file 1
//!   ── chunk, ..., EOF{name} ──►                 file 2 ...
//! ```
//!
//! Streaming runs in a spawned task per batch; it reports back through
//! [`TransferSignal`]s which the owner feeds into [`TransferEngine::handle_signal`],
//! so every mutation of the transfer tables happens on the owner's task.
//! Flow control is the channel's buffered amount: above one chunk the send
//! task waits for the drained signal.

mod frames;
mod reader;
mod state;

pub use frames::{ControlFrame, FileMeta};
pub use reader::{mime_for, spawn_reader, FileSource, OutgoingFile};
pub use state::{percent, Direction, InboundTransfer, OutboundTransfer};

use crate::core::config::{CHUNK_SIZE, MAX_PROTOCOL_VIOLATIONS};
use crate::core::connection::{DataChannel, Frame};
use crate::core::error::{PeerError, PeerResult};
use crate::core::notify::{NotificationGateway, ShareRequest};
use crate::utils::sos::SignalOfStop;
use bytes::Bytes;
use state::PendingRequest;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Events ───────────────────────────────────────────────────────────────────

/// Outcomes for the front-end.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Sending reports per file; receiving reports the whole batch.
    Progress {
        peer_id: String,
        direction: Direction,
        file: String,
        transferred: u64,
        total: u64,
        percent: u8,
    },
    FileReceived {
        peer_id: String,
        name: String,
        mime: String,
        data: Bytes,
    },
    SendComplete {
        peer_id: String,
        files: usize,
    },
    ReceiveComplete {
        peer_id: String,
    },
    Denied {
        peer_id: String,
    },
    Cancelled {
        peer_id: String,
        direction: Direction,
    },
    Failed {
        peer_id: String,
        direction: Direction,
        reason: String,
    },
}

#[derive(Debug)]
pub enum SendOutcome {
    Completed,
    Cancelled,
    Failed(PeerError),
}

/// Reports from spawned tasks back to the engine's owner.
#[derive(Debug)]
pub enum TransferSignal {
    Sent {
        peer_id: String,
        batch: Uuid,
        file_index: usize,
        bytes: u64,
    },
    SendFinished {
        peer_id: String,
        batch: Uuid,
        outcome: SendOutcome,
    },
    Decision {
        peer_id: String,
        request_id: Uuid,
        accepted: bool,
    },
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct TransferEngine {
    gateway: Arc<dyn NotificationGateway>,
    signals: mpsc::UnboundedSender<TransferSignal>,
    events: mpsc::UnboundedSender<TransferEvent>,
    outbound: HashMap<String, OutboundTransfer>,
    pending: HashMap<String, PendingRequest>,
    inbound: HashMap<String, InboundTransfer>,
    violations: HashMap<String, u32>,
}

impl TransferEngine {
    pub fn new(
        gateway: Arc<dyn NotificationGateway>,
        signals: mpsc::UnboundedSender<TransferSignal>,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Self {
        Self {
            gateway,
            signals,
            events,
            outbound: HashMap::new(),
            pending: HashMap::new(),
            inbound: HashMap::new(),
            violations: HashMap::new(),
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Announce a batch to the peer. Bytes only flow after it accepts.
    pub async fn request_share(
        &mut self,
        peer_id: &str,
        channel: Arc<dyn DataChannel>,
        sender_name: &str,
        files: Vec<OutgoingFile>,
    ) -> PeerResult<Uuid> {
        if self.outbound.contains_key(peer_id) {
            return Err(PeerError::Busy {
                peer_id: peer_id.to_string(),
            });
        }
        if files.is_empty() {
            return Err(anyhow::anyhow!("nothing to send").into());
        }

        let request = ControlFrame::RequestedFileShare {
            name: sender_name.to_string(),
            metadata: files.iter().map(OutgoingFile::meta).collect(),
        };
        channel
            .send_text(request.to_json())
            .await
            .map_err(|e| {
                debug!(event = "share_request_send_failure", peer = %peer_id, error = %e);
                PeerError::channel_unavailable(peer_id)
            })?;

        let batch = Uuid::new_v4();
        info!(
            event = "share_requested",
            peer = %peer_id,
            %batch,
            files = files.len(),
            "Requested file share"
        );
        self.outbound
            .insert(peer_id.to_string(), OutboundTransfer::new(batch, files, channel));
        Ok(batch)
    }

    /// Drop the outbound batch for this peer. Nothing is sent to the peer.
    pub fn cancel_outbound(&mut self, peer_id: &str) -> bool {
        let Some(transfer) = self.outbound.remove(peer_id) else {
            return false;
        };
        transfer.stop.cancel();
        info!(
            event = "send_cancelled",
            peer = %peer_id,
            batch = %transfer.batch,
            sent = transfer.sent(),
            total = transfer.total()
        );
        self.emit(TransferEvent::Cancelled {
            peer_id: peer_id.to_string(),
            direction: Direction::Send,
        });
        true
    }

    fn start_streaming(&mut self, peer_id: &str) -> PeerResult<()> {
        let Some(transfer) = self.outbound.get_mut(peer_id) else {
            return self.violation(peer_id, "accept without a pending request");
        };
        let Some(files) = transfer.queued.take() else {
            return self.violation(peer_id, "duplicate accept");
        };

        info!(event = "share_accepted", peer = %peer_id, batch = %transfer.batch);
        let task = SendTask {
            peer_id: peer_id.to_string(),
            batch: transfer.batch,
            channel: transfer.channel.clone(),
            stop: transfer.stop.clone(),
            signals: self.signals.clone(),
        };
        tokio::spawn(task.run(files));
        Ok(())
    }

    fn on_denied(&mut self, peer_id: &str) -> PeerResult<()> {
        let awaiting = self
            .outbound
            .get(peer_id)
            .is_some_and(|t| !t.is_streaming());
        if !awaiting {
            return self.violation(peer_id, "deny without a pending request");
        }
        if let Some(transfer) = self.outbound.remove(peer_id) {
            transfer.stop.cancel();
            info!(event = "share_denied", peer = %peer_id, batch = %transfer.batch);
        }
        self.emit(TransferEvent::Denied {
            peer_id: peer_id.to_string(),
        });
        Ok(())
    }

    // ── Receiving ────────────────────────────────────────────────────────

    /// Process one frame from the peer's channel. `Err` means the peer must
    /// be torn down.
    pub async fn handle_frame(
        &mut self,
        peer_id: &str,
        channel: &Arc<dyn DataChannel>,
        frame: Frame,
    ) -> PeerResult<()> {
        match frame {
            Frame::Binary(chunk) => self.on_chunk(peer_id, &chunk),
            Frame::Text(text) => match ControlFrame::parse(&text) {
                Ok(ControlFrame::RequestedFileShare { name, metadata }) => {
                    self.on_request(peer_id, channel, name, metadata)
                }
                Ok(ControlFrame::AcceptedFileShare) => self.start_streaming(peer_id),
                Ok(ControlFrame::DeniedFileShare) => self.on_denied(peer_id),
                Ok(ControlFrame::Eof { name }) => self.on_eof(peer_id, &name),
                Err(e) => {
                    debug!(event = "control_frame_invalid", peer = %peer_id, error = %e, raw = %text);
                    self.violation(peer_id, "unrecognised control frame")
                }
            },
        }
    }

    fn on_request(
        &mut self,
        peer_id: &str,
        channel: &Arc<dyn DataChannel>,
        sender_name: String,
        files: Vec<FileMeta>,
    ) -> PeerResult<()> {
        if self.pending.contains_key(peer_id) || self.inbound.contains_key(peer_id) {
            return self.violation(peer_id, "share request while another is open");
        }

        let request_id = Uuid::new_v4();
        info!(
            event = "share_request_received",
            peer = %peer_id,
            %request_id,
            from = %sender_name,
            files = files.len(),
            "Peer wants to send files"
        );

        let request = ShareRequest {
            request_id,
            peer_id: peer_id.to_string(),
            sender_name: sender_name.clone(),
            files: files.clone(),
        };
        let gateway = self.gateway.clone();
        let signals = self.signals.clone();
        let peer = peer_id.to_string();
        let prompt = tokio::spawn(async move {
            let decision = gateway.request(request).await;
            let _ = signals.send(TransferSignal::Decision {
                peer_id: peer,
                request_id,
                accepted: decision.is_accept(),
            });
        });

        self.pending.insert(
            peer_id.to_string(),
            PendingRequest {
                request_id,
                sender_name,
                files,
                channel: channel.clone(),
                prompt,
            },
        );
        Ok(())
    }

    /// Apply the user's decision. Decisions for requests that no longer
    /// exist are ignored.
    pub async fn resolve(&mut self, peer_id: &str, request_id: Uuid, accepted: bool) -> PeerResult<()> {
        match self.pending.get(peer_id) {
            Some(p) if p.request_id == request_id => {}
            _ => {
                debug!(event = "decision_stale", peer = %peer_id, %request_id);
                return Ok(());
            }
        }
        let Some(pending) = self.pending.remove(peer_id) else {
            return Ok(());
        };

        let reply = if accepted {
            ControlFrame::AcceptedFileShare
        } else {
            ControlFrame::DeniedFileShare
        };
        pending
            .channel
            .send_text(reply.to_json())
            .await
            .map_err(|_| PeerError::channel_unavailable(peer_id))?;

        if accepted {
            info!(event = "share_accept", peer = %peer_id, %request_id, from = %pending.sender_name);
            self.inbound
                .insert(peer_id.to_string(), InboundTransfer::new(request_id, pending.files));
        } else {
            info!(event = "share_deny", peer = %peer_id, %request_id);
        }
        Ok(())
    }

    fn on_chunk(&mut self, peer_id: &str, chunk: &[u8]) -> PeerResult<()> {
        let Some(batch) = self.inbound.get_mut(peer_id) else {
            return self.violation(peer_id, "chunk without an accepted share");
        };
        let Some(file) = batch.current_mut() else {
            return self.violation(peer_id, "chunk after every file completed");
        };
        if !file.append(chunk) {
            let reason = format!(
                "chunk of {} bytes overflows {} ({}/{} received)",
                chunk.len(),
                file.meta.name,
                file.received(),
                file.meta.size
            );
            return self.violation(peer_id, reason);
        }

        let name = file.meta.name.clone();
        let (transferred, total) = (batch.received(), batch.total());
        self.emit(TransferEvent::Progress {
            peer_id: peer_id.to_string(),
            direction: Direction::Receive,
            file: name,
            transferred,
            total,
            percent: percent(transferred, total),
        });
        Ok(())
    }

    fn on_eof(&mut self, peer_id: &str, name: &str) -> PeerResult<()> {
        let Some(batch) = self.inbound.get_mut(peer_id) else {
            return self.violation(peer_id, "EOF without an accepted share");
        };
        let Some((file, ambiguous)) = batch.take_finished(name) else {
            return self.violation(peer_id, format!("EOF for {name} before any file completed"));
        };
        if ambiguous {
            warn!(
                event = "eof_ambiguous",
                peer = %peer_id,
                eof = %name,
                picked = %file.meta.name,
                "EOF did not identify a single finished file"
            );
        }
        let done = batch.is_done();

        info!(event = "file_received", peer = %peer_id, name = %file.meta.name, size = file.meta.size);
        let meta = file.meta.clone();
        self.emit(TransferEvent::FileReceived {
            peer_id: peer_id.to_string(),
            name: meta.name,
            mime: meta.mime,
            data: file.into_bytes(),
        });

        if done {
            self.inbound.remove(peer_id);
            info!(event = "receive_complete", peer = %peer_id);
            self.emit(TransferEvent::ReceiveComplete {
                peer_id: peer_id.to_string(),
            });
        }
        Ok(())
    }

    // ── Task reports ─────────────────────────────────────────────────────

    pub async fn handle_signal(&mut self, signal: TransferSignal) -> PeerResult<()> {
        match signal {
            TransferSignal::Sent {
                peer_id,
                batch,
                file_index,
                bytes,
            } => {
                let Some(transfer) = self.outbound.get_mut(&peer_id).filter(|t| t.batch == batch)
                else {
                    return Ok(());
                };
                let Some(file) = transfer.record(file_index, bytes) else {
                    return Ok(());
                };
                let event = TransferEvent::Progress {
                    peer_id,
                    direction: Direction::Send,
                    file: file.name.clone(),
                    transferred: file.sent,
                    total: file.size,
                    percent: percent(file.sent, file.size),
                };
                self.emit(event);
                Ok(())
            }
            TransferSignal::SendFinished {
                peer_id,
                batch,
                outcome,
            } => self.on_send_finished(&peer_id, batch, outcome),
            TransferSignal::Decision {
                peer_id,
                request_id,
                accepted,
            } => self.resolve(&peer_id, request_id, accepted).await,
        }
    }

    fn on_send_finished(&mut self, peer_id: &str, batch: Uuid, outcome: SendOutcome) -> PeerResult<()> {
        if !self.outbound.get(peer_id).is_some_and(|t| t.batch == batch) {
            debug!(event = "send_finished_stale", peer = %peer_id, %batch);
            return Ok(());
        }
        let Some(transfer) = self.outbound.remove(peer_id) else {
            return Ok(());
        };

        match outcome {
            SendOutcome::Completed => {
                info!(
                    event = "send_complete",
                    peer = %peer_id,
                    %batch,
                    files = transfer.files.len(),
                    bytes = transfer.total()
                );
                self.emit(TransferEvent::SendComplete {
                    peer_id: peer_id.to_string(),
                    files: transfer.files.len(),
                });
                Ok(())
            }
            SendOutcome::Cancelled => {
                self.emit(TransferEvent::Cancelled {
                    peer_id: peer_id.to_string(),
                    direction: Direction::Send,
                });
                Ok(())
            }
            SendOutcome::Failed(e) => {
                warn!(event = "send_failed", peer = %peer_id, %batch, error = %e);
                self.emit(TransferEvent::Failed {
                    peer_id: peer_id.to_string(),
                    direction: Direction::Send,
                    reason: e.to_string(),
                });
                if e.is_fatal_for_peer() {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Drop every transfer with this peer. Buffers are discarded at once.
    pub fn abandon(&mut self, peer_id: &str) {
        self.violations.remove(peer_id);

        if let Some(transfer) = self.outbound.remove(peer_id) {
            transfer.stop.cancel();
            self.emit(TransferEvent::Cancelled {
                peer_id: peer_id.to_string(),
                direction: Direction::Send,
            });
        }
        if let Some(pending) = self.pending.remove(peer_id) {
            pending.prompt.abort();
        }
        if self.inbound.remove(peer_id).is_some() {
            self.emit(TransferEvent::Cancelled {
                peer_id: peer_id.to_string(),
                direction: Direction::Receive,
            });
        }
    }

    pub fn abandon_all(&mut self) {
        let mut peers: Vec<String> = self.outbound.keys().cloned().collect();
        peers.extend(self.pending.keys().cloned());
        peers.extend(self.inbound.keys().cloned());
        peers.sort();
        peers.dedup();
        for peer in peers {
            self.abandon(&peer);
        }
        self.violations.clear();
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn outbound(&self, peer_id: &str) -> Option<&OutboundTransfer> {
        self.outbound.get(peer_id)
    }

    pub fn inbound(&self, peer_id: &str) -> Option<&InboundTransfer> {
        self.inbound.get(peer_id)
    }

    pub fn has_pending_request(&self, peer_id: &str) -> bool {
        self.pending.contains_key(peer_id)
    }

    pub fn is_idle(&self) -> bool {
        self.outbound.is_empty() && self.pending.is_empty() && self.inbound.is_empty()
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    /// Count a violation; the offending frame is already dropped. Escalates
    /// once the peer reaches the limit.
    fn violation(&mut self, peer_id: &str, reason: impl Into<String>) -> PeerResult<()> {
        let reason = reason.into();
        let count = self.violations.entry(peer_id.to_string()).or_insert(0);
        *count += 1;
        warn!(
            event = "protocol_violation",
            peer = %peer_id,
            count = *count,
            reason = %reason,
            "Dropped frame from peer"
        );
        if *count >= MAX_PROTOCOL_VIOLATIONS {
            Err(PeerError::violation(peer_id, reason))
        } else {
            Ok(())
        }
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

// ── Send task ────────────────────────────────────────────────────────────────

struct SendTask {
    peer_id: String,
    batch: Uuid,
    channel: Arc<dyn DataChannel>,
    stop: SignalOfStop,
    signals: mpsc::UnboundedSender<TransferSignal>,
}

impl SendTask {
    async fn run(self, files: Vec<OutgoingFile>) {
        let outcome = match self.stream(files).await {
            Ok(true) => SendOutcome::Completed,
            Ok(false) => SendOutcome::Cancelled,
            Err(e) => SendOutcome::Failed(e),
        };
        debug!(event = "send_task_exit", peer = %self.peer_id, batch = %self.batch, ?outcome);
        let _ = self.signals.send(TransferSignal::SendFinished {
            peer_id: self.peer_id,
            batch: self.batch,
            outcome,
        });
    }

    /// `Ok(false)` when stopped before finishing.
    async fn stream(&self, files: Vec<OutgoingFile>) -> PeerResult<bool> {
        for (file_index, file) in files.into_iter().enumerate() {
            debug!(event = "file_send_start", peer = %self.peer_id, name = %file.name, size = file.size);
            let (mut chunks, reader) = spawn_reader(file.source, file.size, CHUNK_SIZE);

            loop {
                let Some(next) = self.stop.select(chunks.recv()).await else {
                    reader.abort();
                    return Ok(false);
                };
                let Some(chunk) = next else { break };

                if !self.wait_for_room().await {
                    reader.abort();
                    return Ok(false);
                }

                let bytes = chunk.len() as u64;
                self.channel
                    .send_binary(chunk)
                    .await
                    .map_err(|_| PeerError::channel_unavailable(&self.peer_id))?;
                let _ = self.signals.send(TransferSignal::Sent {
                    peer_id: self.peer_id.clone(),
                    batch: self.batch,
                    file_index,
                    bytes,
                });
            }

            match reader.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(anyhow::anyhow!("reader task failed: {e}").into()),
            }

            if self.stop.cancelled() {
                return Ok(false);
            }
            let eof = ControlFrame::Eof { name: file.name };
            self.channel
                .send_text(eof.to_json())
                .await
                .map_err(|_| PeerError::channel_unavailable(&self.peer_id))?;
        }
        Ok(true)
    }

    /// Hold off while more than a chunk is queued on the channel. `false`
    /// when stopped while waiting.
    async fn wait_for_room(&self) -> bool {
        while self.channel.buffered_amount().await > CHUNK_SIZE {
            if self.stop.select(self.channel.drained()).await.is_none() {
                return false;
            }
        }
        !self.stop.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::testing::{open_channel, MockChannel};
    use crate::core::notify::{AutoGateway, ChannelGateway, Decision, GatewayEvent};
    use sha3::{Digest, Sha3_256};
    use std::time::Duration;

    struct Side {
        engine: TransferEngine,
        signals: mpsc::UnboundedReceiver<TransferSignal>,
        events: mpsc::UnboundedReceiver<TransferEvent>,
        mock: Arc<MockChannel>,
        channel: Arc<dyn DataChannel>,
    }

    fn side(gateway: Arc<dyn NotificationGateway>) -> Side {
        let (stx, signals) = mpsc::unbounded_channel();
        let (etx, events) = mpsc::unbounded_channel();
        let mock = open_channel();
        let channel: Arc<dyn DataChannel> = mock.clone();
        Side {
            engine: TransferEngine::new(gateway, stx, etx),
            signals,
            events,
            mock,
            channel,
        }
    }

    impl Side {
        /// Feed task reports until one matches `stop_when`.
        async fn pump_until(&mut self, stop_when: impl Fn(&TransferSignal) -> bool) {
            loop {
                let signal = tokio::time::timeout(Duration::from_secs(5), self.signals.recv())
                    .await
                    .expect("signal timeout")
                    .expect("signal channel closed");
                let last = stop_when(&signal);
                self.engine.handle_signal(signal).await.unwrap();
                if last {
                    return;
                }
            }
        }

        fn drain_events(&mut self) -> Vec<TransferEvent> {
            let mut out = Vec::new();
            while let Ok(e) = self.events.try_recv() {
                out.push(e);
            }
            out
        }

        /// Deliver frames `from..` sent by `other` into this side.
        async fn deliver(&mut self, other: &Side, from: usize) -> usize {
            let frames = other.mock.sent();
            for frame in frames[from..].iter().cloned() {
                self.engine
                    .handle_frame("sender", &self.channel, frame)
                    .await
                    .unwrap();
            }
            frames.len()
        }
    }

    fn finished(s: &TransferSignal) -> bool {
        matches!(s, TransferSignal::SendFinished { .. })
    }

    fn decided(s: &TransferSignal) -> bool {
        matches!(s, TransferSignal::Decision { .. })
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// Run request → accept → stream → EOF between two engines.
    async fn round_trip(files: Vec<OutgoingFile>) -> (Side, Side) {
        let mut tx = side(Arc::new(AutoGateway::accepting()));
        let mut rx = side(Arc::new(AutoGateway::accepting()));

        tx.engine
            .request_share("receiver", tx.channel.clone(), "Calm Heron", files)
            .await
            .unwrap();
        let seen = rx.deliver(&tx, 0).await;
        rx.pump_until(decided).await;

        for frame in rx.mock.sent() {
            tx.engine
                .handle_frame("receiver", &tx.channel, frame)
                .await
                .unwrap();
        }
        tx.pump_until(finished).await;
        rx.deliver(&tx, seen).await;
        (tx, rx)
    }

    #[tokio::test]
    async fn chunk_count_and_sizes() {
        let size = CHUNK_SIZE * 2 + 17;
        let (tx, _rx) =
            round_trip(vec![OutgoingFile::from_bytes("a.bin", "", pattern(size))]).await;

        let binaries = tx.mock.binaries();
        assert_eq!(binaries.len(), size.div_ceil(CHUNK_SIZE));
        assert_eq!(binaries.iter().map(Bytes::len).sum::<usize>(), size);
        assert!(binaries[..binaries.len() - 1].iter().all(|b| b.len() == CHUNK_SIZE));
        assert_eq!(
            tx.mock.text_types(),
            vec!["REQUESTED_FILE_SHARE", "EOF"]
        );
    }

    #[tokio::test]
    async fn round_trip_preserves_bytes() {
        let sizes = [0, 1, CHUNK_SIZE, CHUNK_SIZE * 7 / 2];
        let files: Vec<OutgoingFile> = sizes
            .iter()
            .enumerate()
            .map(|(i, &s)| OutgoingFile::from_bytes(&format!("f{i}.bin"), "application/octet-stream", pattern(s)))
            .collect();
        let expected: Vec<_> = sizes.iter().map(|&s| Sha3_256::digest(pattern(s))).collect();

        let (mut tx, mut rx) = round_trip(files).await;

        let received: Vec<(String, Bytes)> = rx
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                TransferEvent::FileReceived { name, data, .. } => Some((name, data)),
                _ => None,
            })
            .collect();
        assert_eq!(received.len(), sizes.len());
        for (i, (name, data)) in received.iter().enumerate() {
            assert_eq!(name, &format!("f{i}.bin"));
            assert_eq!(Sha3_256::digest(data), expected[i]);
        }

        assert!(rx.engine.is_idle());
        assert!(tx.engine.is_idle());
        assert!(tx
            .drain_events()
            .iter()
            .any(|e| matches!(e, TransferEvent::SendComplete { files: 4, .. })));
    }

    #[tokio::test]
    async fn denial_sends_no_bytes() {
        let mut tx = side(Arc::new(AutoGateway::accepting()));
        let mut rx = side(Arc::new(AutoGateway::denying()));

        tx.engine
            .request_share("receiver", tx.channel.clone(), "Calm Heron", vec![
                OutgoingFile::from_bytes("a", "", pattern(1000)),
            ])
            .await
            .unwrap();
        rx.deliver(&tx, 0).await;
        rx.pump_until(decided).await;
        assert_eq!(rx.mock.text_types(), vec!["DENIED_FILE_SHARE"]);
        assert!(rx.engine.inbound("sender").is_none());

        for frame in rx.mock.sent() {
            tx.engine
                .handle_frame("receiver", &tx.channel, frame)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(tx.mock.binaries().is_empty());
        assert!(tx.engine.outbound("receiver").is_none());
        assert!(tx
            .drain_events()
            .iter()
            .any(|e| matches!(e, TransferEvent::Denied { .. })));
    }

    #[tokio::test]
    async fn second_batch_is_busy() {
        let mut tx = side(Arc::new(AutoGateway::accepting()));
        let file = || vec![OutgoingFile::from_bytes("a", "", vec![1u8; 4])];
        tx.engine
            .request_share("p", tx.channel.clone(), "me", file())
            .await
            .unwrap();
        let err = tx
            .engine
            .request_share("p", tx.channel.clone(), "me", file())
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Busy { .. }));
    }

    #[tokio::test]
    async fn closed_channel_is_unavailable() {
        let mut tx = side(Arc::new(AutoGateway::accepting()));
        tx.mock.set_open(false);
        let err = tx
            .engine
            .request_share("p", tx.channel.clone(), "me", vec![OutgoingFile::from_bytes("a", "", vec![1u8])])
            .await
            .unwrap_err();
        assert!(err.is_fatal_for_peer());
        assert!(tx.engine.outbound("p").is_none());
    }

    #[tokio::test]
    async fn backpressure_waits_for_drain() {
        let mut tx = side(Arc::new(AutoGateway::accepting()));
        tx.mock.set_accumulate(true);
        let size = CHUNK_SIZE * 4;
        tx.engine
            .request_share("p", tx.channel.clone(), "me", vec![OutgoingFile::from_bytes("big", "", pattern(size))])
            .await
            .unwrap();
        tx.engine
            .handle_frame("p", &tx.channel, Frame::Text(ControlFrame::AcceptedFileShare.to_json()))
            .await
            .unwrap();

        // Two chunks fit before the buffered amount crosses the threshold.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tx.mock.binaries().len(), 2);

        tx.mock.drain();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tx.mock.binaries().len(), 4);

        tx.pump_until(finished).await;
        let all: Vec<u8> = tx.mock.binaries().iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(all, pattern(size));
    }

    #[tokio::test]
    async fn cancel_stops_stream_without_notifying_peer() {
        let mut tx = side(Arc::new(AutoGateway::accepting()));
        tx.mock.set_accumulate(true);
        tx.engine
            .request_share("p", tx.channel.clone(), "me", vec![OutgoingFile::from_bytes("big", "", pattern(CHUNK_SIZE * 6))])
            .await
            .unwrap();
        tx.engine
            .handle_frame("p", &tx.channel, Frame::Text(ControlFrame::AcceptedFileShare.to_json()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(tx.engine.cancel_outbound("p"));
        assert!(!tx.engine.cancel_outbound("p"));
        tx.mock.drain();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(tx.mock.binaries().len(), 2);
        assert_eq!(tx.mock.text_types(), vec!["REQUESTED_FILE_SHARE"]);
        assert!(tx.engine.outbound("p").is_none());
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_bounded() {
        let files = vec![
            OutgoingFile::from_bytes("a", "", pattern(CHUNK_SIZE * 2 + 5)),
            OutgoingFile::from_bytes("b", "", pattern(CHUNK_SIZE + 1)),
        ];
        let (mut tx, mut rx) = round_trip(files).await;

        let mut last = 0;
        for event in rx.drain_events() {
            if let TransferEvent::Progress {
                transferred, total, ..
            } = event
            {
                assert!(transferred >= last);
                assert!(transferred <= total);
                last = transferred;
            }
        }
        assert_eq!(last, (CHUNK_SIZE * 3 + 6) as u64);

        let mut per_file: HashMap<String, u64> = HashMap::new();
        for event in tx.drain_events() {
            if let TransferEvent::Progress {
                file,
                transferred,
                total,
                percent,
                ..
            } = event
            {
                let prev = per_file.insert(file, transferred).unwrap_or(0);
                assert!(transferred >= prev);
                assert!(transferred <= total);
                assert!(percent <= 100);
            }
        }
        assert_eq!(per_file["b"], (CHUNK_SIZE + 1) as u64);
    }

    #[tokio::test]
    async fn overflow_and_stray_frames_escalate() {
        let mut rx = side(Arc::new(AutoGateway::accepting()));
        let request = ControlFrame::RequestedFileShare {
            name: "x".into(),
            metadata: vec![FileMeta::new("a", 2, "")],
        };
        rx.engine
            .handle_frame("sender", &rx.channel, Frame::Text(request.to_json()))
            .await
            .unwrap();
        rx.pump_until(decided).await;

        // Overflowing chunk is dropped, the file keeps its bytes.
        rx.engine
            .handle_frame("sender", &rx.channel, Frame::Binary(Bytes::from_static(&[1, 2, 3])))
            .await
            .unwrap();
        assert_eq!(rx.engine.inbound("sender").unwrap().received(), 0);

        // Second request while receiving.
        rx.engine
            .handle_frame("sender", &rx.channel, Frame::Text(request.to_json()))
            .await
            .unwrap();

        let err = rx
            .engine
            .handle_frame("sender", &rx.channel, Frame::Text("garbage".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::ProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn prompt_resolves_once_and_ignores_stale_ids() {
        let (gateway, mut prompts) = ChannelGateway::new();
        let mut rx = side(Arc::new(gateway));
        let request = ControlFrame::RequestedFileShare {
            name: "x".into(),
            metadata: vec![FileMeta::new("a", 1, "")],
        };
        rx.engine
            .handle_frame("sender", &rx.channel, Frame::Text(request.to_json()))
            .await
            .unwrap();
        assert!(rx.engine.has_pending_request("sender"));

        let Some(GatewayEvent::Prompt { request, reply }) = prompts.recv().await else {
            panic!("expected prompt");
        };
        assert_eq!(request.sender_name, "x");

        rx.engine
            .resolve("sender", Uuid::new_v4(), true)
            .await
            .unwrap();
        assert!(rx.engine.has_pending_request("sender"));

        reply.send(Decision::Accept).unwrap();
        rx.pump_until(decided).await;
        assert!(!rx.engine.has_pending_request("sender"));
        assert!(rx.engine.inbound("sender").is_some());

        // Replaying the same decision changes nothing.
        rx.engine
            .resolve("sender", request.request_id, false)
            .await
            .unwrap();
        assert_eq!(rx.mock.text_types(), vec!["ACCEPTED_FILE_SHARE"]);
    }

    #[tokio::test]
    async fn abandon_clears_everything() {
        let (gateway, _prompts) = ChannelGateway::new();
        let mut side = side(Arc::new(gateway));
        side.engine
            .request_share("p", side.channel.clone(), "me", vec![OutgoingFile::from_bytes("a", "", vec![1u8])])
            .await
            .unwrap();
        let request = ControlFrame::RequestedFileShare {
            name: "p".into(),
            metadata: vec![FileMeta::new("b", 1, "")],
        };
        side.engine
            .handle_frame("p", &side.channel, Frame::Text(request.to_json()))
            .await
            .unwrap();
        assert!(!side.engine.is_idle());

        side.engine.abandon("p");
        assert!(side.engine.is_idle());
        assert!(side
            .drain_events()
            .iter()
            .any(|e| matches!(e, TransferEvent::Cancelled { direction: Direction::Send, .. })));

        side.engine.abandon_all();
        assert!(side.engine.is_idle());
    }
}
