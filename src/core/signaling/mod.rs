//! Relay link: one WebSocket carrying JSON text frames.
//!
//! `connect` spawns a writer task draining an unbounded queue into the
//! socket and a reader task decoding inbound frames. Both report through the
//! caller's `SignalEvent` channel; when either side ends, exactly one
//! `Disconnected` status is emitted. Reconnection is the caller's business.

mod messages;

pub use messages::{DiscoveryMode, RelayRequest, RelayResponse, RelaySender};

use crate::core::config::RELAY_CONNECT_TIMEOUT;
use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
    /// A connect attempt failed before the socket opened.
    Unreachable,
}

#[derive(Debug)]
pub enum SignalEvent {
    Status(LinkStatus),
    Message(RelayResponse),
}

/// Queue of the current link, tagged with its generation so a dying link
/// never clears its successor's queue.
type Outgoing = Arc<Mutex<Option<(u64, mpsc::UnboundedSender<String>)>>>;

pub struct SignalingChannel {
    url: String,
    outgoing: Outgoing,
    generation: AtomicU64,
}

impl SignalingChannel {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            outgoing: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    /// Open the relay socket. On success `Connected` has already been queued
    /// on `events`; a later `Disconnected` marks the end of this link.
    pub async fn connect(&self, events: mpsc::UnboundedSender<SignalEvent>) -> Result<()> {
        info!(event = "relay_connecting", url = %self.url, "Connecting to relay");

        let (ws, _) = tokio::time::timeout(RELAY_CONNECT_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| anyhow!("relay connect timed out after {:?}", RELAY_CONNECT_TIMEOUT))?
            .with_context(|| format!("failed to connect to relay {}", self.url))?;

        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut slot) = self.outgoing.lock() {
            *slot = Some((generation, tx));
        }

        info!(event = "relay_connected", url = %self.url, "Connected to relay");
        let _ = events.send(SignalEvent::Status(LinkStatus::Connected));

        let ended = Arc::new(AtomicBool::new(false));

        // Writer
        {
            let events = events.clone();
            let ended = ended.clone();
            let outgoing = self.outgoing.clone();
            tokio::spawn(async move {
                while let Some(text) = rx.recv().await {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        error!(event = "relay_send_failure", error = %e, "Failed to write to relay");
                        break;
                    }
                }
                clear(&outgoing, Some(generation));
                let _ = write.close().await;
                report_down(&ended, &events);
                debug!(event = "relay_writer_exit");
            });
        }

        // Reader
        {
            let outgoing = self.outgoing.clone();
            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            if let Some(response) = decode(&text) {
                                if events.send(SignalEvent::Message(response)).is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            info!(event = "relay_closed", ?frame, "Relay closed the connection");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(event = "relay_read_failure", error = %e, "Relay connection error");
                            break;
                        }
                    }
                }
                // Dropping the sender stops the writer too.
                clear(&outgoing, Some(generation));
                report_down(&ended, &events);
                debug!(event = "relay_reader_exit");
            });
        }

        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.outgoing
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Drop the outgoing queue; the writer closes the socket.
    pub fn close(&self) {
        clear(&self.outgoing, None);
    }
}

impl RelaySender for SignalingChannel {
    fn send(&self, request: RelayRequest) {
        let kind = request.kind();
        let text = match serde_json::to_string(&request) {
            Ok(text) => text,
            Err(e) => {
                error!(event = "relay_encode_failure", kind, error = %e);
                return;
            }
        };

        let delivered = self
            .outgoing
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|(_, tx)| tx.send(text).is_ok()))
            .unwrap_or(false);

        if delivered {
            debug!(event = "relay_send", kind);
        } else {
            debug!(event = "relay_send_dropped", kind, "Relay link down, request dropped");
        }
    }
}

/// Drop the queue if it still belongs to `generation` (any, when `None`).
fn clear(outgoing: &Outgoing, generation: Option<u64>) {
    if let Ok(mut slot) = outgoing.lock() {
        let owned = match (slot.as_ref(), generation) {
            (Some((current, _)), Some(g)) => *current == g,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if owned {
            slot.take();
        }
    }
}

fn report_down(ended: &AtomicBool, events: &mpsc::UnboundedSender<SignalEvent>) {
    if !ended.swap(true, Ordering::SeqCst) {
        let _ = events.send(SignalEvent::Status(LinkStatus::Disconnected));
    }
}

/// Parse one relay frame. Malformed frames and unknown types are dropped.
fn decode(text: &str) -> Option<RelayResponse> {
    match serde_json::from_str::<RelayResponse>(text) {
        Ok(RelayResponse::Unknown) => {
            debug!(event = "relay_unknown_type", raw = %text, "Dropped unknown relay message");
            None
        }
        Ok(response) => Some(response),
        Err(e) => {
            warn!(event = "relay_decode_failure", error = %e, "Dropped malformed relay message");
            None
        }
    }
}
