//! Per-peer transfer records owned by the engine.

use super::frames::FileMeta;
use super::reader::OutgoingFile;
use crate::core::config::MAX_PREALLOCATED_BUFFER;
use crate::core::connection::DataChannel;
use crate::utils::sos::SignalOfStop;
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Rounded percentage; an empty total counts as done.
pub fn percent(transferred: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (transferred as u128 * 100 + total as u128 / 2) / total as u128;
    pct.min(100) as u8
}

// ── Outbound ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SentFile {
    pub name: String,
    pub size: u64,
    pub sent: u64,
}

impl SentFile {
    pub fn is_complete(&self) -> bool {
        self.sent >= self.size
    }
}

pub struct OutboundTransfer {
    pub batch: Uuid,
    pub files: Vec<SentFile>,
    /// Sources, taken when the peer accepts and streaming starts.
    pub(super) queued: Option<Vec<OutgoingFile>>,
    pub(super) channel: Arc<dyn DataChannel>,
    pub(super) stop: SignalOfStop,
}

impl OutboundTransfer {
    pub fn new(batch: Uuid, files: Vec<OutgoingFile>, channel: Arc<dyn DataChannel>) -> Self {
        Self {
            batch,
            files: files
                .iter()
                .map(|f| SentFile {
                    name: f.name.clone(),
                    size: f.size,
                    sent: 0,
                })
                .collect(),
            queued: Some(files),
            channel,
            stop: SignalOfStop::new(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.queued.is_none()
    }

    pub fn total(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn sent(&self) -> u64 {
        self.files.iter().map(|f| f.sent).sum()
    }

    /// Record bytes handed to the channel. Never exceeds the file size.
    pub fn record(&mut self, file_index: usize, bytes: u64) -> Option<&SentFile> {
        let file = self.files.get_mut(file_index)?;
        file.sent = (file.sent + bytes).min(file.size);
        Some(file)
    }
}

// ── Inbound ──────────────────────────────────────────────────────────────────

/// A share request surfaced to the user and not yet decided.
pub struct PendingRequest {
    pub request_id: Uuid,
    pub sender_name: String,
    pub files: Vec<FileMeta>,
    pub(super) channel: Arc<dyn DataChannel>,
    pub(super) prompt: JoinHandle<()>,
}

pub struct InboundFile {
    pub meta: FileMeta,
    buffer: Vec<u8>,
}

impl InboundFile {
    pub fn new(meta: FileMeta) -> Self {
        let capacity = (meta.size as usize).min(MAX_PREALLOCATED_BUFFER);
        Self {
            meta,
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn received(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.received() >= self.meta.size
    }

    /// Append a chunk unless it would overflow the declared size.
    pub fn append(&mut self, chunk: &[u8]) -> bool {
        if self.received() + chunk.len() as u64 > self.meta.size {
            return false;
        }
        self.buffer.extend_from_slice(chunk);
        true
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buffer)
    }
}

pub struct InboundTransfer {
    pub request_id: Uuid,
    /// Files not yet delivered, in declared order.
    pub files: Vec<InboundFile>,
    /// Bytes of files already delivered from this batch.
    delivered: u64,
    total: u64,
}

impl InboundTransfer {
    pub fn new(request_id: Uuid, metadata: Vec<FileMeta>) -> Self {
        let total = metadata.iter().map(|m| m.size).sum();
        Self {
            request_id,
            files: metadata.into_iter().map(InboundFile::new).collect(),
            delivered: 0,
            total,
        }
    }

    /// Combined bytes received across the whole batch.
    pub fn received(&self) -> u64 {
        self.delivered + self.files.iter().map(InboundFile::received).sum::<u64>()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// The file the next binary chunk belongs to.
    pub fn current_mut(&mut self) -> Option<&mut InboundFile> {
        self.files.iter_mut().find(|f| !f.is_complete())
    }

    /// Pick the completed file an EOF refers to.
    ///
    /// Prefers the earliest complete file carrying `name`; otherwise falls
    /// back to the earliest complete file. The flag reports whether the choice
    /// was ambiguous.
    pub fn take_finished(&mut self, name: &str) -> Option<(InboundFile, bool)> {
        let complete: Vec<usize> = self
            .files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_complete())
            .map(|(i, _)| i)
            .collect();
        let named: Vec<usize> = complete
            .iter()
            .copied()
            .filter(|&i| self.files[i].meta.name == name)
            .collect();

        let (index, ambiguous) = match (named.first(), complete.first()) {
            (Some(&i), _) => (i, named.len() > 1),
            (None, Some(&i)) => (i, true),
            (None, None) => return None,
        };

        let file = self.files.remove(index);
        self.delivered += file.received();
        Some((file, ambiguous))
    }

    pub fn is_done(&self) -> bool {
        self.files.is_empty()
    }
}
