//! Outgoing file sources and the read-ahead chunk producer.
//!
//! ```text
//! ┌────────────┐   bounded chan   ┌───────────┐
//! │ reader     │ ───────────────► │ send task │ ──► data channel
//! │ (disk/mem) │  read-ahead of N │           │
//! └────────────┘                  └───────────┘
//! ```
//!
//! The reader stays `SENDER_READ_AHEAD_CHUNKS` chunks ahead of the send task
//! so the channel stays saturated while the next chunk is read.

use crate::core::config::SENDER_READ_AHEAD_CHUNKS;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use super::frames::FileMeta;

#[derive(Debug, Clone)]
pub enum FileSource {
    Memory(Bytes),
    Path(PathBuf),
}

/// One file queued for sending.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub source: FileSource,
}

impl OutgoingFile {
    pub fn from_bytes(name: &str, mime: &str, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.to_string(),
            size: data.len() as u64,
            mime: mime.to_string(),
            source: FileSource::Memory(data),
        }
    }

    /// Describe a file on disk; its bytes are read lazily while sending.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        anyhow::ensure!(meta.is_file(), "{} is not a regular file", path.display());

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("path has no file name")?;

        Ok(Self {
            mime: mime_for(&name).to_string(),
            name,
            size: meta.len(),
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    pub fn meta(&self) -> FileMeta {
        FileMeta::new(&self.name, self.size, &self.mime)
    }
}

/// Best-effort MIME type from the file extension.
pub fn mime_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Spawn a producer that slices `source` into `chunk_size` pieces.
///
/// The receiver yields exactly `ceil(size / chunk_size)` chunks unless the
/// consumer goes away or reading fails; the join handle reports the latter.
pub fn spawn_reader(
    source: FileSource,
    size: u64,
    chunk_size: usize,
) -> (mpsc::Receiver<Bytes>, tokio::task::JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(SENDER_READ_AHEAD_CHUNKS);

    let handle = tokio::spawn(async move {
        match source {
            FileSource::Memory(data) => {
                anyhow::ensure!(
                    data.len() as u64 == size,
                    "buffer holds {} bytes, {} declared",
                    data.len(),
                    size
                );
                let mut offset = 0;
                while offset < data.len() {
                    let end = (offset + chunk_size).min(data.len());
                    // Stop if the send task has been dropped.
                    if tx.send(data.slice(offset..end)).await.is_err() {
                        break;
                    }
                    offset = end;
                }
            }
            FileSource::Path(path) => {
                let mut file = tokio::fs::File::open(&path)
                    .await
                    .with_context(|| format!("cannot open {}", path.display()))?;
                let mut remaining = size;
                while remaining > 0 {
                    let len = (chunk_size as u64).min(remaining) as usize;
                    let mut buf = vec![0u8; len];
                    file.read_exact(&mut buf)
                        .await
                        .with_context(|| format!("{} shrank while sending", path.display()))?;
                    remaining -= len as u64;
                    if tx.send(Bytes::from(buf)).await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    });

    (rx, handle)
}
