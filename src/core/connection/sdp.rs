//! SDP helpers: host-only candidate filtering and the compact string codec
//! used to shrink descriptions on the relay.

use super::native::SessionDescription;
use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use brotli::{CompressorWriter, Decompressor};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Version prefix of the compact encoding.
const COMPACT_VERSION: &str = "1";

// ── Candidate filtering ──────────────────────────────────────────────────────

/// Drop every `a=candidate:` line that is not a host candidate.
///
/// Narrows connectivity to same-network paths. Line endings are preserved.
pub fn filter_host_candidates(sdp: &str) -> String {
    sdp.split('\n')
        .filter(|line| !line.starts_with("a=candidate:") || line.contains(" typ host"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Apply [`filter_host_candidates`] to a description.
pub fn host_only(mut desc: SessionDescription) -> SessionDescription {
    desc.sdp = filter_host_candidates(&desc.sdp);
    desc
}

// ── Compact codec ────────────────────────────────────────────────────────────

/// Brotli + URL-safe base64, prefixed with the format version.
pub fn compress(data: &str) -> Result<String> {
    let mut compressed = Vec::with_capacity(data.len() / 2);
    {
        let mut w = CompressorWriter::new(&mut compressed, 4096, 11, 22);
        w.write_all(data.as_bytes())?;
    }
    Ok(format!("{COMPACT_VERSION}{}", URL_SAFE_NO_PAD.encode(&compressed)))
}

/// Inverse of [`compress`].
pub fn decompress(packed: &str) -> Result<String> {
    let body = packed
        .trim()
        .strip_prefix(COMPACT_VERSION)
        .context("unknown compact format version")?;
    let compressed = URL_SAFE_NO_PAD
        .decode(body)
        .context("failed to decode base64")?;
    let mut out = String::new();
    Decompressor::new(compressed.as_slice(), 4096)
        .read_to_string(&mut out)
        .context("failed to decompress data")?;
    Ok(out)
}

// ── Relay payload ────────────────────────────────────────────────────────────

/// An SDP as carried in relay `offer` / `answer` fields: either the plain
/// JSON object or its compact string form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SdpPayload {
    Plain(SessionDescription),
    Compact(String),
}

impl SdpPayload {
    pub fn encode(desc: SessionDescription, compact: bool) -> Result<Self> {
        if compact {
            Ok(Self::Compact(compress(&serde_json::to_string(&desc)?)?))
        } else {
            Ok(Self::Plain(desc))
        }
    }

    pub fn decode(self) -> Result<SessionDescription> {
        match self {
            Self::Plain(desc) => Ok(desc),
            Self::Compact(packed) => {
                let json = decompress(&packed)?;
                serde_json::from_str(&json).context("compact SDP is not a session description")
            }
        }
    }
}
