//! Centralized configuration constants for peerdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format names (relay message types, data-channel
//! control frames) stay in their respective modules.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Size of one binary chunk frame on the data channel (64 KiB).
///
/// Also used as the channel's buffered-amount-low threshold: the sender
/// suspends while more than one chunk is queued in the SCTP send buffer.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Sender read-ahead buffer: max chunks prefetched from disk while the
/// data channel drains.
pub const SENDER_READ_AHEAD_CHUNKS: usize = 16;

/// Upper bound for the up-front allocation of a receive buffer. Larger
/// files grow the buffer as chunks arrive instead of trusting the
/// declared size.
pub const MAX_PREALLOCATED_BUFFER: usize = 16 * 1024 * 1024;

// ── Safety / Abuse Prevention ────────────────────────────────────────────────

/// Protocol violations tolerated from one peer before its connection is
/// torn down. A single malformed frame is dropped; a pattern is not.
pub const MAX_PROTOCOL_VIOLATIONS: u32 = 3;

/// Remote ICE candidates held for a peer id that has no session yet.
/// Bounds memory exposure from candidates addressed to unknown peers.
pub const MAX_EARLY_CANDIDATES: usize = 64;

// ── Relay / Signaling ────────────────────────────────────────────────────────

/// Default relay endpoint.
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8080/ws";

/// Fixed delay before reopening the relay connection after close or error.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// Upper bound for a single relay connection attempt (TCP + TLS + upgrade).
pub const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Connection / Network ─────────────────────────────────────────────────────

/// Public STUN server used when the relay has not supplied ICE servers.
pub const FALLBACK_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Whether to gather loopback candidates (same-machine testing).
pub const ICE_INCLUDE_LOOPBACK: bool = false;
