//! peerdrop: direct peer-to-peer file exchange over WebRTC data channels.
//!
//! A WebSocket relay introduces peers and forwards their offers, answers
//! and ICE candidates. Once a data channel opens, files travel directly
//! between the two peers as 64 KiB binary chunks framed by JSON control
//! messages.

pub mod core;
pub mod utils;
pub mod workers;
