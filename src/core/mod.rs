pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod notify;
pub mod signaling;
pub mod store;
pub mod transfer;
