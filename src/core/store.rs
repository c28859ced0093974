//! Session store: the only place identity and link state is persisted.
//!
//! Values are JSON. [`FileStore`] keeps them in `<data_dir>/session.json`,
//! rewritten atomically on every change; [`MemoryStore`] is used when
//! nothing should outlive the process.

use crate::core::connection::IceServer;
use crate::core::signaling::DiscoveryMode;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKey {
    Name,
    PeerId,
    AuthToken,
    ConnectionId,
    /// Discovery mode.
    ConnectionType,
    /// Peers linked through a pairing code, re-linked after every reconnect.
    ConnectedPeerIds,
    IceServers,
}

impl SessionKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "NAME",
            Self::PeerId => "PEER_ID",
            Self::AuthToken => "AUTH_TOKEN",
            Self::ConnectionId => "CONNECTION_ID",
            Self::ConnectionType => "CONNECTION_TYPE",
            Self::ConnectedPeerIds => "CONNECTED_PEER_IDS",
            Self::IceServers => "ICE_SERVERS",
        }
    }
}

pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn remove(&self, key: &str);
}

/// Typed access on top of any [`SessionStore`].
pub trait StoreExt: SessionStore {
    fn get_as<T: DeserializeOwned>(&self, key: SessionKey) -> Option<T> {
        let value = self.get(key.as_str())?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(event = "store_value_invalid", key = key.as_str(), error = %e);
                None
            }
        }
    }

    fn set_as<T: Serialize>(&self, key: SessionKey, value: &T) {
        match serde_json::to_value(value) {
            Ok(v) => self.set(key.as_str(), v),
            Err(e) => error!(event = "store_encode_failure", key = key.as_str(), error = %e),
        }
    }

    fn set_opt(&self, key: SessionKey, value: Option<&str>) {
        match value {
            Some(v) => self.set_as(key, &v),
            None => self.remove(key.as_str()),
        }
    }

    fn name(&self) -> Option<String> {
        self.get_as(SessionKey::Name)
    }

    fn discovery_mode(&self) -> DiscoveryMode {
        self.get_as(SessionKey::ConnectionType).unwrap_or_default()
    }

    fn ice_servers(&self) -> Vec<IceServer> {
        self.get_as(SessionKey::IceServers).unwrap_or_default()
    }

    fn linked_peers(&self) -> Vec<String> {
        self.get_as(SessionKey::ConnectedPeerIds).unwrap_or_default()
    }

    /// Remember a linked peer. Returns `false` if it was already known.
    fn add_linked_peer(&self, peer_id: &str) -> bool {
        let mut peers = self.linked_peers();
        if peers.iter().any(|p| p == peer_id) {
            return false;
        }
        peers.push(peer_id.to_string());
        self.set_as(SessionKey::ConnectedPeerIds, &peers);
        true
    }

    fn remove_linked_peer(&self, peer_id: &str) -> bool {
        let mut peers = self.linked_peers();
        let before = peers.len();
        peers.retain(|p| p != peer_id);
        if peers.len() == before {
            return false;
        }
        self.set_as(SessionKey::ConnectedPeerIds, &peers);
        true
    }
}

impl<S: SessionStore + ?Sized> StoreExt for S {}

// ── In-memory ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.remove(key);
        }
    }
}

// ── JSON file ────────────────────────────────────────────────────────────────

pub struct FileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl FileStore {
    /// Open `<dir>/session.json`, starting empty if missing or unreadable.
    pub fn open(dir: &Path) -> Self {
        let path = dir.join("session.json");
        let values = Self::read_from_file(&path);
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_from_file(path: &Path) -> BTreeMap<String, Value> {
        if !path.exists() {
            return BTreeMap::new();
        }
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(event = "session_store_read_failure", error = %e, "Failed to read session store");
                return BTreeMap::new();
            }
        };
        match serde_json::from_str::<BTreeMap<String, Value>>(&content) {
            Ok(values) => {
                debug!(event = "session_store_loaded", keys = values.len(), "Session store loaded");
                values
            }
            Err(e) => {
                error!(
                    event = "session_store_parse_failure",
                    error = %e,
                    "Failed to parse session store, starting fresh"
                );
                BTreeMap::new()
            }
        }
    }

    fn save(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        let content = serde_json::to_string_pretty(values)?;
        crate::utils::atomic_write::atomic_write(&self.path, content.as_bytes())
    }

    fn update(&self, apply: impl FnOnce(&mut BTreeMap<String, Value>)) {
        let Ok(mut values) = self.values.lock() else {
            return;
        };
        apply(&mut *values);
        if let Err(e) = self.save(&*values) {
            error!(event = "session_store_save_failure", error = %e, "Failed to persist session store");
        }
    }
}

impl SessionStore for FileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.update(|values| {
            values.insert(key.to_string(), value);
        });
    }

    fn remove(&self, key: &str) {
        self.update(|values| {
            values.remove(key);
        });
    }
}
