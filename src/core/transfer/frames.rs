//! Data-channel control frames.
//!
//! Control messages travel as JSON text frames; file bytes travel as bare
//! binary frames on the same channel. The frame kind alone tells them apart.

use serde::{Deserialize, Deserializer, Serialize};

/// Declared metadata for one file of a share request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    /// MIME type; empty when unknown.
    #[serde(rename = "type", default)]
    pub mime: String,
}

impl FileMeta {
    pub fn new(name: &str, size: u64, mime: &str) -> Self {
        Self {
            name: name.to_string(),
            size,
            mime: mime.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlFrame {
    /// `name` is the sender's display name.
    RequestedFileShare {
        name: String,
        #[serde(deserialize_with = "one_or_many")]
        metadata: Vec<FileMeta>,
    },
    AcceptedFileShare,
    DeniedFileShare,
    /// Sent after the last chunk of the named file.
    Eof {
        #[serde(default)]
        name: String,
    },
}

impl ControlFrame {
    pub fn to_json(&self) -> String {
        // Serializing these plain structs cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Older senders put a single metadata object where a list is expected.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<FileMeta>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Metadata {
        One(FileMeta),
        Many(Vec<FileMeta>),
    }

    Ok(match Metadata::deserialize(deserializer)? {
        Metadata::One(meta) => vec![meta],
        Metadata::Many(list) => list,
    })
}
