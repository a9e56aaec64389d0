//! Relay wire protocol.
//!
//! JSON text messages discriminated by a `type` field. Binary fields (`iv`,
//! `tag`, `data`) are base64 strings. Paths toward the relay are always
//! `hash_path` outputs; `originalPath` is a sealed token, never plaintext.
//!
//! Client to relay:
//! `{"type":"upload","vaultId":"mg-…","path":"<sha256>","originalPath":"<token>",
//!   "iv":"…","tag":"…","data":"…","hash":"…","size":12,"modifiedAt":1700000000000}`
//!
//! Relay to client:
//! `{"type":"manifest","files":{"<sha256>":{"hash":"…","size":12,"modifiedAt":…}}}`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to decode relay message: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Register { vault_id: String },

    #[serde(rename_all = "camelCase")]
    GetManifest { vault_id: String },

    #[serde(rename_all = "camelCase")]
    Upload {
        vault_id: String,
        /// Hashed path
        path: String,
        /// Sealed relative path
        original_path: String,
        #[serde(with = "b64")]
        iv: Vec<u8>,
        #[serde(with = "b64")]
        tag: Vec<u8>,
        #[serde(with = "b64")]
        data: Vec<u8>,
        /// Plaintext content hash
        hash: String,
        size: u64,
        modified_at: u64,
    },

    #[serde(rename_all = "camelCase")]
    Download { vault_id: String, path: String },

    /// Remove a file from the relay. Acknowledged with `ack`.
    #[serde(rename_all = "camelCase")]
    Delete { vault_id: String, path: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ClientMessage serialization should not fail")
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The `type` discriminant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::GetManifest { .. } => "get-manifest",
            ClientMessage::Upload { .. } => "upload",
            ClientMessage::Download { .. } => "download",
            ClientMessage::Delete { .. } => "delete",
        }
    }
}

/// One file as the relay knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub hash: String,
    pub size: u64,
    pub modified_at: u64,
    /// Sealed relative path, echoed back from the upload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<String>,
}

/// Messages sent by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayMessage {
    /// Keyed by hashed path
    Manifest {
        #[serde(default)]
        files: BTreeMap<String, RemoteEntry>,
    },

    FileData {
        path: String,
        #[serde(with = "b64")]
        iv: Vec<u8>,
        #[serde(with = "b64")]
        tag: Vec<u8>,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },

    Ack {},

    /// Relays report the text under either `message` or `error`.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    Notify { event: String },

    /// Any `type` this client doesn't know; ignored.
    #[serde(other)]
    Unknown,
}

/// `notify` event announcing that another device changed the vault.
pub const FILE_CHANGED_EVENT: &str = "file-changed";

impl RelayMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("RelayMessage serialization should not fail")
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn error(message: impl Into<String>) -> Self {
        RelayMessage::Error {
            message: Some(message.into()),
            error: None,
        }
    }

    /// Text of an `error` message, whichever field carried it.
    pub fn error_text(&self) -> Option<String> {
        match self {
            RelayMessage::Error { message, error } => Some(
                message
                    .clone()
                    .or_else(|| error.clone())
                    .unwrap_or_else(|| "Unknown relay error".to_string()),
            ),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Manifest { .. } => "manifest",
            RelayMessage::FileData { .. } => "file-data",
            RelayMessage::Ack {} => "ack",
            RelayMessage::Error { .. } => "error",
            RelayMessage::Notify { .. } => "notify",
            RelayMessage::Unknown => "unknown",
        }
    }
}

/// Serde adapter for `Vec<u8>` as standard base64.
pub mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
