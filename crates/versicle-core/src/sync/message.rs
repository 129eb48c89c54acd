//! Realtime protocol message types
//!
//! Messages exchanged with the realtime backend using CBOR encoding. Every
//! document update carries the full encoded document state; the receiver
//! merges it.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::provider::SaveRejection;

/// Messages sent to the realtime backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Authenticate and start receiving updates for a path
    #[serde(rename = "subscribe")]
    Subscribe { path: String, token: String },

    /// Publish the document state
    #[serde(rename = "update")]
    Update {
        path: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },

    /// Ask whether the path holds any data
    #[serde(rename = "probe")]
    Probe { path: String },

    /// Request the current merged state
    #[serde(rename = "snapshot")]
    Snapshot { path: String },
}

/// Messages received from the realtime backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "subscribed")]
    Subscribed { path: String },

    /// Document state published by another client
    #[serde(rename = "update")]
    Update {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },

    #[serde(rename = "probe-result")]
    ProbeResult {
        #[serde(rename = "hasDocument")]
        has_document: bool,
        /// Updates recorded in the path's `updates` collection
        #[serde(rename = "pendingUpdates")]
        pending_updates: u64,
    },

    #[serde(rename = "snapshot")]
    Snapshot {
        data: Option<ByteBuf>,
        #[serde(rename = "lastModified")]
        last_modified: Option<i64>,
    },

    #[serde(rename = "save-rejected")]
    SaveRejected { reason: SaveRejection, details: String },

    /// The backend gave up persisting after repeated retries
    #[serde(rename = "sync-failed")]
    SyncFailed { attempts: u32 },

    #[serde(rename = "error")]
    Error { message: String },
}

/// Result of a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub has_document: bool,
    pub pending_updates: u64,
}

impl ProbeResult {
    pub fn has_data(&self) -> bool {
        self.has_document || self.pending_updates > 0
    }
}

pub type EncodeError = ciborium::ser::Error<std::io::Error>;
pub type DecodeError = ciborium::de::Error<std::io::Error>;

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(msg, &mut bytes)?;
    Ok(bytes)
}

impl ClientMessage {
    pub fn update(path: &str, data: Vec<u8>) -> Self {
        ClientMessage::Update {
            path: path.to_string(),
            data,
        }
    }

    /// Encode message to CBOR bytes
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        ciborium::from_reader(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode(self)
    }

    /// Decode message from CBOR bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        ciborium::from_reader(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_round_trip() {
        let msg = ClientMessage::update("users/u1/versicle/production", vec![1, 2, 3, 4]);
        let bytes = msg.encode().unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(ClientMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_server_message_decoding() {
        let msg = ServerMessage::ProbeResult {
            has_document: false,
            pending_updates: 3,
        };
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();

        match decoded {
            ServerMessage::ProbeResult {
                has_document,
                pending_updates,
            } => {
                assert!(!has_document);
                assert_eq!(pending_updates, 3);
            }
            _ => panic!("Expected ProbeResult message"),
        }
    }

    #[test]
    fn test_save_rejected_wire_names() {
        let msg = ServerMessage::SaveRejected {
            reason: SaveRejection::PayloadTooLarge,
            details: "1.2 MB".into(),
        };
        let value: ciborium::Value = ciborium::from_reader(msg.encode().unwrap().as_slice()).unwrap();
        let map = value.as_map().unwrap();
        let field = |name: &str| {
            map.iter()
                .find(|(k, _)| k.as_text() == Some(name))
                .map(|(_, v)| v.clone())
        };
        assert_eq!(field("type").unwrap().as_text(), Some("save-rejected"));
        assert_eq!(field("reason").unwrap().as_text(), Some("payload-too-large"));
    }

    #[test]
    fn test_empty_snapshot() {
        let msg = ServerMessage::Snapshot {
            data: None,
            last_modified: None,
        };
        assert_eq!(ServerMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_probe_has_data() {
        let empty = ProbeResult {
            has_document: false,
            pending_updates: 0,
        };
        assert!(!empty.has_data());
        assert!(ProbeResult {
            pending_updates: 1,
            ..empty
        }
        .has_data());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(ServerMessage::decode(b"\xff\x00garbage").is_err());
    }
}
