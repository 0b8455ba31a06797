//! Wire frames for the sync socket.
//!
//! The socket carries two planes:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ binary frame │ bincode-encoded Change (document delta)      │
//! ├──────────────┼──────────────────────────────────────────────┤
//! │ text frame   │ JSON control message (auth, presence)        │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! The first text frame after the socket opens is the auth handshake
//! `{"connectionId": ..., "jwt": ...}`; the server never acks it, it
//! just starts relaying. Presence messages are a tagged union on the
//! `type` field (`UPDATE` / `REMOVE`). Anything a peer sends that does
//! not parse is classified as [`ControlFrame::Ignored`] — a hostile or
//! newer peer must never be able to take the session down.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::ObjectId;

/// Identifies one open socket. Distinct from the document actor only
/// in principle; sessions use the same id for both.
pub type ConnectionId = Uuid;

/// Auth handshake, sent as the first text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFrame {
    pub connection_id: ConnectionId,
    pub jwt: String,
}

impl AuthFrame {
    pub fn new(connection_id: ConnectionId, jwt: impl Into<String>) -> Self {
        Self {
            connection_id,
            jwt: jwt.into(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        serde_json::from_str(text).map_err(|e| FrameError::MalformedFrame(e.to_string()))
    }
}

/// One participant's full presence record. Always broadcast whole;
/// receivers replace rather than patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub connection_id: ConnectionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub selected_object_ids: Vec<ObjectId>,
}

impl PresenceState {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            name: None,
            selected_object_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemovePayload {
    connection_id: ConnectionId,
}

/// The JSON shapes actually on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ControlMessage {
    #[serde(rename = "UPDATE")]
    Update(PresenceState),
    #[serde(rename = "REMOVE")]
    Remove(RemovePayload),
}

/// A classified inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    /// A peer's presence record changed (or the peer just joined).
    Update(PresenceState),
    /// A peer left; drop its record.
    Remove(ConnectionId),
    /// Unknown type or malformed JSON. Logged and skipped.
    Ignored,
}

impl ControlFrame {
    /// Classify an inbound text frame. Never fails: input this peer
    /// does not understand becomes `Ignored`.
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<ControlMessage>(text) {
            Ok(ControlMessage::Update(state)) => ControlFrame::Update(state),
            Ok(ControlMessage::Remove(payload)) => ControlFrame::Remove(payload.connection_id),
            Err(e) => {
                log::debug!("Ignoring unrecognized control frame: {e}");
                ControlFrame::Ignored
            }
        }
    }
}

/// Encode a presence `UPDATE` for broadcast.
pub fn presence_update(state: &PresenceState) -> String {
    serde_json::to_string(&ControlMessage::Update(state.clone())).unwrap_or_default()
}

/// Encode a presence `REMOVE` for broadcast.
pub fn presence_remove(connection_id: ConnectionId) -> String {
    serde_json::to_string(&ControlMessage::Remove(RemovePayload { connection_id }))
        .unwrap_or_default()
}

/// Frame-level errors (auth decode on the accepting side).
#[derive(Debug, Clone)]
pub enum FrameError {
    MalformedFrame(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedFrame(e) => write!(f, "Malformed frame: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}
