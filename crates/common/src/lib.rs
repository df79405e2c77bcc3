//! Wire protocol shared by the relay server and its clients.
//!
//! Every frame is a JSON object discriminated by a `type` field. Inbound frames
//! decode into the closed [`ClientMessage`] set; anything that does not fit a
//! known shape lands in [`ClientMessage::Unrecognized`] instead of failing the
//! connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Presence projection of one room member, as carried by `PARTICIPANTS_UPDATE`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Client-supplied participant identifier
    pub id: String,
    /// Display name
    pub name: String,
    #[serde(rename = "isMuted")]
    pub is_muted: bool,
    #[serde(rename = "isActive")]
    pub is_active: bool,
}

/// WebRTC signaling message kinds relayed verbatim between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }

    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "ice-candidate" => Some(SignalKind::IceCandidate),
            _ => None,
        }
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// A transcript line produced on the client side
    SpeechInput { user_name: String, text: String },
    /// Chat line; `sender_id` is kept as sent so it can be echoed unchanged
    ChatMessage {
        sender_id: Value,
        sender_name: String,
        text: String,
    },
    /// `offer` / `answer` / `ice-candidate`, with the untouched original object
    Signal {
        kind: SignalKind,
        to: Option<String>,
        payload: Value,
    },
    /// Mute flag change for every connection claiming `user_id`
    UpdateStatus { user_id: String, is_muted: bool },
    /// Typing indicator; `user` is empty when the client left it out
    Typing { user: String, typing: bool },
    /// Object with a missing or unknown `type`, or fields that don't fit it
    Unrecognized(Value),
}

/// A frame that could not be read as a JSON object at all.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,
}

/// Participant ids arrive as either strings or numbers depending on the client.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Number(serde_json::Number),
}

impl IdRepr {
    fn into_id(self) -> Option<String> {
        match self {
            IdRepr::Text(s) if s.is_empty() => None,
            IdRepr::Text(s) => Some(s),
            IdRepr::Number(n) => Some(n.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct SpeechInputFields {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    user_name: Option<String>,
}

#[derive(Deserialize)]
struct ChatFields {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    sender_id: Value,
    #[serde(default)]
    sender_name: Option<String>,
}

#[derive(Deserialize)]
struct SignalFields {
    #[serde(default)]
    to: Option<IdRepr>,
}

#[derive(Deserialize)]
struct TypingFields {
    #[serde(default)]
    user: Option<String>,
    typing: bool,
}

#[derive(Deserialize)]
struct UpdateStatusFields {
    user_id: IdRepr,
    #[serde(rename = "isMuted")]
    is_muted: bool,
}

impl ClientMessage {
    /// Decode one text frame.
    ///
    /// # Errors
    /// Fails only when the frame is not a JSON object; schema mismatches
    /// decode to [`ClientMessage::Unrecognized`].
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(frame)?;
        if !value.is_object() {
            return Err(DecodeError::NotAnObject);
        }
        Ok(Self::from_value(value))
    }

    /// Classify an already-parsed JSON object by its `type` field.
    pub fn from_value(value: Value) -> Self {
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return ClientMessage::Unrecognized(value);
        };

        let decoded = match kind {
            "SPEECH_INPUT" => serde_json::from_value::<SpeechInputFields>(value.clone())
                .ok()
                .map(|f| ClientMessage::SpeechInput {
                    user_name: f.user_name.unwrap_or_default(),
                    text: f.text.unwrap_or_default(),
                }),
            "CHAT_MESSAGE" => serde_json::from_value::<ChatFields>(value.clone())
                .ok()
                .map(|f| ClientMessage::ChatMessage {
                    sender_id: f.sender_id,
                    sender_name: f.sender_name.unwrap_or_default(),
                    text: f.text.unwrap_or_default(),
                }),
            "UPDATE_STATUS" => serde_json::from_value::<UpdateStatusFields>(value.clone())
                .ok()
                .and_then(|f| {
                    f.user_id.into_id().map(|user_id| ClientMessage::UpdateStatus {
                        user_id,
                        is_muted: f.is_muted,
                    })
                }),
            "TYPING" => serde_json::from_value::<TypingFields>(value.clone())
                .ok()
                .map(|f| ClientMessage::Typing {
                    user: f.user.unwrap_or_default(),
                    typing: f.typing,
                }),
            other => SignalKind::parse(other).and_then(|kind| {
                serde_json::from_value::<SignalFields>(value.clone())
                    .ok()
                    .map(|f| ClientMessage::Signal {
                        kind,
                        to: f.to.and_then(IdRepr::into_id),
                        payload: value.clone(),
                    })
            }),
        };

        decoded.unwrap_or(ClientMessage::Unrecognized(value))
    }

    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::SpeechInput { .. } => "SPEECH_INPUT",
            ClientMessage::ChatMessage { .. } => "CHAT_MESSAGE",
            ClientMessage::Signal { kind, .. } => kind.as_str(),
            ClientMessage::UpdateStatus { .. } => "UPDATE_STATUS",
            ClientMessage::Typing { .. } => "TYPING",
            ClientMessage::Unrecognized(_) => "UNKNOWN",
        }
    }
}

/// Messages sent from server to client.
///
/// Signaling frames are not listed here: they are relayed as the original
/// client object.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// Join or leave notice
    Status { message: String },
    /// Full presence snapshot of the room
    ParticipantsUpdate { participants: Vec<Participant> },
    /// Relayed transcript line
    TranscriptUpdate { user_name: String, text: String },
    /// Relayed chat line, stamped with the server's local `HH:MM:SS`
    ChatMessage {
        sender_id: Value,
        sender_name: String,
        text: String,
        timestamp: String,
    },
    /// Someone started or stopped typing; never sent back to the typist
    Typing { user: String, typing: bool },
    /// Routing failure reported back to the sender
    Error { message: String },
    /// Diagnostic echo of an inbound message nobody understood
    Unknown { payload: Value },
}

impl ServerMessage {
    pub fn joined(name: &str) -> Self {
        ServerMessage::Status {
            message: format!("{name} joined the room"),
        }
    }

    pub fn left(name: &str) -> Self {
        ServerMessage::Status {
            message: format!("{name} left the room"),
        }
    }

    pub fn target_not_found(target: &str) -> Self {
        ServerMessage::Error {
            message: format!("Participant {target} not found in room"),
        }
    }

    pub fn target_unreachable(target: &str) -> Self {
        ServerMessage::Error {
            message: format!("Participant {target} could not be reached"),
        }
    }
}
