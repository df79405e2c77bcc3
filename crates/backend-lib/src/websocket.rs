// ==================
// crates/backend-lib/src/websocket.rs
// ==================
//! WebSocket Handler Module
//!
//! One `WebSocketHandler` exists per accepted socket. It joins the room when
//! created, decodes every inbound text frame into a [`ClientMessage`], and
//! routes it through the shared [`RoomManager`]:
//!
//! - `SPEECH_INPUT` becomes a `TRANSCRIPT_UPDATE` for the whole room
//! - `CHAT_MESSAGE` is stamped with the local time and broadcast
//! - `offer` / `answer` / `ice-candidate` go to the `to` participant, or to the
//!   whole room when there is no target
//! - `UPDATE_STATUS` flips the mute flag and re-broadcasts presence
//! - `TYPING` is relayed to everyone except the typist
//! - anything else is echoed back to the room as `UNKNOWN`
//!
//! A frame that can't be decoded is logged and skipped; it never ends the
//! session. The session ends only through [`WebSocketHandler::close`].

use crate::connection::{ConnectionId, Transport};
use crate::error::DeliveryError;
use crate::metrics::{DECODE_ERRORS, MESSAGES_ROUTED};
use crate::rooms::{FanoutReport, RoomManager};
use metrics::counter;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use yarn_common::{ClientMessage, ServerMessage};

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Closed,
}

/// What a routed message turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Sent to every member of the room
    Broadcast(FanoutReport),
    /// Sent to a single participant
    Targeted { delivered: bool },
    /// Mute flag changed on `matched` members and presence re-broadcast
    StatusUpdated { matched: usize },
    /// Required fields were empty; nothing was sent
    Ignored,
}

/// Per-connection protocol loop state.
pub struct WebSocketHandler {
    rooms: Arc<RoomManager>,
    room_id: String,
    participant_id: String,
    display_name: String,
    connection_id: ConnectionId,
    state: SessionState,
}

impl WebSocketHandler {
    /// Join `room_id` with `transport` and announce the newcomer.
    pub async fn connect(
        rooms: Arc<RoomManager>,
        room_id: String,
        participant_id: String,
        display_name: String,
        transport: Transport,
    ) -> Self {
        let connection_id = transport.id();
        let participant = rooms
            .join(&room_id, participant_id, display_name, transport)
            .await;

        Self {
            rooms,
            room_id,
            participant_id: participant.id,
            display_name: participant.name,
            connection_id,
            state: SessionState::Connected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Decode and route one text frame. Undecodable frames are logged and
    /// dropped.
    pub async fn handle_frame(&mut self, frame: &str) -> Option<Dispatch> {
        if self.state == SessionState::Closed {
            return None;
        }

        match ClientMessage::decode(frame) {
            Ok(msg) => Some(self.handle_message(msg).await),
            Err(e) => {
                counter!(DECODE_ERRORS).increment(1);
                warn!(
                    room_id = %self.room_id,
                    participant_id = %self.participant_id,
                    "dropping malformed frame: {}",
                    e
                );
                None
            },
        }
    }

    /// Route one decoded message.
    pub async fn handle_message(&mut self, msg: ClientMessage) -> Dispatch {
        counter!(MESSAGES_ROUTED, "kind" => msg.kind()).increment(1);
        debug!(
            room_id = %self.room_id,
            participant_id = %self.participant_id,
            kind = msg.kind(),
            "routing message"
        );

        match msg {
            ClientMessage::SpeechInput { user_name, text } => {
                if user_name.is_empty() || text.is_empty() {
                    return Dispatch::Ignored;
                }
                Dispatch::Broadcast(
                    self.rooms
                        .relay_transcript(&self.room_id, &user_name, &text)
                        .await,
                )
            },
            ClientMessage::ChatMessage {
                sender_id,
                sender_name,
                text,
            } => {
                if text.is_empty() || sender_name.is_empty() || !is_present(&sender_id) {
                    return Dispatch::Ignored;
                }
                let chat = ServerMessage::ChatMessage {
                    sender_id,
                    sender_name,
                    text,
                    timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
                };
                Dispatch::Broadcast(self.rooms.broadcast(&self.room_id, &chat).await)
            },
            ClientMessage::Signal { kind, to, payload } => match to {
                Some(target) => {
                    let result = self
                        .rooms
                        .try_send_to_one(&self.room_id, &target, &payload)
                        .await;
                    let Err(reason) = result else {
                        return Dispatch::Targeted { delivered: true };
                    };
                    info!(
                        room_id = %self.room_id,
                        kind = kind.as_str(),
                        target = %target,
                        "signaling message not delivered: {}",
                        reason
                    );
                    let reply = match reason {
                        DeliveryError::NotFound => ServerMessage::target_not_found(&target),
                        _ => ServerMessage::target_unreachable(&target),
                    };
                    self.rooms
                        .send_to_connection(&self.room_id, self.connection_id, &reply)
                        .await;
                    Dispatch::Targeted { delivered: false }
                },
                None => Dispatch::Broadcast(self.rooms.broadcast(&self.room_id, &payload).await),
            },
            ClientMessage::UpdateStatus { user_id, is_muted } => {
                let matched = self.rooms.set_status(&self.room_id, &user_id, is_muted).await;
                Dispatch::StatusUpdated { matched }
            },
            ClientMessage::Typing { user, typing } => {
                let user = if user.is_empty() {
                    self.display_name.clone()
                } else {
                    user
                };
                let notice = ServerMessage::Typing { user, typing };
                Dispatch::Broadcast(
                    self.rooms
                        .broadcast_except(&self.room_id, self.connection_id, &notice)
                        .await,
                )
            },
            ClientMessage::Unrecognized(payload) => {
                let echo = ServerMessage::Unknown { payload };
                Dispatch::Broadcast(self.rooms.broadcast(&self.room_id, &echo).await)
            },
        }
    }

    /// Leave the room and announce the departure. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;

        let name = self.rooms.leave(&self.room_id, self.connection_id);
        self.rooms
            .broadcast(&self.room_id, &ServerMessage::left(&name))
            .await;
        self.rooms.broadcast_participants(&self.room_id).await;
    }
}

/// A sender id counts as present unless it is null or an empty string.
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}
