// ============================
// yarn-backend-lib/src/rooms.rs
// ============================
//! Room registry and the operations that mutate it.
//!
//! Every room lives in one `DashMap` entry; join, leave and status updates take
//! that entry's write lock, so operations on the same room are serialized.
//! Broadcasts copy the member transports out under a read lock and send after
//! releasing it. No lock is ever held across an `.await`.
use crate::connection::{Connection, ConnectionId, Frame, Transport};
use crate::error::DeliveryError;
use crate::metrics::{DELIVERY_FAILED, DELIVERY_OK, ROOMS_ACTIVE};
use crate::transcript::{NoopTranscriptSink, TranscriptSink};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use yarn_common::{Participant, ServerMessage};

pub type RoomId = String;

/// Name returned by [`RoomManager::leave`] when the connection isn't found.
pub const UNKNOWN_PARTICIPANT: &str = "unknown";

#[derive(Debug, Default)]
struct Room {
    /// Join order
    members: Vec<Connection>,
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Owner of all rooms and their connections.
pub struct RoomManager {
    rooms: DashMap<RoomId, Room>,
    send_timeout: Duration,
    transcripts: Arc<dyn TranscriptSink>,
}

impl RoomManager {
    /// Create a manager whose deliveries give up after `send_timeout`.
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            rooms: DashMap::new(),
            send_timeout,
            transcripts: Arc::new(NoopTranscriptSink),
        }
    }

    /// Hand every relayed transcript line to `sink`.
    #[must_use]
    pub fn with_transcript_sink(mut self, sink: Arc<dyn TranscriptSink>) -> Self {
        self.transcripts = sink;
        self
    }

    /// Add a connection to `room_id`, creating the room if needed, then announce
    /// it to everyone in the room (the newcomer included).
    pub async fn join(
        &self,
        room_id: &str,
        participant_id: String,
        display_name: String,
        transport: Transport,
    ) -> Participant {
        let connection = Connection::new(participant_id, display_name, transport);
        let participant = connection.participant();
        let connection_id = connection.connection_id();

        let created = {
            let mut room = self.rooms.entry(room_id.to_string()).or_default();
            let created = room.members.is_empty();
            room.members.push(connection);
            created
        };
        if created {
            gauge!(ROOMS_ACTIVE).set(self.rooms.len() as f64);
        }

        info!(
            room_id,
            participant_id = %participant.id,
            %connection_id,
            "participant joined"
        );

        self.broadcast(room_id, &ServerMessage::joined(&participant.name))
            .await;
        self.broadcast_participants(room_id).await;

        participant
    }

    /// Remove the connection owning `connection_id` and return its display name.
    ///
    /// Drops the room once it is empty. Announcing the departure is left to the
    /// caller.
    pub fn leave(&self, room_id: &str, connection_id: ConnectionId) -> String {
        let (departed, room_removed) = {
            let Entry::Occupied(mut entry) = self.rooms.entry(room_id.to_string()) else {
                return UNKNOWN_PARTICIPANT.to_string();
            };
            let members = &mut entry.get_mut().members;
            let Some(pos) = members
                .iter()
                .position(|c| c.connection_id() == connection_id)
            else {
                return UNKNOWN_PARTICIPANT.to_string();
            };
            let departed = members.remove(pos);
            let now_empty = members.is_empty();
            if now_empty {
                entry.remove();
            }
            (departed, now_empty)
        };

        if room_removed {
            gauge!(ROOMS_ACTIVE).set(self.rooms.len() as f64);
            debug!(room_id, "room emptied and removed");
        }
        info!(
            room_id,
            participant_id = %departed.id,
            %connection_id,
            "participant left"
        );

        departed.display_name
    }

    /// Serialize `message` once and deliver it to every member concurrently.
    ///
    /// Waits for all sends to finish or time out. Per-member failures are
    /// logged and counted, never returned.
    pub async fn broadcast<T: Serialize + ?Sized>(&self, room_id: &str, message: &T) -> FanoutReport {
        self.broadcast_filtered(room_id, None, message).await
    }

    /// Like [`RoomManager::broadcast`], skipping the connection `except`.
    pub async fn broadcast_except<T: Serialize + ?Sized>(
        &self,
        room_id: &str,
        except: ConnectionId,
        message: &T,
    ) -> FanoutReport {
        self.broadcast_filtered(room_id, Some(except), message).await
    }

    /// Deliver `message` to the first member whose participant id is
    /// `participant_id`. Returns whether it was delivered.
    pub async fn send_to_one<T: Serialize + ?Sized>(
        &self,
        room_id: &str,
        participant_id: &str,
        message: &T,
    ) -> bool {
        self.try_send_to_one(room_id, participant_id, message)
            .await
            .is_ok()
    }

    /// [`RoomManager::send_to_one`] with the reason a send did not happen.
    ///
    /// # Errors
    /// [`DeliveryError::NotFound`] when no member has that id, otherwise the
    /// transport's own failure.
    pub async fn try_send_to_one<T: Serialize + ?Sized>(
        &self,
        room_id: &str,
        participant_id: &str,
        message: &T,
    ) -> Result<(), DeliveryError> {
        let target = self.find_transport(room_id, |c| c.id == participant_id);
        self.send_single(room_id, target, message).await
    }

    /// Deliver `message` to the connection behind `connection_id`.
    pub async fn send_to_connection<T: Serialize + ?Sized>(
        &self,
        room_id: &str,
        connection_id: ConnectionId,
        message: &T,
    ) -> bool {
        let target = self.find_transport(room_id, |c| c.connection_id() == connection_id);
        self.send_single(room_id, target, message).await.is_ok()
    }

    /// Current members of `room_id` in join order, or `None` if it doesn't exist.
    pub fn participants(&self, room_id: &str) -> Option<Vec<Participant>> {
        self.rooms
            .get(room_id)
            .map(|room| room.members.iter().map(Connection::participant).collect())
    }

    /// Current members of `room_id` in join order; empty for unknown rooms.
    pub fn snapshot_participants(&self, room_id: &str) -> Vec<Participant> {
        self.participants(room_id).unwrap_or_default()
    }

    /// Set the mute flag on every member claiming `participant_id` and
    /// broadcast the new presence snapshot. Returns the number of members
    /// updated.
    pub async fn set_status(&self, room_id: &str, participant_id: &str, muted: bool) -> usize {
        let updated = {
            let Some(mut room) = self.rooms.get_mut(room_id) else {
                debug!(room_id, participant_id, "status update for missing room");
                return 0;
            };
            let mut updated = 0;
            for member in room.members.iter_mut().filter(|c| c.id == participant_id) {
                member.muted = muted;
                updated += 1;
            }
            updated
        };

        debug!(room_id, participant_id, muted, updated, "status updated");
        self.broadcast_participants(room_id).await;
        updated
    }

    /// Broadcast a `PARTICIPANTS_UPDATE` built from the current members.
    pub async fn broadcast_participants(&self, room_id: &str) -> FanoutReport {
        let participants = self.snapshot_participants(room_id);
        self.broadcast(room_id, &ServerMessage::ParticipantsUpdate { participants })
            .await
    }

    /// Hand a transcript line off to the sink and broadcast it to the room.
    pub async fn relay_transcript(&self, room_id: &str, user_name: &str, text: &str) -> FanoutReport {
        self.transcripts.record(room_id, user_name, text).await;
        self.broadcast(
            room_id,
            &ServerMessage::TranscriptUpdate {
                user_name: user_name.to_string(),
                text: text.to_string(),
            },
        )
        .await
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn participant_count(&self) -> usize {
        self.rooms.iter().map(|room| room.members.len()).sum()
    }

    pub fn contains_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    fn find_transport(
        &self,
        room_id: &str,
        predicate: impl Fn(&Connection) -> bool,
    ) -> Option<Transport> {
        self.rooms.get(room_id).and_then(|room| {
            room.members
                .iter()
                .find(|c| predicate(c))
                .map(|c| c.transport().clone())
        })
    }

    async fn broadcast_filtered<T: Serialize + ?Sized>(
        &self,
        room_id: &str,
        except: Option<ConnectionId>,
        message: &T,
    ) -> FanoutReport {
        let Some(frame) = encode(message) else {
            return FanoutReport::default();
        };
        let recipients: Vec<Transport> = self
            .rooms
            .get(room_id)
            .map(|room| {
                room.members
                    .iter()
                    .filter(|c| Some(c.connection_id()) != except)
                    .map(|c| c.transport().clone())
                    .collect()
            })
            .unwrap_or_default();

        self.fan_out(room_id, frame, recipients).await
    }

    async fn send_single<T: Serialize + ?Sized>(
        &self,
        room_id: &str,
        target: Option<Transport>,
        message: &T,
    ) -> Result<(), DeliveryError> {
        let transport = target.ok_or(DeliveryError::NotFound)?;
        let frame = encode(message).ok_or(DeliveryError::Unencodable)?;
        match transport.deliver(frame, self.send_timeout).await {
            Ok(()) => {
                counter!(DELIVERY_OK).increment(1);
                Ok(())
            },
            Err(e) => {
                counter!(DELIVERY_FAILED).increment(1);
                warn!(room_id, connection_id = %transport.id(), "targeted send failed: {}", e);
                Err(e)
            },
        }
    }

    async fn fan_out(&self, room_id: &str, frame: Frame, recipients: Vec<Transport>) -> FanoutReport {
        let mut report = FanoutReport::default();
        if recipients.is_empty() {
            return report;
        }

        // One task per recipient so a stalled client only holds up itself
        let mut send_tasks = JoinSet::new();
        for transport in recipients {
            let frame = frame.clone();
            let timeout = self.send_timeout;
            send_tasks.spawn(async move {
                let result = transport.deliver(frame, timeout).await;
                (transport.id(), result)
            });
        }

        while let Some(result) = send_tasks.join_next().await {
            match result {
                Ok((_, Ok(()))) => report.delivered += 1,
                Ok((connection_id, Err(e))) => {
                    report.failed += 1;
                    warn!(room_id, %connection_id, "broadcast delivery failed: {}", e);
                },
                Err(e) => {
                    report.failed += 1;
                    warn!(room_id, "broadcast send task failed: {}", e);
                },
            }
        }

        counter!(DELIVERY_OK).increment(report.delivered as u64);
        if report.failed > 0 {
            counter!(DELIVERY_FAILED).increment(report.failed as u64);
        }
        report
    }
}

fn encode<T: Serialize + ?Sized>(message: &T) -> Option<Frame> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Frame::from(json)),
        Err(e) => {
            warn!("failed to serialize outbound message: {}", e);
            None
        },
    }
}
