// ============================
// yarn-backend-lib/src/connection.rs
// ============================
//! One participant's live channel and its presence flags.
use crate::error::DeliveryError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use uuid::Uuid;
use yarn_common::Participant;

/// Identifies a transport handle; unique per accepted socket.
pub type ConnectionId = Uuid;

/// A serialized outbound message, shared between all recipients of a broadcast.
pub type Frame = Arc<str>;

/// Sending half of a connection's outbound queue.
///
/// The receiving half belongs to the task that owns the socket sink. Once every
/// `Transport` for a connection is dropped the queue closes and that task exits.
#[derive(Clone, Debug)]
pub struct Transport {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
}

impl Transport {
    /// Create a transport and the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue one frame, waiting at most `timeout` for buffer space.
    pub async fn deliver(&self, frame: Frame, timeout: Duration) -> Result<(), DeliveryError> {
        match time::timeout(timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::Closed),
            Err(_) => Err(DeliveryError::TimedOut),
        }
    }
}

/// A room member.
#[derive(Debug)]
pub struct Connection {
    /// Client-supplied participant id; not unique across connections
    pub id: String,
    pub display_name: String,
    pub muted: bool,
    /// Always true for now
    pub active: bool,
    transport: Transport,
}

impl Connection {
    pub fn new(id: String, display_name: String, transport: Transport) -> Self {
        Self {
            id,
            display_name,
            muted: false,
            active: true,
            transport,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.transport.id()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Presence projection without the transport.
    pub fn participant(&self) -> Participant {
        Participant {
            id: self.id.clone(),
            name: self.display_name.clone(),
            is_muted: self.muted,
            is_active: self.active,
        }
    }
}
