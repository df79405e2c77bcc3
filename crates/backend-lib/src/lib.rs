// ============================
// yarn-backend-lib/src/lib.rs
// ============================
//! Core functionality for the Yarn room relay: rooms, connections and the
//! WebSocket message router.

pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod rooms;
pub mod transcript;
pub mod websocket;
pub mod ws_router;

use crate::config::Settings;
use crate::rooms::RoomManager;
use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Room registry
    pub rooms: Arc<RoomManager>,
    /// Configuration settings
    pub settings: Arc<Settings>,
}

impl AppState {
    /// Create application state with an empty room registry
    pub fn new(settings: Settings) -> Self {
        let rooms = RoomManager::new(settings.send_timeout());
        Self::with_rooms(settings, rooms)
    }

    /// Create application state around an existing room manager
    pub fn with_rooms(settings: Settings, rooms: RoomManager) -> Self {
        Self {
            rooms: Arc::new(rooms),
            settings: Arc::new(settings),
        }
    }
}
