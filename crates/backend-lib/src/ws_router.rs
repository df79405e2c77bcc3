// ============================
// crates/backend-lib/src/ws_router.rs
// ============================
/** HTTP router for the relay.
This module upgrades `/ws/{room_id}` to a WebSocket, runs the per-connection
receive loop, and serves the small status endpoints. */
use crate::{
    config::Settings,
    connection::{Frame, Transport},
    error::AppError,
    metrics::{WS_ACTIVE, WS_CONNECTION},
    websocket::WebSocketHandler,
    AppState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::HeaderValue,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{Sink, SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use uuid::Uuid;
use yarn_common::Participant;

/// Query parameters accepted when opening a room connection
#[derive(Debug, Default, Deserialize)]
pub struct JoinParams {
    pub participant_id: Option<String>,
    pub display_name: Option<String>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/{room_id}", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/rooms/{room_id}/participants", get(participants_handler))
        .layer(cors_layer(&state.settings))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    let origins = &settings.cors_allowed_origins;
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins.iter().filter_map(|origin| {
            HeaderValue::from_str(origin)
                .inspect_err(|e| warn!("ignoring invalid CORS origin '{}': {}", origin, e))
                .ok()
        }))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Health check endpoint
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Registry totals
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": state.rooms.room_count(),
        "participants": state.rooms.participant_count(),
    }))
}

/// Presence snapshot of one room
async fn participants_handler(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<Vec<Participant>>, AppError> {
    state
        .rooms
        .participants(&room_id)
        .map(Json)
        .ok_or(AppError::RoomNotFound(room_id))
}

/// Handle WebSocket connections
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(params): Query<JoinParams>,
) -> impl IntoResponse {
    let participant_id = params
        .participant_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let display_name = params
        .display_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| state.settings.default_display_name.clone());

    debug!(%room_id, %participant_id, "WebSocket connection attempt");

    ws.on_upgrade(move |socket| handle_socket(socket, state, room_id, participant_id, display_name))
}

/// Run one connection until the client goes away
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    room_id: String,
    participant_id: String,
    display_name: String,
) {
    // Split the socket into sender and receiver
    let (sender, mut receiver) = socket.split();
    let (transport, mut outbound) = Transport::channel(state.settings.channel_capacity);

    counter!(WS_CONNECTION).increment(1);
    gauge!(WS_ACTIVE).increment(1.0);

    // Ends when the connection leaves the registry and its transport is
    // dropped, or when the client stops reading.
    let write_timeout = state.settings.send_timeout();
    let send_task = tokio::spawn(async move {
        let mut sender = sender;
        write_frames(&mut sender, &mut outbound, write_timeout).await
    });

    let mut handler = WebSocketHandler::connect(
        state.rooms.clone(),
        room_id,
        participant_id,
        display_name,
        transport,
    )
    .await;

    // Process incoming messages in arrival order
    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                handler.handle_frame(text.as_str()).await;
            },
            Ok(Message::Close(_)) => {
                debug!(room_id = %handler.room_id(), "client closed connection");
                break;
            },
            Ok(_) => {
                // Binary and ping/pong frames carry nothing for the router
            },
            Err(e) => {
                warn!(room_id = %handler.room_id(), "WebSocket error: {}", e);
                break;
            },
        }
    }

    handler.close().await;

    // Wait for the writer to flush what is left
    if let Err(e) = send_task.await {
        warn!("writer task failed: {}", e);
    }

    gauge!(WS_ACTIVE).decrement(1.0);
    debug!(connection_id = %handler.connection_id(), "WebSocket connection closed");
}

/// Copy queued frames onto the socket sink, then close it.
///
/// Every socket write and the final close are bounded by `write_timeout`, so
/// a client that stops reading can't pin the writer. Returns the number of
/// frames written.
async fn write_frames<S>(
    sink: &mut S,
    outbound: &mut mpsc::Receiver<Frame>,
    write_timeout: Duration,
) -> usize
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut written = 0;
    while let Some(frame) = outbound.recv().await {
        match timeout(write_timeout, sink.send(Message::Text(frame.to_string().into()))).await {
            Ok(Ok(())) => written += 1,
            Ok(Err(e)) => {
                debug!("stopping writer, socket send failed: {}", e);
                break;
            },
            Err(_) => {
                warn!("stopping writer, client not reading");
                break;
            },
        }
    }
    if timeout(write_timeout, sink.close()).await.is_err() {
        debug!("socket close timed out");
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(Settings::default()))
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(create_router(state()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_counts_rooms_and_participants() {
        let state = state();
        let (t1, _rx1) = Transport::channel(8);
        let (t2, _rx2) = Transport::channel(8);
        state.rooms.join("r1", "1".into(), "A".into(), t1).await;
        state.rooms.join("r2", "2".into(), "B".into(), t2).await;

        let (status, body) = get_json(create_router(state), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rooms"], 2);
        assert_eq!(body["participants"], 2);
    }

    #[tokio::test]
    async fn test_participants_snapshot() {
        let state = state();
        let (t1, _rx1) = Transport::channel(8);
        state.rooms.join("r1", "1".into(), "A".into(), t1).await;

        let (status, body) = get_json(create_router(state.clone()), "/rooms/r1/participants").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!([{"id": "1", "name": "A", "isMuted": false, "isActive": true}])
        );

        let (status, body) = get_json(create_router(state), "/rooms/nope/participants").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "ROOM_001");
    }

    /// Sink that never accepts anything, like a client that stopped reading.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = std::convert::Infallible;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_writer_forwards_frames_until_transport_dropped() {
        let (transport, mut outbound) = Transport::channel(4);
        transport
            .deliver(Frame::from(r#"{"type":"STATUS"}"#), Duration::from_millis(50))
            .await
            .unwrap();
        drop(transport);

        let mut sink: Vec<Message> = Vec::new();
        let written = write_frames(&mut sink, &mut outbound, Duration::from_millis(50)).await;
        assert_eq!(written, 1);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].to_text().unwrap(), r#"{"type":"STATUS"}"#);
    }

    #[tokio::test]
    async fn test_writer_gives_up_on_stalled_client() {
        let (transport, mut outbound) = Transport::channel(4);
        transport
            .deliver(Frame::from("{}"), Duration::from_millis(50))
            .await
            .unwrap();

        // transport still alive: only the write timeout can end the writer
        let finished = tokio::time::timeout(
            Duration::from_secs(2),
            write_frames(&mut StalledSink, &mut outbound, Duration::from_millis(20)),
        )
        .await;
        assert_eq!(finished, Ok(0));
        drop(transport);
    }

    #[tokio::test]
    async fn test_plain_get_on_ws_route_is_rejected() {
        let response = create_router(state())
            .oneshot(Request::builder().uri("/ws/r1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
