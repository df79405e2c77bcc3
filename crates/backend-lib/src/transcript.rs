//! Hand-off point for transcript lines relayed through rooms.
use async_trait::async_trait;

/// Receives every transcript line the relay broadcasts.
///
/// Implementations live outside the relay (for example a store the AI query
/// service reads from). The relay itself keeps no history.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn record(&self, room_id: &str, user_name: &str, text: &str);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTranscriptSink;

#[async_trait]
impl TranscriptSink for NoopTranscriptSink {
    async fn record(&self, _room_id: &str, _user_name: &str, _text: &str) {}
}
