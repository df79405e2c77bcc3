// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_ACTIVE: &str = "ws.active";
pub const ROOMS_ACTIVE: &str = "room.active";
pub const MESSAGES_ROUTED: &str = "router.messages";
pub const DECODE_ERRORS: &str = "router.decode_errors";
pub const DELIVERY_OK: &str = "delivery.ok";
pub const DELIVERY_FAILED: &str = "delivery.failed";
