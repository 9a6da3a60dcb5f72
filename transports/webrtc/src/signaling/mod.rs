//! Signaling: message protocol, inbound dispatch and the WebSocket channel

mod dispatch;
pub mod protocol;
pub mod websocket;

pub use protocol::{InboundMessage, OutboundMessage};
pub use websocket::{SignalingReceiver, WebSocketSignaling};
