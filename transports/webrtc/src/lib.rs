//! Multi-viewer WebRTC fan-out for live H.264
//!
//! This crate takes encoded H.264 access units from an external encoder and
//! delivers them to any number of WebRTC viewers, each on its own negotiated
//! session, paced to the wall clock.
//!
//! # Features
//!
//! - **Bitstream repair**: access-unit delimiters are dropped and cached
//!   SPS/PPS are prepended to key frames that lack them
//! - **Track registry**: named tracks are provisioned on every current and
//!   future viewer, with renegotiation when a track is added mid-session
//! - **Paced playout**: one dedicated thread releases each viewer's frames at
//!   the wall-clock instant their timestamps map to
//! - **Bounded latency**: per-sender queues drop their oldest frame when full
//! - **Addressed signaling**: one signaling channel serves many viewers via
//!   `to`/`from` fields
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Encoder ── ingest(mid, access unit, pts) ──┐            │
//! │                                             ↓            │
//! │  FanoutEngine                                            │
//! │  ├─ TrackRegistry (templates + SPS/PPS caches)           │
//! │  ├─ PeerRegistry                                         │
//! │  │   └─ Peer (viewer) ── Sender per track (queue+anchor) │
//! │  ├─ PlayoutScheduler (pacing thread)                     │
//! │  └─ signaling dispatch ⇄ SignalingChannel (WebSocket)    │
//! │     ↓                                                    │
//! │  SessionFactory / MediaSession / TrackSender (webrtc-rs) │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use scopecast_webrtc::{FanoutConfig, ParameterSetScope};
//!
//! let config = FanoutConfig {
//!     queue_capacity: 60,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! assert_eq!(config.parameter_set_scope, ParameterSetScope::PerTrack);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use scopecast_webrtc::{FanoutConfig, FanoutEngine, RtcSessionFactory, TimeBase, WebSocketSignaling};
//! use std::sync::Arc;
//!
//! # async fn example() -> scopecast_webrtc::Result<()> {
//! let config = FanoutConfig::default();
//! let factory = Arc::new(RtcSessionFactory::new(&config).await?);
//! let (signaling, receiver) = WebSocketSignaling::connect("ws://localhost:8080/?role=pub").await?;
//!
//! let engine = Arc::new(FanoutEngine::new(config, factory, signaling)?);
//! tokio::spawn(receiver.run(Arc::clone(&engine)));
//!
//! engine.register("video-raw", "stream", "video-raw", 43, None).await;
//! # let access_unit: Vec<u8> = Vec::new();
//! engine.ingest("video-raw", &access_unit, Some(0), TimeBase::MPEG);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod peer;
pub mod playout;
pub mod signaling;
pub mod transport;

pub use config::{FanoutConfig, ParameterSetScope};
pub use engine::FanoutEngine;
pub use error::{Error, Result};
pub use media::{NormalizedFrame, TimeBase, TrackTemplate};
pub use peer::{PeerInfo, SenderStats};
pub use signaling::{SignalingReceiver, WebSocketSignaling};
pub use transport::rtc::RtcSessionFactory;
pub use transport::{
    MediaSession, SessionEvent, SessionFactory, SessionState, SignalingChannel, TrackSender,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
