//! Transport capability interfaces
//!
//! The engine never touches ICE, DTLS or RTP framing directly. It drives
//! sessions, track send objects and the signaling channel through the traits
//! below. [`rtc`] implements them on top of webrtc-rs; tests plug in
//! in-memory fakes.
//!
//! Session callbacks are not free-form closures: every session reports into a
//! [`SessionEvents`] sink, which tags each [`SessionEvent`] with the viewer id
//! that owns the session and forwards it to the engine.

pub mod rtc;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Overall session connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl SessionState {
    /// The session can never deliver media again
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

/// Offer/answer negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

impl DescriptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptionKind::Offer => "offer",
            DescriptionKind::Answer => "answer",
        }
    }
}

/// SDP session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub sdp: String,
}

/// A locally gathered ICE candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCandidate {
    /// Candidate attribute, possibly still carrying an `a=` prefix
    pub candidate: String,
    pub mid: Option<String>,
    pub mline_index: Option<u16>,
}

/// Something a session reports back to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LocalDescription(SessionDescription),
    LocalCandidate(LocalCandidate),
    SignalingStateChanged(SignalingState),
    StateChanged(SessionState),
}

/// A session event tagged with the viewer whose session raised it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub viewer_id: String,
    pub event: SessionEvent,
}

/// Event sink handed to each session at creation
#[derive(Debug, Clone)]
pub struct SessionEvents {
    viewer_id: String,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl SessionEvents {
    pub fn new(viewer_id: &str, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            viewer_id: viewer_id.to_string(),
            tx,
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    /// Forward an event; silently dropped once the engine is gone
    pub fn emit(&self, event: SessionEvent) {
        trace!("Session event for {}: {:?}", self.viewer_id, event);
        let _ = self.tx.send(PeerEvent {
            viewer_id: self.viewer_id.clone(),
            event,
        });
    }
}

/// Options for creating one viewer session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub viewer_id: String,
    /// STUN/TURN URLs; empty means host candidates only
    pub ice_servers: Vec<String>,
    pub enable_ice_tcp: bool,
    pub enable_udp_mux: bool,
}

/// Everything needed to create one outbound track on a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    pub mid: String,
    pub stream_id: String,
    pub track_id: String,
    pub ssrc: u32,
    pub clock_rate: u32,
    pub payload_type: u8,
    pub fmtp: String,
}

/// Per-frame send parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// RTP timestamp of the frame
    pub timestamp: u32,
    pub payload_type: u8,
}

/// Send side of one media track within one session
#[async_trait]
pub trait TrackSender: Send + Sync {
    /// Track is negotiated, connected and not closed
    fn is_open(&self) -> bool;

    /// Packetize and send one Annex-B access unit
    async fn send_frame(&self, payload: Bytes, info: FrameInfo) -> Result<()>;

    /// Stop sending and detach the track from its session
    async fn close(&self) -> Result<()>;
}

/// One negotiated media session with one viewer
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn add_track(&self, descriptor: &TrackDescriptor) -> Result<Arc<dyn TrackSender>>;

    /// Generate and apply a local description; it is reported through
    /// [`SessionEvent::LocalDescription`]
    async fn set_local_description(&self, kind: DescriptionKind) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote candidate bound by media id, m-line index, or both
    async fn add_remote_candidate(
        &self,
        candidate: &str,
        mid: Option<&str>,
        mline_index: Option<u16>,
    ) -> Result<()>;

    fn state(&self) -> SessionState;

    async fn close(&self) -> Result<()>;
}

/// Creates sessions for new viewers
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(
        &self,
        options: &SessionOptions,
        events: SessionEvents,
    ) -> Result<Arc<dyn MediaSession>>;
}

/// Outbound half of the signaling transport; must be callable from any thread
pub trait SignalingChannel: Send + Sync {
    fn send(&self, text: String) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Disconnected.is_terminal());
        assert!(!SessionState::Connected.is_terminal());
    }

    #[test]
    fn test_events_tagged_with_viewer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = SessionEvents::new("v1", tx);
        events.emit(SessionEvent::SignalingStateChanged(SignalingState::Stable));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.viewer_id, "v1");
        assert_eq!(
            event.event,
            SessionEvent::SignalingStateChanged(SignalingState::Stable)
        );
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        SessionEvents::new("v1", tx).emit(SessionEvent::StateChanged(SessionState::Closed));
    }
}
