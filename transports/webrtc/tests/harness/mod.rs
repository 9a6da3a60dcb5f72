//! Fan-out engine test harness
//!
//! Provides in-memory implementations of the transport seams so engine
//! behavior can be exercised without ICE or sockets:
//! - `FakeSessionFactory` / `FakeSession`: record every call and let tests
//!   drive session events (answer applied, connected, failed)
//! - `FakeTrack`: records every frame with the instant it was sent
//! - `RecordingSignaling`: captures outbound signaling messages
//!
//! Basic usage pattern:
//!
//! 1. Create a `Harness` with a `FanoutConfig`
//! 2. Drive it with `register`, `ingest` and signaling messages
//! 3. Use `wait_for` to await asynchronous effects
//! 4. Call `harness.shutdown()` to clean up

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use scopecast_webrtc::transport::{
    DescriptionKind, FrameInfo, LocalCandidate, SessionDescription, SessionEvent, SessionEvents,
    SessionOptions, SignalingState, TrackDescriptor,
};
use scopecast_webrtc::{
    Error, FanoutConfig, FanoutEngine, MediaSession, Result, SessionFactory, SessionState,
    SignalingChannel, TrackSender,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result type for test harness operations
pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Engine error: {0}")]
    Engine(#[from] Error),
}

/// One frame handed to a fake track
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub data: Bytes,
    pub info: FrameInfo,
    pub at: Instant,
}

/// Track send object that records frames
pub struct FakeTrack {
    pub descriptor: TrackDescriptor,
    open: AtomicBool,
    closed: AtomicBool,
    frames: Mutex<Vec<SentFrame>>,
}

impl FakeTrack {
    fn new(descriptor: TrackDescriptor) -> Self {
        Self {
            descriptor,
            open: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            frames: Mutex::new(Vec::new()),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn frames(&self) -> Vec<SentFrame> {
        self.frames.lock().clone()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn timestamps(&self) -> Vec<u32> {
        self.frames.lock().iter().map(|f| f.info.timestamp).collect()
    }
}

#[async_trait]
impl TrackSender for FakeTrack {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.is_closed()
    }

    async fn send_frame(&self, payload: Bytes, info: FrameInfo) -> Result<()> {
        if !self.is_open() {
            return Err(Error::TrackClosed(self.descriptor.mid.clone()));
        }
        self.frames.lock().push(SentFrame {
            data: payload,
            info,
            at: Instant::now(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// A remote candidate as applied to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCandidate {
    pub candidate: String,
    pub mid: Option<String>,
    pub mline_index: Option<u16>,
}

/// Session that records calls and lets tests raise events
pub struct FakeSession {
    events: SessionEvents,
    state: Mutex<SessionState>,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
    offers: AtomicUsize,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    remote_candidates: Mutex<Vec<RemoteCandidate>>,
    closed: AtomicBool,
}

impl FakeSession {
    fn new(events: SessionEvents) -> Self {
        Self {
            events,
            state: Mutex::new(SessionState::New),
            tracks: Mutex::new(Vec::new()),
            offers: AtomicUsize::new(0),
            remote_descriptions: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn viewer_id(&self) -> &str {
        self.events.viewer_id()
    }

    pub fn offer_count(&self) -> usize {
        self.offers.load(Ordering::Acquire)
    }

    pub fn track(&self, mid: &str) -> Option<Arc<FakeTrack>> {
        self.tracks
            .lock()
            .iter()
            .rev()
            .find(|t| t.descriptor.mid == mid)
            .cloned()
    }

    pub fn track_mids(&self) -> Vec<String> {
        self.tracks
            .lock()
            .iter()
            .map(|t| t.descriptor.mid.clone())
            .collect()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote_descriptions.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<RemoteCandidate> {
        self.remote_candidates.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Move to `state` and report it to the engine
    pub fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
        self.events.emit(SessionEvent::StateChanged(state));
    }

    /// Report a gathered local candidate
    pub fn gather_candidate(&self, candidate: &str, mid: &str) {
        self.events.emit(SessionEvent::LocalCandidate(LocalCandidate {
            candidate: candidate.to_string(),
            mid: Some(mid.to_string()),
            mline_index: Some(0),
        }));
    }
}

#[async_trait]
impl MediaSession for FakeSession {
    async fn add_track(&self, descriptor: &TrackDescriptor) -> Result<Arc<dyn TrackSender>> {
        let track = Arc::new(FakeTrack::new(descriptor.clone()));
        self.tracks.lock().push(Arc::clone(&track));
        Ok(track)
    }

    async fn set_local_description(&self, kind: DescriptionKind) -> Result<()> {
        let n = self.offers.fetch_add(1, Ordering::AcqRel) + 1;
        self.events
            .emit(SessionEvent::SignalingStateChanged(SignalingState::HaveLocalOffer));
        self.events.emit(SessionEvent::LocalDescription(SessionDescription {
            kind,
            sdp: format!("v=0\r\no=- {} {} IN IP4 127.0.0.1\r\n", n, n),
        }));
        Ok(())
    }

    /// Applying an answer completes negotiation and connects the session
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.remote_descriptions.lock().push(description);
        self.events
            .emit(SessionEvent::SignalingStateChanged(SignalingState::Stable));
        if *self.state.lock() != SessionState::Connected {
            self.set_state(SessionState::Connected);
        }
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: &str,
        mid: Option<&str>,
        mline_index: Option<u16>,
    ) -> Result<()> {
        self.remote_candidates.lock().push(RemoteCandidate {
            candidate: candidate.to_string(),
            mid: mid.map(str::to_string),
            mline_index,
        });
        Ok(())
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        *self.state.lock() = SessionState::Closed;
        Ok(())
    }
}

/// Factory that remembers the latest session created per viewer
#[derive(Default)]
pub struct FakeSessionFactory {
    sessions: Mutex<HashMap<String, Arc<FakeSession>>>,
    created: AtomicUsize,
    options: Mutex<Vec<SessionOptions>>,
}

impl FakeSessionFactory {
    pub fn session(&self, viewer_id: &str) -> Option<Arc<FakeSession>> {
        self.sessions.lock().get(viewer_id).cloned()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    pub fn options(&self) -> Vec<SessionOptions> {
        self.options.lock().clone()
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn create_session(
        &self,
        options: &SessionOptions,
        events: SessionEvents,
    ) -> Result<Arc<dyn MediaSession>> {
        let session = Arc::new(FakeSession::new(events));
        self.sessions
            .lock()
            .insert(options.viewer_id.clone(), Arc::clone(&session));
        self.options.lock().push(options.clone());
        self.created.fetch_add(1, Ordering::AcqRel);
        Ok(session)
    }
}

/// Signaling channel that keeps every outbound message
#[derive(Default)]
pub struct RecordingSignaling {
    messages: Mutex<Vec<String>>,
}

impl RecordingSignaling {
    pub fn messages(&self) -> Vec<Value> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| serde_json::from_str(m).ok())
            .collect()
    }

    /// Messages of one `type`
    pub fn of_type(&self, kind: &str) -> Vec<Value> {
        self.messages()
            .into_iter()
            .filter(|m| m["type"] == kind)
            .collect()
    }
}

impl SignalingChannel for RecordingSignaling {
    fn send(&self, text: String) -> Result<()> {
        self.messages.lock().push(text);
        Ok(())
    }
}

/// Engine wired to fakes
pub struct Harness {
    pub engine: Arc<FanoutEngine>,
    pub factory: Arc<FakeSessionFactory>,
    pub signaling: Arc<RecordingSignaling>,
}

impl Harness {
    pub fn new(config: FanoutConfig) -> HarnessResult<Self> {
        init_tracing();
        let factory = Arc::new(FakeSessionFactory::default());
        let signaling = Arc::new(RecordingSignaling::default());
        let engine = FanoutEngine::new(config, factory.clone(), signaling.clone())?;
        Ok(Self {
            engine: Arc::new(engine),
            factory,
            signaling,
        })
    }

    /// Register an H.264 track with the default tick
    pub async fn register(&self, mid: &str, ssrc: u32) -> bool {
        self.engine.register(mid, "s", "t", ssrc, None).await
    }

    pub async fn need_offer(&self, viewer_id: &str) {
        self.engine
            .on_signaling_message(&format!(r#"{{"type":"need-offer","to":"{}"}}"#, viewer_id))
            .await;
    }

    pub async fn answer(&self, viewer_id: &str) {
        self.engine
            .on_signaling_message(&format!(
                r#"{{"type":"answer","sdp":"v=0\r\n","from":"{}"}}"#,
                viewer_id
            ))
            .await;
    }

    /// Create a peer, answer its offer and wait until negotiation settles
    pub async fn connect(&self, viewer_id: &str) -> HarnessResult<Arc<FakeSession>> {
        self.need_offer(viewer_id).await;
        let engine = Arc::clone(&self.engine);
        let id = viewer_id.to_string();
        let session = self
            .factory
            .session(viewer_id)
            .ok_or_else(|| HarnessError::Timeout(format!("no session for {}", viewer_id)))?;
        self.answer(viewer_id).await;
        wait_for("negotiation stable", move || !engine.is_offer_in_flight(&id)).await?;
        Ok(session)
    }

    pub async fn shutdown(&self) -> HarnessResult<()> {
        self.engine.shutdown().await?;
        Ok(())
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_for<F>(what: &str, condition: F) -> HarnessResult<()>
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        if Instant::now() >= deadline {
            return Err(HarnessError::Timeout(what.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Synthetic H.264 access units
pub mod media {
    pub const AUD: &[u8] = &[0, 0, 0, 1, 0x09, 0xf0];
    pub const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0xc0, 0x1f, 0xda];
    pub const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80];
    pub const IDR: &[u8] = &[0, 0, 1, 0x65, 0x88, 0x84, 0x00, 0x33];
    pub const SLICE: &[u8] = &[0, 0, 1, 0x41, 0x9a, 0x02, 0x04];

    /// AUD + SPS + PPS + IDR
    pub fn full_keyframe() -> Vec<u8> {
        [AUD, SPS, PPS, IDR].concat()
    }

    /// AUD + IDR without parameter sets
    pub fn bare_keyframe() -> Vec<u8> {
        [AUD, IDR].concat()
    }

    /// AUD + non-IDR slice
    pub fn delta_frame() -> Vec<u8> {
        [AUD, SLICE].concat()
    }

    /// NAL unit type codes of an Annex-B stream
    pub fn nal_types(data: &[u8]) -> Vec<u8> {
        scopecast_webrtc::media::split_annexb(data)
            .into_iter()
            .map(|nal| nal[0] & 0x1f)
            .collect()
    }
}
