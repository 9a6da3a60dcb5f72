//! Fan-out engine
//!
//! [`FanoutEngine`] ties the pieces together: the track registry, the peer
//! registry, the playout thread and the signaling dispatcher.
//!
//! All shared state (tracks, peers, sender queues) lives behind one
//! `parking_lot` mutex that the playout thread also uses for its condition
//! variable. Control operations (track registration, peer creation and
//! removal, signaling) are additionally serialized by an async mutex so that
//! the network round-trips they perform never happen with the shared lock
//! held.

use crate::config::FanoutConfig;
use crate::media::{TimeBase, TrackRegistry, TrackTemplate};
use crate::peer::{PeerInfo, PeerRegistry, SenderStats};
use crate::peer::sender::{DropReason, EnqueueOutcome};
use crate::playout::PlayoutScheduler;
use crate::transport::{PeerEvent, SessionFactory, SignalingChannel};
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Everything guarded by the shared lock
pub(crate) struct EngineState {
    pub(crate) tracks: TrackRegistry,
    pub(crate) peers: PeerRegistry,
    pub(crate) shutdown: bool,
}

/// Shared lock plus the playout thread's wake condition
pub(crate) struct SharedState {
    pub(crate) state: Mutex<EngineState>,
    pub(crate) wake: Condvar,
}

pub(crate) struct EngineInner {
    pub(crate) config: FanoutConfig,
    pub(crate) shared: Arc<SharedState>,
    pub(crate) factory: Arc<dyn SessionFactory>,
    pub(crate) signaling: Arc<dyn SignalingChannel>,
    /// Serializes control operations
    pub(crate) control: tokio::sync::Mutex<()>,
    pub(crate) events_tx: mpsc::UnboundedSender<PeerEvent>,
    pub(crate) scheduler: PlayoutScheduler,
}

/// Multi-viewer H.264 fan-out engine
pub struct FanoutEngine {
    inner: Arc<EngineInner>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl FanoutEngine {
    /// Create an engine and start its playout thread
    ///
    /// Must be called from within a tokio runtime; session events are
    /// processed on a task spawned here.
    pub fn new(
        config: FanoutConfig,
        factory: Arc<dyn SessionFactory>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(SharedState {
            state: Mutex::new(EngineState {
                tracks: TrackRegistry::new(config.parameter_set_scope),
                peers: PeerRegistry::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
        });
        let scheduler = PlayoutScheduler::start(Arc::clone(&shared))?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!(
            "Fan-out engine created (queue_capacity={}, scope={:?}, legacy_viewer={:?})",
            config.queue_capacity, config.parameter_set_scope, config.legacy_viewer_id
        );

        let inner = Arc::new(EngineInner {
            config,
            shared,
            factory,
            signaling,
            control: tokio::sync::Mutex::new(()),
            events_tx,
            scheduler,
        });
        let event_task = tokio::spawn(Self::event_loop(Arc::downgrade(&inner), events_rx));

        Ok(Self {
            inner,
            event_task: Mutex::new(Some(event_task)),
        })
    }

    async fn event_loop(inner: Weak<EngineInner>, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.handle_session_event(event).await;
        }
        debug!("Session event loop finished");
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.inner.config
    }

    /// Register a track and provision it on every existing peer
    ///
    /// Returns false if a track with the same name already exists.
    pub async fn register_track(&self, template: TrackTemplate) -> bool {
        let _guard = self.inner.control.lock().await;
        self.inner.register_track(template).await
    }

    /// Register an H.264 track using the configured clock, tick and payload type
    ///
    /// `tick` overrides the configured per-frame increment.
    pub async fn register(
        &self,
        mid: &str,
        stream_id: &str,
        track_id: &str,
        ssrc: u32,
        tick: Option<u32>,
    ) -> bool {
        let config = &self.inner.config;
        let template = TrackTemplate::new(
            mid,
            stream_id,
            track_id,
            ssrc,
            tick.unwrap_or(config.default_tick),
        )
        .with_clock_rate(config.default_clock_rate)
        .with_payload_type(config.payload_type);
        self.register_track(template).await
    }

    /// Remove a track and close its senders on every peer
    ///
    /// Returns false if no such track exists.
    pub async fn unregister_track(&self, mid: &str) -> bool {
        let _guard = self.inner.control.lock().await;
        self.inner.unregister_track(mid).await
    }

    /// Normalize one encoded access unit and queue it for every open sender
    ///
    /// Never blocks on delivery. Returns the number of senders that queued
    /// the frame; an unknown track queues nothing.
    pub fn ingest(&self, mid: &str, payload: &[u8], pts: Option<i64>, time_base: TimeBase) -> usize {
        let gate = self.inner.config.gate_on_keyframe;
        let now = Instant::now();
        let mut queued = 0;

        {
            let mut guard = self.inner.shared.state.lock();
            let state = &mut *guard;
            let Some((_, frame)) = state.tracks.normalize(mid, payload) else {
                trace!("Dropping frame for unknown track '{}'", mid);
                return 0;
            };
            if frame.is_empty() {
                return 0;
            }

            for peer in state.peers.iter_mut() {
                let Some(sender) = peer.senders.get_mut(mid) else {
                    continue;
                };
                match sender.enqueue(&frame, pts, time_base, now, gate) {
                    EnqueueOutcome::Queued { .. } => queued += 1,
                    EnqueueOutcome::Dropped(DropReason::TrackClosed) => {
                        sender.discard();
                    }
                    EnqueueOutcome::Dropped(DropReason::AwaitingKeyframe) => {}
                }
            }
        }

        if queued > 0 {
            self.inner.scheduler.notify();
        }
        queued
    }

    /// Handle one inbound signaling message (text, or binary decoded as UTF-8)
    pub async fn on_signaling_message(&self, text: &str) {
        let _guard = self.inner.control.lock().await;
        self.inner.on_signaling_message(text).await;
    }

    /// Create a peer for `viewer_id` unless one exists; returns true if created
    pub async fn ensure_peer(&self, viewer_id: &str) -> Result<bool> {
        let _guard = self.inner.control.lock().await;
        self.inner.ensure_peer(viewer_id).await
    }

    /// Tear down a viewer's peer; returns false if it did not exist
    pub async fn remove_peer(&self, viewer_id: &str) -> bool {
        let _guard = self.inner.control.lock().await;
        self.inner.remove_peer(viewer_id).await
    }

    pub fn sender_stats(&self, viewer_id: &str, mid: &str) -> Option<SenderStats> {
        self.inner
            .shared
            .state
            .lock()
            .peers
            .get(viewer_id)
            .and_then(|peer| peer.sender_stats(mid))
    }

    pub fn peer_info(&self, viewer_id: &str) -> Option<PeerInfo> {
        self.inner
            .shared
            .state
            .lock()
            .peers
            .get(viewer_id)
            .map(|peer| peer.info())
    }

    pub fn is_offer_in_flight(&self, viewer_id: &str) -> bool {
        self.inner
            .shared
            .state
            .lock()
            .peers
            .get(viewer_id)
            .map(|peer| peer.offer_in_flight())
            .unwrap_or(false)
    }

    /// Connected viewer ids, sorted
    pub fn viewer_ids(&self) -> Vec<String> {
        self.inner.shared.state.lock().peers.ids()
    }

    /// Registered track names, sorted
    pub fn track_names(&self) -> Vec<String> {
        self.inner.shared.state.lock().tracks.names()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.shared.state.lock().peers.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.scheduler.is_running()
    }

    /// Stop the playout thread and close every peer
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.inner.control.lock().await;
        info!("Shutting down fan-out engine");

        if let Some(handle) = self.inner.scheduler.stop() {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| Error::InternalError(format!("Join task failed: {}", e)))?
                .map_err(|_| Error::InternalError("Playout thread panicked".to_string()))?;
        }

        let peers = self.inner.shared.state.lock().peers.drain();
        for peer in peers {
            self.inner.close_peer(peer).await;
        }

        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }

        info!("Fan-out engine shut down");
        Ok(())
    }
}

impl Drop for FanoutEngine {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.get_mut().take() {
            task.abort();
        }
        if self.inner.scheduler.is_running() {
            warn!("Fan-out engine dropped without shutdown");
        }
    }
}
