//! Playout scheduler with a dedicated pacing thread
//!
//! One OS thread services every (viewer, track) sender. Each pass it scans
//! all senders under the shared lock, pops every frame whose wall-clock due
//! time has passed, and releases the lock before handing those frames to
//! the transport. When nothing is due it sleeps on the shared condition
//! variable until the earliest head-of-queue deadline, or indefinitely if
//! every queue is empty. Any wake-up triggers a full re-scan.
//!
//! The thread owns a current-thread tokio runtime so it can drive the async
//! [`TrackSender::send_frame`] without depending on the caller's runtime.

use crate::engine::SharedState;
use crate::transport::{FrameInfo, TrackSender};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Log a delivery summary every this many frames
const SUMMARY_INTERVAL: u64 = 300;

/// Frames released for one sender during one pass
struct Dispatch {
    viewer_id: String,
    mid: String,
    track: Arc<dyn TrackSender>,
    frames: Vec<(Bytes, FrameInfo)>,
}

/// Handle to the pacing thread
pub struct PlayoutScheduler {
    shared: Arc<SharedState>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PlayoutScheduler {
    /// Spawn the pacing thread
    pub(crate) fn start(shared: Arc<SharedState>) -> Result<Self> {
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("playout-scheduler".to_string())
            .spawn(move || Self::run(thread_shared))
            .map_err(|e| {
                Error::InternalError(format!("Failed to spawn playout thread: {}", e))
            })?;

        Ok(Self {
            shared,
            thread_handle: Mutex::new(Some(handle)),
        })
    }

    /// Wake the thread so it re-scans the senders
    pub fn notify(&self) {
        self.shared.wake.notify_all();
    }

    /// Ask the thread to exit; returns its handle for joining
    ///
    /// Only the first call yields a handle.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
        self.thread_handle.lock().take()
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    fn run(shared: Arc<SharedState>) {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                warn!("Failed to create tokio runtime for playout thread: {}", e);
                return;
            }
        };

        info!("Playout thread started");
        let mut delivered: u64 = 0;
        let mut state = shared.state.lock();

        loop {
            if state.shutdown {
                break;
            }

            let now = Instant::now();
            let mut batch: Vec<Dispatch> = Vec::new();
            let mut next_due: Option<Instant> = None;

            for peer in state.peers.iter_mut() {
                let viewer_id = peer.viewer_id().to_string();
                for (mid, sender) in peer.senders.iter_mut() {
                    if !sender.has_pending() {
                        continue;
                    }
                    if !sender.is_open() {
                        sender.discard();
                        continue;
                    }

                    let due = sender.pop_due(now);
                    if !due.is_empty() {
                        let frames = due
                            .into_iter()
                            .map(|item| {
                                let info = sender.frame_info(&item);
                                (item.data, info)
                            })
                            .collect();
                        batch.push(Dispatch {
                            viewer_id: viewer_id.clone(),
                            mid: mid.clone(),
                            track: Arc::clone(sender.track()),
                            frames,
                        });
                    }

                    if let Some(at) = sender.head_due() {
                        next_due = Some(next_due.map_or(at, |n| n.min(at)));
                    }
                }
            }

            if !batch.is_empty() {
                // Transport I/O happens without the shared lock
                MutexGuard::unlocked(&mut state, || {
                    for dispatch in batch {
                        delivered += Self::deliver(&rt, dispatch, delivered);
                    }
                });
                continue;
            }

            match next_due {
                None => shared.wake.wait(&mut state),
                Some(at) => {
                    let _ = shared.wake.wait_until(&mut state, at);
                }
            }
        }

        info!("Playout thread shutting down (delivered {} frames)", delivered);
    }

    fn deliver(rt: &tokio::runtime::Runtime, dispatch: Dispatch, delivered_so_far: u64) -> u64 {
        let Dispatch {
            viewer_id,
            mid,
            track,
            frames,
        } = dispatch;

        let mut sent = 0;
        for (payload, info) in frames {
            let size = payload.len();
            match rt.block_on(track.send_frame(payload, info)) {
                Ok(()) => {
                    sent += 1;
                    let total = delivered_so_far + sent;
                    if total == 1 {
                        info!(
                            "First frame delivered to {} on '{}' (ts={}, {} bytes)",
                            viewer_id, mid, info.timestamp, size
                        );
                    } else if total % SUMMARY_INTERVAL == 0 {
                        debug!("Delivered {} frames (latest: {} on '{}')", total, viewer_id, mid);
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to send frame to {} on '{}' (ts={}): {}",
                        viewer_id, mid, info.timestamp, e
                    );
                }
            }
        }
        sent
    }
}

impl Drop for PlayoutScheduler {
    fn drop(&mut self) {
        // Let the thread exit on its own if nobody joined it
        if self.thread_handle.get_mut().is_some() {
            self.shared.state.lock().shutdown = true;
            self.shared.wake.notify_all();
        }
    }
}
