//! Per-(viewer, track) sender state
//!
//! A sender owns the bounded frame queue for one track on one viewer's
//! session, and the anchor that maps that track's media clock onto the
//! viewer's wall clock. The anchor is fixed by the first frame the sender
//! ever accepts:
//!
//! ```text
//! due(ts) = base_wall + (ts - base_timestamp) / clock_rate
//! ts(pts) = base_timestamp + rescale(pts - base_pts)
//! ```

use crate::media::timestamp::{ticks_to_duration, wire_timestamp, TimeBase};
use crate::media::{NormalizedFrame, TrackTemplate};
use crate::playout::queue::{EncodedItem, FrameQueue};
use crate::transport::{FrameInfo, TrackSender};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Media-time to wall-clock mapping, set once per sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    /// pts of the first accepted frame (if it had one)
    pub base_pts: Option<i64>,
    /// Media timestamp assigned to the first accepted frame
    pub base_timestamp: u64,
    /// Wall-clock instant the first frame was accepted
    pub base_wall: Instant,
}

/// Why a frame was not queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Track send object is closed or not connected yet
    TrackClosed,
    /// Sender has no anchor yet and keyframe gating is on
    AwaitingKeyframe,
}

/// Result of offering one frame to a sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { timestamp: u64, evicted: bool },
    Dropped(DropReason),
}

/// Counters for one sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenderStats {
    pub queued: usize,
    pub evicted: u64,
    pub emitted: u64,
    pub last_emitted: Option<u64>,
}

/// Send state of one track within one peer
pub struct Sender {
    mid: String,
    track: Arc<dyn TrackSender>,
    clock_rate: u32,
    tick: u32,
    payload_type: u8,
    anchor: Option<Anchor>,
    last_timestamp: Option<u64>,
    last_emitted: Option<u64>,
    queue: FrameQueue,
    emitted: u64,
    closed: bool,
}

impl Sender {
    pub fn new(template: &TrackTemplate, track: Arc<dyn TrackSender>, queue_capacity: usize) -> Self {
        Self {
            mid: template.mid.clone(),
            track,
            clock_rate: template.clock_rate,
            tick: template.tick,
            payload_type: template.payload_type,
            anchor: None,
            last_timestamp: None,
            last_emitted: None,
            queue: FrameQueue::new(queue_capacity),
            emitted: 0,
            closed: false,
        }
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn track(&self) -> &Arc<dyn TrackSender> {
        &self.track
    }

    pub fn anchor(&self) -> Option<&Anchor> {
        self.anchor.as_ref()
    }

    pub fn is_open(&self) -> bool {
        !self.closed && self.track.is_open()
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Offer a normalized frame for delivery
    pub fn enqueue(
        &mut self,
        frame: &NormalizedFrame,
        pts: Option<i64>,
        time_base: TimeBase,
        now: Instant,
        gate_on_keyframe: bool,
    ) -> EnqueueOutcome {
        if !self.is_open() {
            return EnqueueOutcome::Dropped(DropReason::TrackClosed);
        }
        if gate_on_keyframe && self.anchor.is_none() && !frame.is_keyframe {
            return EnqueueOutcome::Dropped(DropReason::AwaitingKeyframe);
        }

        let timestamp = match self.anchor {
            None => {
                let anchor = Anchor {
                    base_pts: pts,
                    base_timestamp: 0,
                    base_wall: now,
                };
                debug!(
                    "Sender '{}' anchored (pts={:?}, clock={})",
                    self.mid, pts, self.clock_rate
                );
                self.anchor = Some(anchor);
                anchor.base_timestamp
            }
            Some(anchor) => self.next_timestamp(&anchor, pts, time_base),
        };
        self.last_timestamp = Some(timestamp);

        let evicted = self
            .queue
            .push(EncodedItem {
                data: frame.data.clone(),
                timestamp,
                is_keyframe: frame.is_keyframe,
            })
            .is_some();
        if evicted {
            debug!(
                "Sender '{}' queue full, evicted oldest frame (total evicted: {})",
                self.mid,
                self.queue.evicted()
            );
        }

        EnqueueOutcome::Queued { timestamp, evicted }
    }

    fn next_timestamp(&self, anchor: &Anchor, pts: Option<i64>, time_base: TimeBase) -> u64 {
        let last = self.last_timestamp.unwrap_or(anchor.base_timestamp);

        let mapped = match (pts, anchor.base_pts) {
            (Some(pts), Some(base_pts)) => pts
                .checked_sub(base_pts)
                .and_then(|delta| time_base.rescale(delta, self.clock_rate))
                .map(|delta| (anchor.base_timestamp as i64).saturating_add(delta).max(0) as u64),
            _ => None,
        };
        let candidate = mapped.unwrap_or(last + self.tick as u64);

        // Never step backwards or repeat a timestamp
        if candidate <= last {
            last + 1
        } else {
            candidate
        }
    }

    /// Wall-clock instant at which a frame with `timestamp` is due
    pub fn due_at(&self, timestamp: u64) -> Option<Instant> {
        let anchor = self.anchor.as_ref()?;
        let offset = timestamp.saturating_sub(anchor.base_timestamp);
        Some(anchor.base_wall + ticks_to_duration(offset, self.clock_rate))
    }

    /// Due instant of the queue head, if any
    pub fn head_due(&self) -> Option<Instant> {
        self.queue.front().and_then(|item| self.due_at(item.timestamp))
    }

    /// Pop every queued frame that is due at `now`, in order
    pub fn pop_due(&mut self, now: Instant) -> Vec<EncodedItem> {
        let mut due = Vec::new();
        while let Some(at) = self.head_due() {
            if at > now {
                break;
            }
            if let Some(item) = self.queue.pop() {
                self.last_emitted = Some(item.timestamp);
                self.emitted += 1;
                due.push(item);
            }
        }
        due
    }

    /// RTP send parameters for a popped item
    pub fn frame_info(&self, item: &EncodedItem) -> FrameInfo {
        FrameInfo {
            timestamp: wire_timestamp(item.timestamp),
            payload_type: self.payload_type,
        }
    }

    /// Drop queued frames without sending them
    pub fn discard(&mut self) -> usize {
        let n = self.queue.clear();
        if n > 0 {
            debug!("Sender '{}' discarded {} queued frames", self.mid, n);
        }
        n
    }

    /// Stop accepting frames and drop the queue; returns the track to close
    pub fn close(&mut self) -> Arc<dyn TrackSender> {
        self.closed = true;
        self.discard();
        Arc::clone(&self.track)
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            queued: self.queue.len(),
            evicted: self.queue.evicted(),
            emitted: self.emitted,
            last_emitted: self.last_emitted,
        }
    }

    /// Timestamps currently queued, oldest first
    pub fn queued_timestamps(&self) -> Vec<u64> {
        self.queue.iter().map(|i| i.timestamp).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct StubTrack {
        open: AtomicBool,
    }

    #[async_trait]
    impl TrackSender for StubTrack {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }

        async fn send_frame(&self, _payload: Bytes, _info: FrameInfo) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.open.store(false, Ordering::Release);
            Ok(())
        }
    }

    fn sender(capacity: usize) -> (Sender, Arc<StubTrack>) {
        let track = Arc::new(StubTrack {
            open: AtomicBool::new(true),
        });
        let template = TrackTemplate::new("cam1", "s", "t", 10, 3003);
        (Sender::new(&template, track.clone(), capacity), track)
    }

    fn frame(keyframe: bool) -> NormalizedFrame {
        NormalizedFrame {
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            is_keyframe: keyframe,
            has_sps: false,
            has_pps: false,
        }
    }

    fn queued_ts(outcome: EnqueueOutcome) -> u64 {
        match outcome {
            EnqueueOutcome::Queued { timestamp, .. } => timestamp,
            other => panic!("expected queued, got {:?}", other),
        }
    }

    #[test]
    fn test_anchor_set_once() {
        let (mut s, _) = sender(90);
        let t0 = Instant::now();
        s.enqueue(&frame(true), Some(1000), TimeBase::MPEG, t0, false);
        let anchor = *s.anchor().unwrap();
        assert_eq!(anchor.base_pts, Some(1000));
        assert_eq!(anchor.base_wall, t0);

        s.enqueue(&frame(false), Some(4003), TimeBase::MPEG, t0 + Duration::from_millis(5), false);
        assert_eq!(*s.anchor().unwrap(), anchor);
    }

    #[test]
    fn test_timestamps_follow_pts() {
        let (mut s, _) = sender(90);
        let now = Instant::now();
        let tb = TimeBase::new(1001, 30_000);
        assert_eq!(queued_ts(s.enqueue(&frame(true), Some(7), tb, now, false)), 0);
        assert_eq!(queued_ts(s.enqueue(&frame(false), Some(8), tb, now, false)), 3003);
        assert_eq!(queued_ts(s.enqueue(&frame(false), Some(10), tb, now, false)), 9009);
    }

    #[test]
    fn test_unmappable_pts_advances_by_tick() {
        let (mut s, _) = sender(90);
        let now = Instant::now();
        let tb = TimeBase::new(i64::MAX / 2, 1);
        assert_eq!(queued_ts(s.enqueue(&frame(true), Some(0), tb, now, false)), 0);
        assert_eq!(
            queued_ts(s.enqueue(&frame(false), Some(i64::MAX / 2), tb, now, false)),
            3003
        );
    }

    #[test]
    fn test_missing_pts_advances_by_tick() {
        let (mut s, _) = sender(90);
        let now = Instant::now();
        assert_eq!(queued_ts(s.enqueue(&frame(true), None, TimeBase::MPEG, now, false)), 0);
        assert_eq!(queued_ts(s.enqueue(&frame(false), None, TimeBase::MPEG, now, false)), 3003);
        assert_eq!(queued_ts(s.enqueue(&frame(false), None, TimeBase::MPEG, now, false)), 6006);
    }

    #[test]
    fn test_non_increasing_pts_forced_forward() {
        let (mut s, _) = sender(90);
        let now = Instant::now();
        s.enqueue(&frame(true), Some(0), TimeBase::MPEG, now, false);
        assert_eq!(queued_ts(s.enqueue(&frame(false), Some(3000), TimeBase::MPEG, now, false)), 3000);
        assert_eq!(queued_ts(s.enqueue(&frame(false), Some(3000), TimeBase::MPEG, now, false)), 3001);
        assert_eq!(queued_ts(s.enqueue(&frame(false), Some(100), TimeBase::MPEG, now, false)), 3002);
        assert_eq!(queued_ts(s.enqueue(&frame(false), Some(-50), TimeBase::MPEG, now, false)), 3003);
    }

    #[test]
    fn test_closed_track_drops() {
        let (mut s, track) = sender(90);
        track.open.store(false, Ordering::Release);
        assert_eq!(
            s.enqueue(&frame(true), Some(0), TimeBase::MPEG, Instant::now(), false),
            EnqueueOutcome::Dropped(DropReason::TrackClosed)
        );
        assert!(s.anchor().is_none());
    }

    #[test]
    fn test_keyframe_gate() {
        let (mut s, _) = sender(90);
        let now = Instant::now();
        assert_eq!(
            s.enqueue(&frame(false), Some(0), TimeBase::MPEG, now, true),
            EnqueueOutcome::Dropped(DropReason::AwaitingKeyframe)
        );
        assert!(s.anchor().is_none());
        queued_ts(s.enqueue(&frame(true), Some(3003), TimeBase::MPEG, now, true));
        queued_ts(s.enqueue(&frame(false), Some(6006), TimeBase::MPEG, now, true));
        assert_eq!(s.stats().queued, 2);
    }

    #[test]
    fn test_pop_due_respects_wall_clock() {
        let (mut s, _) = sender(90);
        let t0 = Instant::now();
        for i in 0..3 {
            s.enqueue(&frame(i == 0), Some(i * 3003), TimeBase::MPEG, t0, false);
        }

        assert_eq!(s.pop_due(t0).len(), 1);
        assert!(s.pop_due(t0 + Duration::from_millis(30)).is_empty());

        let due = s.pop_due(t0 + Duration::from_millis(70));
        assert_eq!(due.iter().map(|i| i.timestamp).collect::<Vec<_>>(), vec![3003, 6006]);
        assert_eq!(s.stats().emitted, 3);
        assert_eq!(s.stats().last_emitted, Some(6006));
        assert!(s.head_due().is_none());
    }

    #[test]
    fn test_overflow_keeps_newest() {
        let (mut s, _) = sender(3);
        let now = Instant::now();
        for i in 0..5 {
            s.enqueue(&frame(false), Some(i * 3003), TimeBase::MPEG, now, false);
        }
        assert_eq!(s.queued_timestamps(), vec![6006, 9009, 12012]);
        assert_eq!(s.stats().evicted, 2);
    }

    #[test]
    fn test_close_discards_and_blocks() {
        let (mut s, stub) = sender(90);
        let now = Instant::now();
        s.enqueue(&frame(true), Some(0), TimeBase::MPEG, now, false);
        let track = s.close();
        assert!(!s.has_pending());
        assert!(!s.is_open());

        tokio_test::assert_ok!(tokio_test::block_on(track.close()));
        assert!(!stub.is_open());
        assert_eq!(
            s.enqueue(&frame(false), Some(3003), TimeBase::MPEG, now, false),
            EnqueueOutcome::Dropped(DropReason::TrackClosed)
        );
    }

    #[test]
    fn test_frame_info_wraps_timestamp() {
        let (s, _) = sender(90);
        let item = EncodedItem {
            data: Bytes::new(),
            timestamp: (1u64 << 32) + 5,
            is_keyframe: false,
        };
        let info = s.frame_info(&item);
        assert_eq!(info.timestamp, 5);
        assert_eq!(info.payload_type, 96);
    }
}
