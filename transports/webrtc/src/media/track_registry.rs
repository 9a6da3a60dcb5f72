//! Track registry
//!
//! Holds the viewer-independent track definitions. Every new viewer is
//! provisioned from this registry, and every ingested access unit is
//! normalized against the parameter-set cache of its track here.

use super::h264::{normalize, NormalizedFrame, ParameterSetCache};
use crate::config::{ParameterSetScope, DEFAULT_CLOCK_RATE, DEFAULT_PAYLOAD_TYPE};
use crate::transport::TrackDescriptor;
use std::collections::HashMap;
use tracing::{debug, info};

/// Immutable description of one outbound media track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackTemplate {
    /// Unique track name (SDP mid)
    pub mid: String,
    /// msid stream identifier
    pub stream_id: String,
    /// msid track identifier
    pub track_id: String,
    /// Synchronization source
    pub ssrc: u32,
    /// Media clock rate in Hz
    pub clock_rate: u32,
    /// Nominal per-frame timestamp increment
    pub tick: u32,
    /// RTP payload type
    pub payload_type: u8,
}

impl TrackTemplate {
    /// Create an H.264 track template on the 90 kHz clock
    pub fn new(mid: &str, stream_id: &str, track_id: &str, ssrc: u32, tick: u32) -> Self {
        Self {
            mid: mid.to_string(),
            stream_id: stream_id.to_string(),
            track_id: track_id.to_string(),
            ssrc,
            clock_rate: DEFAULT_CLOCK_RATE,
            tick,
            payload_type: DEFAULT_PAYLOAD_TYPE,
        }
    }

    pub fn with_clock_rate(mut self, clock_rate: u32) -> Self {
        self.clock_rate = clock_rate;
        self
    }

    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type;
        self
    }

    /// Transport-level descriptor used to create this track's send object
    pub fn descriptor(&self, fmtp: &str) -> TrackDescriptor {
        TrackDescriptor {
            mid: self.mid.clone(),
            stream_id: self.stream_id.clone(),
            track_id: self.track_id.clone(),
            ssrc: self.ssrc,
            clock_rate: self.clock_rate,
            payload_type: self.payload_type,
            fmtp: fmtp.to_string(),
        }
    }
}

struct TrackEntry {
    template: TrackTemplate,
    cache: ParameterSetCache,
    frames: u64,
}

/// Registry of track templates keyed by mid
pub struct TrackRegistry {
    entries: HashMap<String, TrackEntry>,
    shared_cache: ParameterSetCache,
    scope: ParameterSetScope,
}

impl TrackRegistry {
    pub fn new(scope: ParameterSetScope) -> Self {
        Self {
            entries: HashMap::new(),
            shared_cache: ParameterSetCache::new(),
            scope,
        }
    }

    /// Store a template; returns false if the name is already taken
    pub fn insert(&mut self, template: TrackTemplate) -> bool {
        if self.entries.contains_key(&template.mid) {
            debug!("Track '{}' already registered", template.mid);
            return false;
        }

        info!(
            "Registered track '{}' (stream={}, track={}, ssrc={}, tick={})",
            template.mid, template.stream_id, template.track_id, template.ssrc, template.tick
        );
        self.entries.insert(
            template.mid.clone(),
            TrackEntry {
                template,
                cache: ParameterSetCache::new(),
                frames: 0,
            },
        );
        true
    }

    /// Remove a template by name
    pub fn remove(&mut self, mid: &str) -> Option<TrackTemplate> {
        let removed = self.entries.remove(mid).map(|e| e.template);
        if removed.is_some() {
            info!(
                "Unregistered track '{}' (remaining: {})",
                mid,
                self.entries.len()
            );
        }
        removed
    }

    pub fn get(&self, mid: &str) -> Option<&TrackTemplate> {
        self.entries.get(mid).map(|e| &e.template)
    }

    pub fn contains(&self, mid: &str) -> bool {
        self.entries.contains_key(mid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All track names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of all templates
    pub fn templates(&self) -> Vec<TrackTemplate> {
        self.entries.values().map(|e| e.template.clone()).collect()
    }

    /// Frames ingested for a track since registration
    pub fn frame_count(&self, mid: &str) -> Option<u64> {
        self.entries.get(mid).map(|e| e.frames)
    }

    /// Normalize an access unit for `mid` against the configured cache
    ///
    /// Returns the template alongside the frame, or `None` for an unknown track.
    pub fn normalize(&mut self, mid: &str, payload: &[u8]) -> Option<(&TrackTemplate, NormalizedFrame)> {
        let entry = self.entries.get_mut(mid)?;
        let cache = match self.scope {
            ParameterSetScope::PerTrack => &mut entry.cache,
            ParameterSetScope::Shared => &mut self.shared_cache,
        };
        let frame = normalize(payload, cache);
        entry.frames += 1;
        Some((&entry.template, frame))
    }
}
