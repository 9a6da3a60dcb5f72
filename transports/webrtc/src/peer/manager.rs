//! Peer registry

use super::sender::{Sender, SenderStats};
use crate::transport::MediaSession;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Summary of a connected viewer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Viewer identity
    pub viewer_id: String,

    /// Tracks provisioned on this peer, sorted
    pub tracks: Vec<String>,

    /// Renegotiation in progress
    pub offer_in_flight: bool,

    /// Another offer is owed once the current one settles
    pub renegotiate_pending: bool,

    /// Time since the peer was created
    pub age: Duration,
}

/// One viewer's session and its per-track senders
pub struct Peer {
    viewer_id: String,
    session: Arc<dyn MediaSession>,
    pub(crate) offer_in_flight: bool,
    pub(crate) renegotiate_pending: bool,
    pub(crate) senders: HashMap<String, Sender>,
    created_at: Instant,
}

impl Peer {
    pub fn new(viewer_id: &str, session: Arc<dyn MediaSession>) -> Self {
        Self {
            viewer_id: viewer_id.to_string(),
            session,
            offer_in_flight: false,
            renegotiate_pending: false,
            senders: HashMap::new(),
            created_at: Instant::now(),
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn session(&self) -> &Arc<dyn MediaSession> {
        &self.session
    }

    pub fn offer_in_flight(&self) -> bool {
        self.offer_in_flight
    }

    pub fn has_sender(&self, mid: &str) -> bool {
        self.senders.contains_key(mid)
    }

    pub fn sender(&self, mid: &str) -> Option<&Sender> {
        self.senders.get(mid)
    }

    pub fn sender_stats(&self, mid: &str) -> Option<SenderStats> {
        self.senders.get(mid).map(Sender::stats)
    }

    pub fn info(&self) -> PeerInfo {
        let mut tracks: Vec<String> = self.senders.keys().cloned().collect();
        tracks.sort();
        PeerInfo {
            viewer_id: self.viewer_id.clone(),
            tracks,
            offer_in_flight: self.offer_in_flight,
            renegotiate_pending: self.renegotiate_pending,
            age: self.created_at.elapsed(),
        }
    }
}

/// All live peers keyed by viewer identity
#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<String, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer; returns false if the viewer already has one
    pub fn insert(&mut self, peer: Peer) -> bool {
        if self.peers.contains_key(peer.viewer_id()) {
            return false;
        }
        info!(
            "Adding peer {} (total: {})",
            peer.viewer_id(),
            self.peers.len() + 1
        );
        self.peers.insert(peer.viewer_id.clone(), peer);
        true
    }

    pub fn remove(&mut self, viewer_id: &str) -> Option<Peer> {
        let peer = self.peers.remove(viewer_id);
        if peer.is_some() {
            info!(
                "Removed peer {} (remaining: {})",
                viewer_id,
                self.peers.len()
            );
        }
        peer
    }

    pub fn get(&self, viewer_id: &str) -> Option<&Peer> {
        self.peers.get(viewer_id)
    }

    pub fn get_mut(&mut self, viewer_id: &str) -> Option<&mut Peer> {
        self.peers.get_mut(viewer_id)
    }

    pub fn contains(&self, viewer_id: &str) -> bool {
        self.peers.contains_key(viewer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Viewer ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    /// Remove every peer
    pub fn drain(&mut self) -> Vec<Peer> {
        self.peers.drain().map(|(_, peer)| peer).collect()
    }
}
