//! Peer lifecycle: creation, track provisioning, renegotiation and teardown
//!
//! Every function here runs with the engine's control mutex held by the
//! caller, except [`EngineInner::handle_session_event`] which takes it itself
//! when an event mutates the peer set. The shared state lock is only held
//! for map lookups and updates, never across an `.await`.

use super::manager::Peer;
use super::sender::Sender;
use crate::engine::EngineInner;
use crate::media::TrackTemplate;
use crate::signaling::protocol::{address_for, OutboundMessage};
use crate::transport::{
    DescriptionKind, MediaSession, PeerEvent, SessionEvent, SessionEvents, SessionOptions,
    SessionState, SignalingState,
};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

impl EngineInner {
    fn session_options(&self, viewer_id: &str) -> SessionOptions {
        SessionOptions {
            viewer_id: viewer_id.to_string(),
            ice_servers: self.config.ice_servers.clone(),
            enable_ice_tcp: self.config.enable_ice_tcp,
            enable_udp_mux: self.config.enable_udp_mux,
        }
    }

    async fn create_sender(
        &self,
        session: &Arc<dyn MediaSession>,
        template: &TrackTemplate,
    ) -> Result<Sender> {
        let track = session
            .add_track(&template.descriptor(&self.config.h264_fmtp))
            .await?;
        Ok(Sender::new(template, track, self.config.queue_capacity))
    }

    /// Create the peer for `viewer_id` if it does not exist yet
    ///
    /// The new session gets a sender for every registered track and its
    /// first offer is started immediately.
    #[instrument(skip(self))]
    pub(crate) async fn ensure_peer(&self, viewer_id: &str) -> Result<bool> {
        if self.shared.state.lock().peers.contains(viewer_id) {
            return Ok(false);
        }

        let events = SessionEvents::new(viewer_id, self.events_tx.clone());
        let session = self
            .factory
            .create_session(&self.session_options(viewer_id), events)
            .await?;

        let templates = self.shared.state.lock().tracks.templates();
        let mut senders = HashMap::new();
        for template in &templates {
            match self.create_sender(&session, template).await {
                Ok(sender) => {
                    senders.insert(template.mid.clone(), sender);
                }
                Err(e) => warn!(
                    "Failed to add track '{}' for {}: {}",
                    template.mid, viewer_id, e
                ),
            }
        }

        {
            let mut peer = Peer::new(viewer_id, Arc::clone(&session));
            info!("Created peer {} with {} tracks", viewer_id, senders.len());
            peer.senders = senders;
            peer.offer_in_flight = true;
            self.shared.state.lock().peers.insert(peer);
        }

        self.start_offer(viewer_id, &session).await;
        Ok(true)
    }

    /// Add a sender for `template` to an existing peer
    ///
    /// Returns false if the peer is unknown or already has the track.
    pub(crate) async fn provision(&self, viewer_id: &str, template: &TrackTemplate) -> Result<bool> {
        let session = {
            let state = self.shared.state.lock();
            match state.peers.get(viewer_id) {
                Some(peer) if !peer.has_sender(&template.mid) => Arc::clone(peer.session()),
                _ => return Ok(false),
            }
        };

        let sender = self.create_sender(&session, template).await?;
        let mut state = self.shared.state.lock();
        match state.peers.get_mut(viewer_id) {
            Some(peer) => {
                debug!("Provisioned track '{}' on {}", template.mid, viewer_id);
                peer.senders.insert(template.mid.clone(), sender);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Mark the peer as renegotiating unless it already is
    fn claim_offer(&self, viewer_id: &str) -> Option<Arc<dyn MediaSession>> {
        let mut state = self.shared.state.lock();
        let peer = state.peers.get_mut(viewer_id)?;
        if peer.offer_in_flight {
            debug!("Offer already in flight for {}", viewer_id);
            return None;
        }
        peer.offer_in_flight = true;
        Some(Arc::clone(peer.session()))
    }

    fn release_offer(&self, viewer_id: &str) {
        if let Some(peer) = self.shared.state.lock().peers.get_mut(viewer_id) {
            peer.offer_in_flight = false;
        }
    }

    async fn start_offer(&self, viewer_id: &str, session: &Arc<dyn MediaSession>) {
        debug!("Creating offer for {}", viewer_id);
        if let Err(e) = session.set_local_description(DescriptionKind::Offer).await {
            warn!("Failed to create offer for {}: {}", viewer_id, e);
            self.release_offer(viewer_id);
        }
    }

    /// Start a new offer for `viewer_id` unless one is already in flight
    pub(crate) async fn initiate_offer(&self, viewer_id: &str) -> bool {
        match self.claim_offer(viewer_id) {
            Some(session) => {
                self.start_offer(viewer_id, &session).await;
                true
            }
            None => false,
        }
    }

    /// Offer a newly provisioned track to a connected viewer
    ///
    /// An offer already in flight was created without the track, so another
    /// one is owed once that negotiation settles.
    async fn renegotiate_for_track(&self, viewer_id: &str, mid: &str) {
        let session = {
            let mut state = self.shared.state.lock();
            let Some(peer) = state.peers.get_mut(viewer_id) else {
                return;
            };
            if peer.offer_in_flight {
                debug!(
                    "Deferring renegotiation of {} for track '{}' until the current offer settles",
                    viewer_id, mid
                );
                peer.renegotiate_pending = true;
                return;
            }
            if peer.session().state() != SessionState::Connected {
                return;
            }
            peer.offer_in_flight = true;
            Arc::clone(peer.session())
        };

        info!("Renegotiating {} after adding track '{}'", viewer_id, mid);
        self.start_offer(viewer_id, &session).await;
    }

    /// Clear the in-flight flag once negotiation is stable
    ///
    /// Returns the session when a deferred renegotiation should start now.
    fn settle_offer(&self, viewer_id: &str) -> Option<Arc<dyn MediaSession>> {
        let mut state = self.shared.state.lock();
        let peer = state.peers.get_mut(viewer_id)?;
        peer.offer_in_flight = false;
        if !peer.renegotiate_pending {
            return None;
        }
        peer.renegotiate_pending = false;
        peer.offer_in_flight = true;
        Some(Arc::clone(peer.session()))
    }

    pub(crate) async fn register_track(&self, template: TrackTemplate) -> bool {
        let viewers = {
            let mut state = self.shared.state.lock();
            if !state.tracks.insert(template.clone()) {
                return false;
            }
            state.peers.ids()
        };

        for viewer_id in viewers {
            match self.provision(&viewer_id, &template).await {
                Ok(true) => self.renegotiate_for_track(&viewer_id, &template.mid).await,
                Ok(false) => {}
                Err(e) => warn!(
                    "Failed to provision track '{}' on {}: {}",
                    template.mid, viewer_id, e
                ),
            }
        }
        true
    }

    pub(crate) async fn unregister_track(&self, mid: &str) -> bool {
        let closing = {
            let mut state = self.shared.state.lock();
            if state.tracks.remove(mid).is_none() {
                return false;
            }
            let mut closing = Vec::new();
            for peer in state.peers.iter_mut() {
                if let Some(mut sender) = peer.senders.remove(mid) {
                    closing.push((peer.viewer_id().to_string(), sender.close()));
                }
            }
            closing
        };

        for (viewer_id, track) in closing {
            if let Err(e) = track.close().await {
                warn!("Error closing track '{}' for {}: {}", mid, viewer_id, e);
            }
        }
        true
    }

    pub(crate) async fn remove_peer(&self, viewer_id: &str) -> bool {
        let peer = self.shared.state.lock().peers.remove(viewer_id);
        match peer {
            Some(peer) => {
                self.close_peer(peer).await;
                true
            }
            None => false,
        }
    }

    /// Close every sender of a peer already taken out of the registry, then its session
    pub(crate) async fn close_peer(&self, mut peer: Peer) {
        let tracks: Vec<_> = peer
            .senders
            .drain()
            .map(|(mid, mut sender)| (mid, sender.close()))
            .collect();
        for (mid, track) in tracks {
            if let Err(e) = track.close().await {
                debug!("Error closing track '{}' for {}: {}", mid, peer.viewer_id(), e);
            }
        }
        if let Err(e) = peer.session().close().await {
            warn!("Error closing session for {}: {}", peer.viewer_id(), e);
        }
    }

    pub(crate) fn send_signal(&self, message: OutboundMessage) {
        let result = message.to_json().and_then(|text| self.signaling.send(text));
        if let Err(e) = result {
            warn!("Failed to send signaling message: {}", e);
        }
    }

    /// React to an event raised by a viewer's session
    pub(crate) async fn handle_session_event(&self, event: PeerEvent) {
        let PeerEvent { viewer_id, event } = event;
        let to = address_for(&viewer_id, self.config.legacy_viewer_id.as_deref());

        match event {
            SessionEvent::LocalDescription(description) => {
                debug!("Sending {} to {}", description.kind.as_str(), viewer_id);
                self.send_signal(OutboundMessage::description(description, to));
            }
            SessionEvent::LocalCandidate(candidate) => {
                self.send_signal(OutboundMessage::candidate(
                    &candidate.candidate,
                    candidate.mid,
                    candidate.mline_index,
                    to,
                ));
            }
            SessionEvent::SignalingStateChanged(SignalingState::Stable) => {
                debug!("Negotiation stable for {}", viewer_id);
                if let Some(session) = self.settle_offer(&viewer_id) {
                    info!("Starting deferred renegotiation for {}", viewer_id);
                    self.start_offer(&viewer_id, &session).await;
                }
            }
            SessionEvent::SignalingStateChanged(_) => {}
            SessionEvent::StateChanged(state) => {
                info!("Session state for {}: {:?}", viewer_id, state);
                if state.is_terminal() {
                    let _guard = self.control.lock().await;
                    // A newer session may already have replaced the one that ended
                    let current_ended = self
                        .shared
                        .state
                        .lock()
                        .peers
                        .get(&viewer_id)
                        .map(|peer| peer.session().state().is_terminal())
                        .unwrap_or(false);
                    if current_ended {
                        self.remove_peer(&viewer_id).await;
                    }
                }
            }
        }
    }
}
