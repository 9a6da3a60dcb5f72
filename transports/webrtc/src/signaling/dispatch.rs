//! Inbound signaling dispatch

use super::protocol::{resolve_viewer, InboundMessage};
use crate::engine::EngineInner;
use crate::transport::{DescriptionKind, MediaSession, SessionDescription};
use std::sync::Arc;
use tracing::{debug, warn};

impl EngineInner {
    /// Route one inbound message to the peer it concerns
    ///
    /// Malformed messages, unknown types and messages for unknown viewers
    /// are dropped without error.
    pub(crate) async fn on_signaling_message(&self, text: &str) {
        let Some(message) = InboundMessage::parse(text) else {
            debug!("Ignoring malformed signaling message ({} bytes)", text.len());
            return;
        };

        let legacy = self.config.legacy_viewer_id.as_deref();
        let viewer_id = match &message {
            InboundMessage::Unknown => {
                debug!("Ignoring signaling message of unknown type");
                return;
            }
            other => match resolve_viewer(other.viewer(), legacy) {
                Some(id) => id,
                None => {
                    debug!("Ignoring signaling message without a viewer id");
                    return;
                }
            },
        };

        match message {
            InboundMessage::NeedOffer { .. } => match self.ensure_peer(&viewer_id).await {
                Ok(true) => {}
                Ok(false) => {
                    self.initiate_offer(&viewer_id).await;
                }
                Err(e) => warn!("Failed to create peer for {}: {}", viewer_id, e),
            },
            InboundMessage::Answer { sdp, .. } => {
                let Some(session) = self.session_for(&viewer_id) else {
                    debug!("Ignoring answer for unknown viewer {}", viewer_id);
                    return;
                };
                let description = SessionDescription {
                    kind: DescriptionKind::Answer,
                    sdp,
                };
                if let Err(e) = session.set_remote_description(description).await {
                    warn!("Failed to apply answer from {}: {}", viewer_id, e);
                }
            }
            InboundMessage::Candidate {
                candidate,
                mid,
                sdp_mline_index,
                ..
            } => {
                let Some(session) = self.session_for(&viewer_id) else {
                    debug!("Ignoring candidate for unknown viewer {}", viewer_id);
                    return;
                };
                if let Err(e) = session
                    .add_remote_candidate(&candidate, mid.as_deref(), sdp_mline_index)
                    .await
                {
                    warn!("Failed to add candidate from {}: {}", viewer_id, e);
                }
            }
            InboundMessage::Unknown => {}
        }
    }

    fn session_for(&self, viewer_id: &str) -> Option<Arc<dyn MediaSession>> {
        self.shared
            .state
            .lock()
            .peers
            .get(viewer_id)
            .map(|peer| Arc::clone(peer.session()))
    }
}
