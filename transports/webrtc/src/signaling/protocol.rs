//! Signaling message types
//!
//! Messages are JSON objects tagged by a `type` field. Viewers address the
//! engine with `from` (stamped by the relay) and the engine addresses each
//! viewer with `to`, so one signaling channel can carry any number of
//! negotiations. A single-viewer deployment may omit both fields.
//!
//! ```text
//! viewer -> engine   {"type":"need-offer","to":"v1"}
//! engine -> viewer   {"type":"offer","sdp":"v=0...","to":"v1"}
//! viewer -> engine   {"type":"answer","sdp":"v=0...","from":"v1"}
//! both directions    {"type":"candidate","candidate":"candidate:...","mid":"0","sdpMLineIndex":0,...}
//! ```

use crate::transport::{DescriptionKind, SessionDescription};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Message received from the signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundMessage {
    /// Viewer asks for a (new) offer
    NeedOffer {
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        from: Option<String>,
    },

    /// Viewer's answer to our offer
    Answer {
        sdp: String,
        #[serde(default)]
        from: Option<String>,
    },

    /// Viewer's trickled ICE candidate
    Candidate {
        candidate: String,
        #[serde(default)]
        mid: Option<String>,
        #[serde(default, rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
        #[serde(default)]
        from: Option<String>,
    },

    /// Any other message type
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Parse a message; malformed input yields `None`
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Viewer this message concerns, before legacy fallback
    ///
    /// `need-offer` names its target in `to` (relays that only stamp the
    /// sender put it in `from`); answers and candidates carry `from`.
    pub fn viewer(&self) -> Option<&str> {
        match self {
            InboundMessage::NeedOffer { to, from } => to.as_deref().or(from.as_deref()),
            InboundMessage::Answer { from, .. } | InboundMessage::Candidate { from, .. } => {
                from.as_deref()
            }
            InboundMessage::Unknown => None,
        }
    }
}

/// Pick the viewer a message is for, falling back to the legacy viewer id
pub fn resolve_viewer(explicit: Option<&str>, legacy: Option<&str>) -> Option<String> {
    explicit
        .filter(|id| !id.is_empty())
        .or(legacy)
        .map(str::to_string)
}

/// Message sent to a viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundMessage {
    Offer {
        sdp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },

    Answer {
        sdp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },

    Candidate {
        candidate: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mid: Option<String>,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
}

impl OutboundMessage {
    /// Local description addressed to `to`
    pub fn description(description: SessionDescription, to: Option<String>) -> Self {
        match description.kind {
            DescriptionKind::Offer => OutboundMessage::Offer {
                sdp: description.sdp,
                to,
            },
            DescriptionKind::Answer => OutboundMessage::Answer {
                sdp: description.sdp,
                to,
            },
        }
    }

    /// Local candidate addressed to `to`, with any `a=` prefix removed
    pub fn candidate(
        candidate: &str,
        mid: Option<String>,
        mline_index: Option<u16>,
        to: Option<String>,
    ) -> Self {
        OutboundMessage::Candidate {
            candidate: strip_attribute_prefix(candidate).to_string(),
            mid,
            sdp_mline_index: mline_index.unwrap_or(0),
            to,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to encode signaling message: {}", e))
        })
    }
}

/// Outbound address for a viewer: omitted for the legacy single viewer
pub fn address_for(viewer_id: &str, legacy: Option<&str>) -> Option<String> {
    if legacy == Some(viewer_id) {
        None
    } else {
        Some(viewer_id.to_string())
    }
}

/// Strip the SDP attribute prefix from a candidate line
pub fn strip_attribute_prefix(candidate: &str) -> &str {
    candidate.strip_prefix("a=").unwrap_or(candidate)
}
