//! Viewer peers
//!
//! A peer is one viewer's session plus one sender per registered track.

mod lifecycle;
pub mod manager;
pub mod sender;

pub use manager::{Peer, PeerInfo, PeerRegistry};
pub use sender::{Anchor, DropReason, EnqueueOutcome, Sender, SenderStats};
