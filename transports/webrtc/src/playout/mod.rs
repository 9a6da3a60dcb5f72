//! Paced frame delivery

pub mod queue;
pub mod scheduler;

pub use queue::{EncodedItem, FrameQueue};
pub use scheduler::PlayoutScheduler;
