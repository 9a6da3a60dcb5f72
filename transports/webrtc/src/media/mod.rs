//! Media handling: H.264 bitstream repair, media clocks and track definitions

pub mod h264;
pub mod timestamp;
pub mod track_registry;

pub use h264::{normalize, split_annexb, NaluType, NormalizedFrame, ParameterSetCache};
pub use timestamp::TimeBase;
pub use track_registry::{TrackRegistry, TrackTemplate};
