// Adaptive-streaming manifest model and segment enumeration.

pub mod error;
pub mod model;
pub mod segments;

// Re-exports for easier access
pub use error::DashError;
pub use model::{
    AdaptationSet, Manifest, MediaType, Period, Representation, parse, parse_iso8601_duration,
};
pub use segments::{ByteRange, Position, Segment, SegmentIter, segments_for};
