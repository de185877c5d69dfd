// Segmented media acquisition engine: bounded segment fetching, progress
// estimation, external combining, job orchestration and scheduling.

pub mod client;
pub mod combine;
pub mod config;
pub mod error;
pub mod fetch;
pub mod job;
pub mod progress;
pub mod schedule;
pub mod thumbnail;

// Re-exports for easier access
pub use client::create_client;
pub use combine::{CombineInputs, Combiner, MediaTags};
pub use config::{EngineConfig, FetchConfig};
pub use error::GrabError;
pub use fetch::{ByteCounters, HttpSegmentSource, SegmentSource, download_stream};
pub use job::{Engine, JobOutcome, ShowDescriptor};
pub use progress::{NullSink, ProgressSink, RemuxProgress, SegmentProgress, extrapolate_total};
pub use schedule::{
    MetadataSink, NullMetadataSink, PassSummary, ProgressSinkFactory, Scheduler, ShowProvider,
};
