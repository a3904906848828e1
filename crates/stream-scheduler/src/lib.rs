// Stream Scheduler: decides which media segments to download, in which order and
// quality, and keeps the downstream buffers within their time and memory budgets.
pub mod config;
pub mod error;
pub mod estimator;
pub mod events;
pub mod fetcher;
pub mod gc;
pub mod manifest;
pub mod metrics;
pub mod observation;
pub mod orchestrator;
pub mod parser;
pub mod ranges;
pub mod scheduler;
pub mod sink;
pub mod stall;
pub mod track_selector;

#[cfg(test)]
pub(crate) mod test_utils;

// Export common types for ease of use
pub use config::{BufferConfig, BufferOptions, BufferOptionsHandle, StreamConfig};
pub use error::{ErrorCode, FetchError, ParseError, SinkError, StreamError};
pub use estimator::{ManualEstimator, QualityEstimate, QualityEstimator};
pub use events::{BufferDiscontinuity, StreamEvent, StreamStatus};
pub use fetcher::{HttpSegmentFetcher, PrioritizedFetcher, SegmentFetcher};
pub use manifest::{
    Adaptation, Manifest, ManifestEvent, Period, Representation, Segment, SegmentIndex,
    StaticSegmentIndex, TrackType,
};
pub use metrics::SchedulerMetrics;
pub use observation::{PlaybackObservation, ReadyState};
pub use orchestrator::{StreamOrchestrator, StreamOrchestratorBuilder};
pub use parser::{RawSegmentParser, SegmentParser};
pub use ranges::TimeRange;
pub use sink::{MediaSink, MemorySink};
pub use stall::{PlaybackController, RecoveryAction, StallRecovery};
pub use track_selector::{AdaptationChoice, DefaultTrackSelector, SwitchingMode, TrackSelector};
