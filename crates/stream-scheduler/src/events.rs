// Stream Events: notifications flowing up from the schedulers to the embedder.

use std::sync::Arc;

use crate::error::StreamError;
use crate::manifest::{Adaptation, Period, ProtectionData, Representation, TrackType};
use crate::ranges::TimeRange;
use crate::sink::ChunkContext;

/// A hole in the buffer that no segment will fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferDiscontinuity {
    /// `None` when playback is already inside the hole.
    pub start: Option<f64>,
    /// `None` when the hole never ends.
    pub end: Option<f64>,
}

/// Buffering state of one representation, emitted on every scheduling tick.
#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub period: Arc<Period>,
    pub track_type: TrackType,
    pub position: f64,
    pub has_finished_loading: bool,
    pub imminent_discontinuity: Option<BufferDiscontinuity>,
    pub is_buffer_full: bool,
    pub has_media_to_load: bool,
    pub needs_manifest_refresh: bool,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    StreamStatus(StreamStatus),
    AddedSegment {
        context: ChunkContext,
        buffered: Vec<TimeRange>,
    },
    RepresentationChange {
        track_type: TrackType,
        period: Arc<Period>,
        representation: Option<Arc<Representation>>,
    },
    AdaptationChange {
        track_type: TrackType,
        period: Arc<Period>,
        adaptation: Option<Arc<Adaptation>>,
    },
    ActivePeriodChanged {
        period: Arc<Period>,
    },
    /// The chain loading a period was removed.
    PeriodStreamCleared {
        track_type: TrackType,
        period: Arc<Period>,
    },
    NeedsMediaSourceReload {
        position: f64,
        auto_play: bool,
    },
    NeedsBufferFlush {
        track_type: TrackType,
    },
    NeedsManifestRefresh,
    ManifestMightBeOutOfSync,
    EncryptionDataEncountered {
        representation: Arc<Representation>,
        data: Vec<ProtectionData>,
    },
    EndOfStream,
    ResumeStream,
    Warning(StreamError),
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StreamStatus(_) => "stream-status",
            Self::AddedSegment { .. } => "added-segment",
            Self::RepresentationChange { .. } => "representation-change",
            Self::AdaptationChange { .. } => "adaptation-change",
            Self::ActivePeriodChanged { .. } => "active-period-changed",
            Self::PeriodStreamCleared { .. } => "period-stream-cleared",
            Self::NeedsMediaSourceReload { .. } => "needs-media-source-reload",
            Self::NeedsBufferFlush { .. } => "needs-buffer-flush",
            Self::NeedsManifestRefresh => "needs-manifest-refresh",
            Self::ManifestMightBeOutOfSync => "manifest-might-be-out-of-sync",
            Self::EncryptionDataEncountered { .. } => "encryption-data-encountered",
            Self::EndOfStream => "end-of-stream",
            Self::ResumeStream => "resume-stream",
            Self::Warning(_) => "warning",
        }
    }
}
