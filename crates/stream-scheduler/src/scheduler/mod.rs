// Schedulers: the nested components loading one track of one period.
//
// A `TrackScheduler` follows the adaptation chosen for a period, a
// `QualitySwitchScheduler` follows the quality estimates for that adaptation and a
// `SegmentScheduler` loads a single representation through its `DownloadQueue`.

pub mod buffer_status;
pub mod download_queue;
pub mod needed_segments;
pub mod priority;
pub mod quality;
pub mod segment;
pub mod switch_strategy;
pub mod track;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::config::{BufferOptions, StreamConfig};
use crate::estimator::QualityEstimator;
use crate::events::StreamEvent;
use crate::fetcher::SegmentFetcher;
use crate::gc::GarbageCollectorRegistry;
use crate::manifest::{Adaptation, Manifest, Period, Representation, Segment, TrackType};
use crate::metrics::SchedulerMetrics;
use crate::observation::PlaybackObservation;
use crate::parser::SegmentParser;
use crate::sink::ChunkContext;

pub use buffer_status::{BufferStatus, NeededRange};
pub use download_queue::{DownloadQueue, DownloadQueueContent, QueueEvent, QueuedSegment};
pub use quality::QualitySwitchScheduler;
pub use segment::{SchedulerExit, SegmentScheduler};
pub use track::TrackScheduler;

/// The representation a scheduler loads, with everything it belongs to.
#[derive(Debug, Clone)]
pub struct StreamContent {
    pub manifest: Arc<Manifest>,
    pub period: Arc<Period>,
    pub adaptation: Arc<Adaptation>,
    pub representation: Arc<Representation>,
}

impl StreamContent {
    pub fn track_type(&self) -> TrackType {
        self.adaptation.track_type
    }

    pub fn chunk_context(&self, segment: Segment) -> ChunkContext {
        ChunkContext {
            period: Arc::clone(&self.period),
            adaptation: Arc::clone(&self.adaptation),
            representation: Arc::clone(&self.representation),
            segment,
        }
    }

    /// Same content, for another representation of the adaptation.
    pub fn with_representation(&self, id: &str) -> Option<StreamContent> {
        let representation = self.adaptation.representation(id)?;
        Some(StreamContent {
            representation,
            ..self.clone()
        })
    }
}

/// Asks a segment scheduler to stop.
///
/// A non-urgent order lets the request in flight finish before terminating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationOrder {
    pub urgent: bool,
}

/// Collaborators shared by every scheduler of a session.
#[derive(Clone)]
pub struct SchedulerContext {
    pub config: Arc<StreamConfig>,
    pub fetcher: Arc<dyn SegmentFetcher>,
    pub parser: Arc<dyn SegmentParser>,
    pub estimator: Arc<dyn QualityEstimator>,
    pub options: BufferOptions,
    pub observations: watch::Receiver<PlaybackObservation>,
    pub gc_registry: Arc<GarbageCollectorRegistry>,
    pub metrics: Option<Arc<SchedulerMetrics>>,
    pub events: mpsc::UnboundedSender<StreamEvent>,
}

impl SchedulerContext {
    /// Sends an event upward. A closed channel means nobody listens anymore.
    pub(crate) fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn position(&self) -> f64 {
        self.observations.borrow().position
    }
}

impl std::fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerContext")
            .field("config", &self.config)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

/// Resolves on the next change of `rx`. Never resolves once the sender is gone.
pub(crate) async fn watch_changed<T>(rx: &mut watch::Receiver<T>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}
