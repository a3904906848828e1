use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::config::{BufferOptions, BufferOptionsHandle, StreamConfig};
use crate::error::FetchError;
use crate::estimator::{ManualEstimator, ManualEstimatorHandle};
use crate::events::{StreamEvent, StreamStatus};
use crate::fetcher::{FetchCallbacks, FetchRequest, FetchSummary, SegmentFetcher};
use crate::gc::GarbageCollectorRegistry;
use crate::manifest::{
    Adaptation, Manifest, Period, Representation, Segment, StaticSegmentIndex, TrackType,
};
use crate::metrics::SchedulerMetrics;
use crate::observation::PlaybackObservation;
use crate::parser::RawSegmentParser;
use crate::scheduler::{SchedulerContext, StreamContent};
use crate::sink::{BufferedChunk, ChunkContext, ChunkKind, PushedChunk};

/// Initialize tracing for tests with appropriate settings
#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn representation(id: &str, bitrate: f64) -> Representation {
    let index = Arc::new(StaticSegmentIndex::uniform(id, 0.0, 40.0, 6.0));
    Representation::new(id, bitrate, "avc1.4d401f", index)
}

fn content(adaptation: Adaptation) -> StreamContent {
    let track_type = adaptation.track_type;
    let period = Period::new("p0", 0.0, Some(40.0)).with_adaptation(adaptation);
    let manifest = Arc::new(Manifest::new("m", vec![period]));
    let period = manifest.first_period().expect("one period");
    let adaptation = Arc::clone(&period.adaptations_for_type(track_type)[0]);
    let representation = Arc::clone(&adaptation.representations[0]);
    StreamContent {
        manifest,
        period,
        adaptation,
        representation,
    }
}

/// Video content of period `p0` ([0, 40]), one representation per bitrate, each
/// with 6 second segments named `video-{bitrate}-{n}`. Loads the first bitrate.
pub fn multi_quality_content(bitrates: &[f64]) -> StreamContent {
    let representations = bitrates
        .iter()
        .map(|b| Arc::new(representation(&format!("video-{b}"), *b)))
        .collect();
    content(Adaptation::new("video", TrackType::Video, representations))
}

pub fn video_content(bitrate: f64) -> StreamContent {
    multi_quality_content(&[bitrate])
}

/// Like `video_content(1_000_000.0)`, with an initialization segment.
pub fn content_with_init() -> StreamContent {
    let index = StaticSegmentIndex::uniform("video-1000000", 0.0, 40.0, 6.0)
        .with_init(Segment::init("video-1000000-init").with_url("video-1000000/init.mp4"));
    let representation = Representation::new("video-1000000", 1_000_000.0, "avc1.4d401f", Arc::new(index));
    content(Adaptation::new("video", TrackType::Video, vec![Arc::new(representation)]))
}

/// Video content whose single representation `v` uses `index`.
pub fn content_from_index(index: Arc<StaticSegmentIndex>) -> StreamContent {
    let representation = Representation::new("v", 1_000_000.0, "avc1.4d401f", index);
    content(Adaptation::new("video", TrackType::Video, vec![Arc::new(representation)]))
}

/// Subtitles of period `p0`, segments named `text-{n}`.
pub fn text_content() -> StreamContent {
    let index = Arc::new(StaticSegmentIndex::uniform("text", 0.0, 40.0, 6.0));
    let representation = Representation::new("text", 1_000.0, "wvtt", index);
    content(Adaptation::new("text", TrackType::Text, vec![Arc::new(representation)]))
}

pub fn chunk_context(content: &StreamContent, id: &str, time: f64, duration: f64) -> ChunkContext {
    content.chunk_context(Segment::media(id, time, duration))
}

pub fn media_chunk(context: &ChunkContext, size: usize) -> PushedChunk {
    PushedChunk {
        context: context.clone(),
        kind: ChunkKind::Media {
            start: context.segment.time,
            end: context.segment.end,
        },
        data: Bytes::from(vec![0u8; size]),
    }
}

/// Complete inventory entry for the index segment starting at `time`.
pub fn buffered_chunk(content: &StreamContent, time: f64, duration: f64, size: usize) -> BufferedChunk {
    let segment = content
        .representation
        .index
        .segments(time, duration)
        .into_iter()
        .find(|s| (s.time - time).abs() < 1e-6)
        .unwrap_or_else(|| Segment::media(format!("{}-{time}", content.representation.id), time, duration));
    BufferedChunk {
        start: segment.time,
        end: segment.end,
        buffered_start: Some(segment.time),
        buffered_end: Some(segment.end),
        context: content.chunk_context(segment),
        chunk_size: Some(size),
        partially_pushed: false,
    }
}

/// Records a request as cancelled unless it completed.
struct CancelGuard {
    id: String,
    cancelled: Arc<Mutex<Vec<String>>>,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.cancelled.lock().push(self.id.clone());
        }
    }
}

/// Fetcher answering after a scripted delay with zeroed payloads.
#[derive(Debug)]
pub struct ScriptedFetcher {
    delay: Duration,
    segment_delays: HashMap<String, Duration>,
    failures: HashMap<String, FetchError>,
    payload: usize,
    started: Mutex<Vec<String>>,
    cancelled: Arc<Mutex<Vec<String>>>,
    priorities: Mutex<HashMap<String, i32>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(10),
            segment_delays: HashMap::new(),
            failures: HashMap::new(),
            payload: 100,
            started: Mutex::new(Vec::new()),
            cancelled: Arc::new(Mutex::new(Vec::new())),
            priorities: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_segment_delay(mut self, id: &str, delay: Duration) -> Self {
        self.segment_delays.insert(id.to_string(), delay);
        self
    }

    /// Fails every request of `id`, without retrying.
    pub fn with_failure(mut self, id: &str, error: FetchError) -> Self {
        self.failures.insert(id.to_string(), error);
        self
    }

    pub fn with_payload(mut self, size: usize) -> Self {
        self.payload = size;
        self
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    pub fn last_priority(&self, id: &str) -> Option<i32> {
        self.priorities.lock().get(id).copied()
    }
}

#[async_trait]
impl SegmentFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        request: FetchRequest,
        callbacks: FetchCallbacks,
    ) -> Result<FetchSummary, FetchError> {
        let id = request.context.segment.id.clone();
        self.started.lock().push(id.clone());
        let mut guard = CancelGuard {
            id: id.clone(),
            cancelled: Arc::clone(&self.cancelled),
            armed: true,
        };

        let mut priority = request.priority.clone();
        self.priorities.lock().insert(id.clone(), priority.get());
        let delay = self.segment_delays.get(&id).copied().unwrap_or(self.delay);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = request.token.cancelled() => return Err(FetchError::Cancelled),
                value = priority.changed() => {
                    self.priorities.lock().insert(id.clone(), value);
                }
                _ = &mut sleep => break,
            }
        }
        guard.armed = false;

        if let Some(error) = self.failures.get(&id) {
            return Err(error.clone());
        }
        callbacks.on_chunk(Bytes::from(vec![0u8; self.payload]));
        callbacks.on_all_chunks_received();
        Ok(FetchSummary {
            size: self.payload,
            elapsed: delay,
        })
    }
}

/// Scheduler context wired to channels the test controls.
pub struct TestSession {
    pub ctx: SchedulerContext,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
    pub observations: watch::Sender<PlaybackObservation>,
    pub options: BufferOptionsHandle,
    pub estimator: ManualEstimatorHandle,
}

impl TestSession {
    /// Buffer goal of 60 seconds from position 0, no memory limit.
    pub fn new(fetcher: ScriptedFetcher) -> Self {
        init_tracing();
        let (options, buffer_options) = BufferOptions::channel(60.0);
        let (observations, observations_rx) = watch::channel(PlaybackObservation::default());
        let (estimator, manual) = ManualEstimator::new(f64::INFINITY);
        let (events_tx, events) = mpsc::unbounded_channel();
        let ctx = SchedulerContext {
            config: Arc::new(StreamConfig::default()),
            fetcher: Arc::new(fetcher),
            parser: Arc::new(RawSegmentParser),
            estimator: Arc::new(manual),
            options: buffer_options,
            observations: observations_rx,
            gc_registry: Arc::new(GarbageCollectorRegistry::default()),
            metrics: Some(Arc::new(SchedulerMetrics::new())),
            events: events_tx,
        };
        Self {
            ctx,
            events,
            observations,
            options,
            estimator,
        }
    }

    pub fn observe(&self, observation: PlaybackObservation) {
        self.observations.send_replace(observation);
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        self.ctx.metrics.clone().expect("metrics enabled")
    }

    /// Waits for the first event matching `predicate`, skipping the others.
    pub async fn wait_for_event(&mut self, predicate: impl Fn(&StreamEvent) -> bool) -> StreamEvent {
        let wait = async {
            loop {
                let event = self.events.recv().await.expect("event channel open");
                if predicate(&event) {
                    return event;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(600), wait)
            .await
            .expect("expected event never came")
    }

    pub async fn wait_for_finished_status(&mut self, track_type: TrackType) -> StreamStatus {
        let event = self
            .wait_for_event(|e| {
                matches!(e, StreamEvent::StreamStatus(s) if s.track_type == track_type && s.has_finished_loading)
            })
            .await;
        match event {
            StreamEvent::StreamStatus(status) => status,
            _ => unreachable!(),
        }
    }
}
