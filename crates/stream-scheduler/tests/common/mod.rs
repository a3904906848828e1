#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use stream_scheduler::fetcher::{FetchCallbacks, FetchRequest, FetchSummary};
use stream_scheduler::{
    Adaptation, BufferOptions, BufferOptionsHandle, FetchError, Manifest, MediaSink, MemorySink,
    Period, PlaybackController, PlaybackObservation, Representation, SegmentFetcher,
    StaticSegmentIndex, StreamError, StreamEvent, StreamOrchestrator, StreamOrchestratorBuilder,
    TrackType,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Answers every request after a fixed delay, failing the scripted segments.
#[derive(Debug, Default)]
pub struct TestFetcher {
    delay: Duration,
    failures: HashMap<String, FetchError>,
    requested: Mutex<Vec<String>>,
}

impl TestFetcher {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn failing(mut self, id: &str, error: FetchError) -> Self {
        self.failures.insert(id.to_string(), error);
        self
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl SegmentFetcher for TestFetcher {
    async fn fetch(
        &self,
        request: FetchRequest,
        callbacks: FetchCallbacks,
    ) -> Result<FetchSummary, FetchError> {
        let id = request.context.segment.id.clone();
        self.requested.lock().push(id.clone());
        tokio::select! {
            _ = request.token.cancelled() => return Err(FetchError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }
        if let Some(error) = self.failures.get(&id) {
            return Err(error.clone());
        }
        callbacks.on_chunk(Bytes::from_static(&[0u8; 64]));
        callbacks.on_all_chunks_received();
        Ok(FetchSummary {
            size: 64,
            elapsed: self.delay,
        })
    }
}

#[derive(Debug, Default)]
pub struct RecordingController {
    seeks: Mutex<Vec<f64>>,
}

impl RecordingController {
    pub fn seeks(&self) -> Vec<f64> {
        self.seeks.lock().clone()
    }
}

impl PlaybackController for RecordingController {
    fn seek(&self, position: f64) {
        self.seeks.lock().push(position);
    }
}

/// Adaptation `{track}-{period}` with one representation of 4 second segments
/// named `{track}-{period}-{n}`.
pub fn adaptation(track_type: TrackType, period: &str, start: f64, end: f64) -> Adaptation {
    let id = format!("{track_type}-{period}");
    let index = StaticSegmentIndex::uniform(&id, start, end, 4.0);
    adaptation_with_index(track_type, &id, index)
}

pub fn adaptation_with_index(track_type: TrackType, id: &str, index: StaticSegmentIndex) -> Adaptation {
    let codec = match track_type {
        TrackType::Audio => "mp4a.40.2",
        TrackType::Text => "wvtt",
        _ => "avc1.4d401f",
    };
    let representation = Representation::new(id, 500_000.0, codec, Arc::new(index));
    Adaptation::new(id, track_type, vec![Arc::new(representation)])
}

pub fn period(id: &str, start: f64, end: f64, track_types: &[TrackType]) -> Period {
    track_types
        .iter()
        .fold(Period::new(id, start, Some(end)), |period, track_type| {
            period.with_adaptation(adaptation(*track_type, id, start, end))
        })
}

/// A running orchestrator and the handles driving it.
pub struct Harness {
    pub observations: watch::Sender<PlaybackObservation>,
    pub options: BufferOptionsHandle,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
    pub handle: JoinHandle<Result<(), StreamError>>,
    pub token: CancellationToken,
    pub sinks: HashMap<TrackType, Arc<MemorySink>>,
}

pub struct HarnessBuilder {
    manifest: Arc<Manifest>,
    fetcher: Arc<dyn SegmentFetcher>,
    buffer_goal: f64,
    track_types: Vec<TrackType>,
    configure: Vec<Box<dyn FnOnce(StreamOrchestratorBuilder) -> StreamOrchestratorBuilder>>,
}

impl HarnessBuilder {
    pub fn new(manifest: Arc<Manifest>, fetcher: Arc<dyn SegmentFetcher>) -> Self {
        init_tracing();
        Self {
            manifest,
            fetcher,
            buffer_goal: 60.0,
            track_types: vec![TrackType::Video],
            configure: Vec::new(),
        }
    }

    pub fn buffer_goal(mut self, goal: f64) -> Self {
        self.buffer_goal = goal;
        self
    }

    pub fn tracks(mut self, track_types: &[TrackType]) -> Self {
        self.track_types = track_types.to_vec();
        self
    }

    pub fn configure(
        mut self,
        f: impl FnOnce(StreamOrchestratorBuilder) -> StreamOrchestratorBuilder + 'static,
    ) -> Self {
        self.configure.push(Box::new(f));
        self
    }

    pub fn start(self) -> Harness {
        let (options, buffer_options) = BufferOptions::channel(self.buffer_goal);
        let (observations, observations_rx) = watch::channel(PlaybackObservation::default());
        let mut builder = StreamOrchestrator::builder(
            self.manifest,
            self.fetcher,
            observations_rx,
            buffer_options,
        );
        let mut sinks = HashMap::new();
        for track_type in self.track_types {
            let sink = Arc::new(MemorySink::unbounded(track_type));
            sinks.insert(track_type, Arc::clone(&sink));
            builder = builder.sink(sink as Arc<dyn MediaSink>);
        }
        for configure in self.configure {
            builder = configure(builder);
        }
        let orchestrator = builder.build().expect("valid orchestrator");
        let token = CancellationToken::new();
        let (events, handle) = orchestrator.spawn(token.clone());
        Harness {
            observations,
            options,
            events,
            handle,
            token,
            sinks,
        }
    }
}

impl Harness {
    pub fn sink(&self, track_type: TrackType) -> &Arc<MemorySink> {
        &self.sinks[&track_type]
    }

    pub fn observe(&self, observation: PlaybackObservation) {
        self.observations.send_replace(observation);
    }

    /// Events received until one matches `predicate`, that one included.
    pub async fn events_until(&mut self, predicate: impl Fn(&StreamEvent) -> bool) -> Vec<StreamEvent> {
        let collect = async {
            let mut seen = Vec::new();
            while let Some(event) = self.events.recv().await {
                let done = predicate(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            panic!("orchestrator stopped before the expected event");
        };
        tokio::time::timeout(Duration::from_secs(600), collect)
            .await
            .expect("expected event never came")
    }

    pub async fn wait_for(&mut self, predicate: impl Fn(&StreamEvent) -> bool) -> StreamEvent {
        let mut events = self.events_until(predicate).await;
        events.pop().expect("matching event")
    }

    pub async fn stop(self) -> Result<(), StreamError> {
        self.token.cancel();
        self.handle.await.expect("orchestrator task")
    }
}
