// Stream Orchestrator: runs one lane per track type and aggregates what they report
// into session-wide signals.

mod active_period;
mod lane;

pub use active_period::ActivePeriodTracker;

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BufferOptions, StreamConfig};
use crate::error::StreamError;
use crate::estimator::{ManualEstimator, QualityEstimator};
use crate::events::StreamEvent;
use crate::fetcher::SegmentFetcher;
use crate::gc::GarbageCollectorRegistry;
use crate::manifest::{Manifest, ManifestEvent, TrackType};
use crate::metrics::SchedulerMetrics;
use crate::observation::PlaybackObservation;
use crate::parser::{RawSegmentParser, SegmentParser};
use crate::scheduler::{SchedulerContext, watch_changed};
use crate::sink::MediaSink;
use crate::stall::{PlaybackController, RecoveryAction, RecoveryReason, StallRecovery};
use crate::track_selector::{DefaultTrackSelector, TrackSelector};
use lane::{Lane, LaneMessage};

/// Next manifest notification. Pending forever once every sender is gone.
pub(crate) async fn next_manifest_event(
    receiver: &mut Option<broadcast::Receiver<ManifestEvent>>,
) -> ManifestEvent {
    loop {
        let Some(rx) = receiver.as_mut() else {
            return std::future::pending().await;
        };
        match rx.recv().await {
            Ok(event) => return event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed manifest notifications, treating as an update");
                return ManifestEvent::Updated;
            }
            Err(broadcast::error::RecvError::Closed) => *receiver = None,
        }
    }
}

/// Loads every track of a content, from the position given by the observations.
pub struct StreamOrchestrator {
    config: Arc<StreamConfig>,
    manifest: Arc<Manifest>,
    sinks: Vec<Arc<dyn MediaSink>>,
    fetcher: Arc<dyn SegmentFetcher>,
    parser: Arc<dyn SegmentParser>,
    estimator: Arc<dyn QualityEstimator>,
    track_selector: Arc<dyn TrackSelector>,
    options: BufferOptions,
    observations: watch::Receiver<PlaybackObservation>,
    manifest_events: Option<broadcast::Sender<ManifestEvent>>,
    controller: Option<Arc<dyn PlaybackController>>,
    metrics: Option<Arc<SchedulerMetrics>>,
}

pub struct StreamOrchestratorBuilder {
    config: StreamConfig,
    manifest: Arc<Manifest>,
    fetcher: Arc<dyn SegmentFetcher>,
    observations: watch::Receiver<PlaybackObservation>,
    options: BufferOptions,
    sinks: Vec<Arc<dyn MediaSink>>,
    parser: Option<Arc<dyn SegmentParser>>,
    estimator: Option<Arc<dyn QualityEstimator>>,
    track_selector: Option<Arc<dyn TrackSelector>>,
    manifest_events: Option<broadcast::Sender<ManifestEvent>>,
    controller: Option<Arc<dyn PlaybackController>>,
    metrics: Option<Arc<SchedulerMetrics>>,
}

impl StreamOrchestratorBuilder {
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds the sink of one track type. Each track type gets its own lane.
    pub fn sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn parser(mut self, parser: Arc<dyn SegmentParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn estimator(mut self, estimator: Arc<dyn QualityEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn track_selector(mut self, track_selector: Arc<dyn TrackSelector>) -> Self {
        self.track_selector = Some(track_selector);
        self
    }

    /// Channel on which the embedder announces manifest refreshes.
    pub fn manifest_events(mut self, sender: broadcast::Sender<ManifestEvent>) -> Self {
        self.manifest_events = Some(sender);
        self
    }

    /// Enables stall recovery, seeking through `controller`.
    pub fn playback_controller(mut self, controller: Arc<dyn PlaybackController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn metrics(mut self, metrics: Arc<SchedulerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<StreamOrchestrator, StreamError> {
        if self.sinks.is_empty() {
            return Err(StreamError::Internal {
                reason: "no sink registered".to_string(),
            });
        }
        let mut seen = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            if seen.contains(&sink.track_type()) {
                return Err(StreamError::Internal {
                    reason: format!("two sinks registered for {}", sink.track_type()),
                });
            }
            seen.push(sink.track_type());
        }

        let metrics = match self.metrics {
            Some(metrics) => Some(metrics),
            None if self.config.metrics_enabled => Some(Arc::new(SchedulerMetrics::new())),
            None => None,
        };
        Ok(StreamOrchestrator {
            config: Arc::new(self.config),
            manifest: self.manifest,
            sinks: self.sinks,
            fetcher: self.fetcher,
            parser: self.parser.unwrap_or_else(|| Arc::new(RawSegmentParser)),
            estimator: self
                .estimator
                .unwrap_or_else(|| Arc::new(ManualEstimator::new(f64::INFINITY).1)),
            track_selector: self
                .track_selector
                .unwrap_or_else(|| Arc::new(DefaultTrackSelector::new())),
            options: self.options,
            observations: self.observations,
            manifest_events: self.manifest_events,
            controller: self.controller,
            metrics,
        })
    }
}

/// Session-wide signals derived from the lanes.
struct Aggregator {
    track_types: Vec<TrackType>,
    active_period: ActivePeriodTracker,
    completion: HashMap<TrackType, bool>,
    ended: bool,
    recovery: Option<(StallRecovery, Arc<dyn PlaybackController>)>,
    metrics: Option<Arc<SchedulerMetrics>>,
    output: mpsc::UnboundedSender<StreamEvent>,
}

impl Aggregator {
    fn emit(&self, event: StreamEvent) {
        let _ = self.output.send(event);
    }

    fn on_lane_message(&mut self, message: LaneMessage) {
        match message {
            LaneMessage::Event(event) => self.on_event(event),
            LaneMessage::Completion { track_type, complete } => {
                self.completion.insert(track_type, complete);
                let all_complete = self
                    .track_types
                    .iter()
                    .all(|t| self.completion.get(t).copied().unwrap_or(false));
                if all_complete && !self.ended {
                    info!("Every track loaded up to the end");
                    self.ended = true;
                    self.emit(StreamEvent::EndOfStream);
                } else if !all_complete && self.ended {
                    info!("Loading resumed after the end of stream");
                    self.ended = false;
                    self.emit(StreamEvent::ResumeStream);
                }
            }
        }
    }

    fn on_event(&mut self, event: StreamEvent) {
        let active = match &event {
            StreamEvent::AdaptationChange { track_type, period, .. }
            | StreamEvent::RepresentationChange { track_type, period, .. } => {
                self.active_period.on_ready(period, *track_type)
            }
            StreamEvent::PeriodStreamCleared { track_type, period } => {
                self.active_period.on_cleared(period, *track_type)
            }
            StreamEvent::StreamStatus(status) => {
                if let Some((recovery, _)) = &mut self.recovery {
                    recovery.on_status(status);
                }
                None
            }
            _ => None,
        };
        self.emit(event);
        if let Some(period) = active {
            debug!(period = %period.id, "Active period changed");
            self.emit(StreamEvent::ActivePeriodChanged { period });
        }
    }

    fn on_observation(&mut self, observation: &PlaybackObservation) {
        let Some((recovery, controller)) = &mut self.recovery else {
            return;
        };
        let Some(RecoveryAction::Seek { from, to, reason }) =
            recovery.on_observation(observation, Instant::now())
        else {
            return;
        };
        controller.seek(to);
        if let Some(metrics) = &self.metrics {
            metrics.record_recovery_seek();
        }
        if reason != RecoveryReason::Freeze {
            let _ = self
                .output
                .send(StreamEvent::Warning(StreamError::Discontinuity { from, to }));
        }
    }
}

impl StreamOrchestrator {
    pub fn builder(
        manifest: Arc<Manifest>,
        fetcher: Arc<dyn SegmentFetcher>,
        observations: watch::Receiver<PlaybackObservation>,
        options: BufferOptions,
    ) -> StreamOrchestratorBuilder {
        StreamOrchestratorBuilder {
            config: StreamConfig::default(),
            manifest,
            fetcher,
            observations,
            options,
            sinks: Vec::new(),
            parser: None,
            estimator: None,
            track_selector: None,
            manifest_events: None,
            controller: None,
            metrics: None,
        }
    }

    pub fn metrics(&self) -> Option<Arc<SchedulerMetrics>> {
        self.metrics.clone()
    }

    /// Runs the orchestrator on its own task. The task returns the fatal error that
    /// stopped it, if any.
    pub fn spawn(
        self,
        token: CancellationToken,
    ) -> (
        mpsc::UnboundedReceiver<StreamEvent>,
        JoinHandle<Result<(), StreamError>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run(tx, token));
        (rx, handle)
    }

    pub async fn run(
        self,
        output: mpsc::UnboundedSender<StreamEvent>,
        token: CancellationToken,
    ) -> Result<(), StreamError> {
        let track_types: Vec<TrackType> = self.sinks.iter().map(|s| s.track_type()).collect();
        info!(
            manifest = %self.manifest.id,
            tracks = ?track_types,
            "Stream orchestrator started"
        );

        let lanes_token = token.child_token();
        let gc_registry = Arc::new(GarbageCollectorRegistry::default());
        let (lane_tx, mut lane_rx) = mpsc::unbounded_channel();
        let mut lanes = FuturesUnordered::new();
        for sink in &self.sinks {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let ctx = SchedulerContext {
                config: Arc::clone(&self.config),
                fetcher: Arc::clone(&self.fetcher),
                parser: Arc::clone(&self.parser),
                estimator: Arc::clone(&self.estimator),
                options: self.options.clone(),
                observations: self.observations.clone(),
                gc_registry: Arc::clone(&gc_registry),
                metrics: self.metrics.clone(),
                events: events_tx,
            };
            let lane = Lane::new(
                ctx,
                events_rx,
                Arc::clone(sink),
                Arc::clone(&self.manifest),
                Arc::clone(&self.track_selector),
                self.manifest_events.as_ref().map(|s| s.subscribe()),
                lane_tx.clone(),
                lanes_token.child_token(),
            );
            lanes.push(tokio::spawn(lane.run()));
        }

        let mut aggregator = Aggregator {
            active_period: ActivePeriodTracker::new(track_types.clone()),
            track_types,
            completion: HashMap::new(),
            ended: false,
            recovery: self.controller.clone().map(|controller| {
                (
                    StallRecovery::new(self.config.stall.clone(), Arc::clone(&self.manifest)),
                    controller,
                )
            }),
            metrics: self.metrics.clone(),
            output,
        };
        let mut observations = self.observations.clone();

        let result = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(()),
                Some(joined) = lanes.next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(error = %e, "Lane failed, stopping the session");
                        break Err(e);
                    }
                    Err(e) => {
                        break Err(StreamError::Internal {
                            reason: format!("lane task failed: {e}"),
                        });
                    }
                },
                Some(message) = lane_rx.recv() => aggregator.on_lane_message(message),
                _ = watch_changed(&mut observations) => {
                    let observation = observations.borrow_and_update().clone();
                    aggregator.on_observation(&observation);
                }
            }
        };

        lanes_token.cancel();
        while lanes.next().await.is_some() {}
        if let Some(metrics) = &self.metrics {
            metrics.log_summary();
        }
        info!(manifest = %self.manifest.id, failed = result.is_err(), "Stream orchestrator stopped");
        result
    }
}
