// Quality Switch Scheduler: follows the quality estimates of one adaptation and
// replaces the segment scheduler whenever another representation is recommended.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::segment::{SchedulerExit, SegmentScheduler};
use super::switch_strategy::{SwitchStrategy, representation_switch_strategy};
use super::{SchedulerContext, StreamContent, TerminationOrder, watch_changed};
use crate::error::StreamError;
use crate::estimator::{EstimateStream, EstimatorContext, QualityEstimate};
use crate::events::StreamEvent;
use crate::manifest::{Adaptation, Manifest, Period, Representation};
use crate::sink::MediaSink;
use crate::track_selector::{AdaptationChoice, SwitchingMode};

/// Representations the estimator may pick from, and how to treat data of the others.
#[derive(Debug, Clone)]
pub struct RepresentationSet {
    pub representations: Vec<Arc<Representation>>,
    pub switching_mode: SwitchingMode,
}

impl From<&AdaptationChoice> for RepresentationSet {
    fn from(choice: &AdaptationChoice) -> Self {
        Self {
            representations: choice.authorized_representations(),
            switching_mode: choice.switching_mode,
        }
    }
}

pub struct QualitySwitchScheduler {
    ctx: SchedulerContext,
    manifest: Arc<Manifest>,
    period: Arc<Period>,
    adaptation: Arc<Adaptation>,
    sink: Arc<dyn MediaSink>,
    authorized: watch::Receiver<RepresentationSet>,
    token: CancellationToken,
}

impl QualitySwitchScheduler {
    pub fn new(
        ctx: SchedulerContext,
        manifest: Arc<Manifest>,
        period: Arc<Period>,
        adaptation: Arc<Adaptation>,
        sink: Arc<dyn MediaSink>,
        authorized: watch::Receiver<RepresentationSet>,
        token: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            manifest,
            period,
            adaptation,
            sink,
            authorized,
            token,
        }
    }

    /// Runs until cancelled. Errors of the underlying segment schedulers are returned.
    pub async fn run(mut self) -> Result<(), StreamError> {
        let _gc = self.ctx.gc_registry.acquire(
            &self.sink,
            self.ctx.observations.clone(),
            self.ctx.options.max_buffer_behind.clone(),
            self.ctx.options.max_buffer_ahead.clone(),
            self.ctx.metrics.clone(),
        );

        let initial = self.authorized.borrow_and_update().clone();
        self.ensure_playable(&initial)?;
        let (representations_tx, representations_rx) =
            watch::channel(initial.representations.clone());
        let estimator_token = self.token.child_token();
        let stream = self.ctx.estimator.start(
            EstimatorContext {
                manifest: Arc::clone(&self.manifest),
                period: Arc::clone(&self.period),
                adaptation: Arc::clone(&self.adaptation),
            },
            representations_rx,
            self.ctx.observations.clone(),
            estimator_token.clone(),
        );

        let result = self.run_loop(stream, &representations_tx).await;
        estimator_token.cancel();
        result
    }

    async fn run_loop(
        &mut self,
        mut stream: EstimateStream,
        representations: &watch::Sender<Vec<Arc<Representation>>>,
    ) -> Result<(), StreamError> {
        let mut previous: Option<Arc<Representation>> = None;
        loop {
            let Some(current) = self.next_representation(&mut stream.estimates).await else {
                return Ok(());
            };
            if previous.as_ref().is_some_and(|p| p.id != current.id)
                && let Some(metrics) = &self.ctx.metrics
            {
                metrics.record_quality_switch();
            }
            info!(
                period = %self.period.id,
                adaptation = %self.adaptation.id,
                representation = %current.id,
                bitrate = current.bitrate,
                "Loading representation"
            );
            self.ctx.emit(StreamEvent::RepresentationChange {
                track_type: self.adaptation.track_type,
                period: Arc::clone(&self.period),
                representation: Some(Arc::clone(&current)),
            });

            let content = StreamContent {
                manifest: Arc::clone(&self.manifest),
                period: Arc::clone(&self.period),
                adaptation: Arc::clone(&self.adaptation),
                representation: Arc::clone(&current),
            };
            let (termination_tx, termination_rx) = watch::channel(None);
            let child = self.token.child_token();
            let scheduler = SegmentScheduler::new(
                self.ctx.clone(),
                content,
                Arc::clone(&self.sink),
                stream.fast_switch_threshold.clone(),
                termination_rx,
                child.clone(),
            );
            let mut running = Box::pin(scheduler.run());

            loop {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => {
                        child.cancel();
                        let _ = running.await;
                        return Ok(());
                    }
                    result = &mut running => match result? {
                        SchedulerExit::Terminated => break,
                        SchedulerExit::Cancelled => return Ok(()),
                    },
                    _ = watch_changed(&mut stream.estimates) => {
                        let estimate = stream.estimates.borrow().clone();
                        if let Some(order) = termination_for(&estimate, &current) {
                            termination_tx.send_replace(Some(order));
                        }
                    }
                    _ = watch_changed(&mut self.authorized) => {
                        let set = self.authorized.borrow_and_update().clone();
                        self.ensure_playable(&set)?;
                        representations.send_replace(set.representations.clone());
                        self.apply_switch_strategy(&set).await?;
                        let still_authorized = set.representations.iter().any(|r| r.id == current.id);
                        if !still_authorized {
                            termination_tx.send_replace(Some(TerminationOrder {
                                urgent: set.switching_mode != SwitchingMode::Lazy,
                            }));
                        }
                    }
                }
            }
            previous = Some(current);
        }
    }

    /// Waits for an estimate naming a representation. `None` once cancelled.
    async fn next_representation(
        &self,
        estimates: &mut watch::Receiver<QualityEstimate>,
    ) -> Option<Arc<Representation>> {
        loop {
            if let Some(representation) = estimates.borrow_and_update().representation.clone() {
                return Some(representation);
            }
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                _ = watch_changed(estimates) => {}
            }
        }
    }

    fn ensure_playable(&self, set: &RepresentationSet) -> Result<(), StreamError> {
        if set.representations.is_empty() {
            return Err(StreamError::NoPlayableRepresentation {
                adaptation: self.adaptation.id.clone(),
            });
        }
        Ok(())
    }

    async fn apply_switch_strategy(&self, set: &RepresentationSet) -> Result<(), StreamError> {
        let observation = self.ctx.observations.borrow().clone();
        let padding = self
            .ctx
            .config
            .switching
            .padding_for(self.adaptation.track_type);
        let strategy = representation_switch_strategy(
            self.sink.as_ref(),
            &self.period,
            &self.adaptation,
            &set.representations,
            set.switching_mode,
            &observation,
            padding,
        );
        debug!(
            adaptation = %self.adaptation.id,
            authorized = set.representations.len(),
            strategy = ?strategy,
            "Authorized representations changed"
        );
        if strategy == SwitchStrategy::NeedsReload {
            self.ctx.emit(StreamEvent::NeedsMediaSourceReload {
                position: observation.position,
                auto_play: !observation.paused,
            });
            return Ok(());
        }
        if strategy.apply(self.sink.as_ref()).await? {
            self.ctx.emit(StreamEvent::NeedsBufferFlush {
                track_type: self.adaptation.track_type,
            });
        }
        Ok(())
    }
}

/// Order sent to the running scheduler when the estimate moves away from `current`.
fn termination_for(estimate: &QualityEstimate, current: &Representation) -> Option<TerminationOrder> {
    match estimate.representation_id() {
        Some(id) if id != current.id => Some(TerminationOrder {
            urgent: estimate.urgent,
        }),
        _ => None,
    }
}
