// Quality Estimator: the seam recommending which representation to load.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::manifest::{Adaptation, Manifest, Period, Representation};
use crate::observation::PlaybackObservation;
use crate::scheduler::watch_changed;

/// One recommendation of the estimator.
#[derive(Debug, Clone, Default)]
pub struct QualityEstimate {
    pub representation: Option<Arc<Representation>>,
    /// Estimated bandwidth, in bits per second.
    pub bitrate: Option<f64>,
    /// Whether switching should interrupt the request in flight.
    pub urgent: bool,
    pub known_stable_bitrate: Option<f64>,
}

impl QualityEstimate {
    pub fn representation_id(&self) -> Option<&str> {
        self.representation.as_deref().map(|r| r.id.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct EstimatorContext {
    pub manifest: Arc<Manifest>,
    pub period: Arc<Period>,
    pub adaptation: Arc<Adaptation>,
}

/// Live outputs of an estimator for one adaptation.
#[derive(Debug, Clone)]
pub struct EstimateStream {
    pub estimates: watch::Receiver<QualityEstimate>,
    /// Bitrate under which buffered data may be replaced by better quality.
    pub fast_switch_threshold: watch::Receiver<Option<f64>>,
}

pub trait QualityEstimator: Send + Sync {
    /// Starts estimating for an adaptation. Must stop once `token` is cancelled.
    fn start(
        &self,
        context: EstimatorContext,
        representations: watch::Receiver<Vec<Arc<Representation>>>,
        observations: watch::Receiver<PlaybackObservation>,
        token: CancellationToken,
    ) -> EstimateStream;
}

/// Picks the best authorized representation under a bitrate ceiling set by the caller.
#[derive(Debug, Clone)]
pub struct ManualEstimator {
    max_bitrate: watch::Receiver<f64>,
    fast_switch_threshold: watch::Receiver<Option<f64>>,
    urgent: bool,
}

/// Owner side of a [`ManualEstimator`].
#[derive(Debug)]
pub struct ManualEstimatorHandle {
    pub max_bitrate: watch::Sender<f64>,
    pub fast_switch_threshold: watch::Sender<Option<f64>>,
}

impl ManualEstimator {
    pub fn new(max_bitrate: f64) -> (ManualEstimatorHandle, ManualEstimator) {
        let (bitrate_tx, bitrate_rx) = watch::channel(max_bitrate);
        let (threshold_tx, threshold_rx) = watch::channel(None);
        (
            ManualEstimatorHandle {
                max_bitrate: bitrate_tx,
                fast_switch_threshold: threshold_tx,
            },
            ManualEstimator {
                max_bitrate: bitrate_rx,
                fast_switch_threshold: threshold_rx,
                urgent: false,
            },
        )
    }

    /// Marks every quality change as urgent.
    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    /// Highest playable bitrate not above `max_bitrate`, else the lowest playable one.
    pub fn choose(
        representations: &[Arc<Representation>],
        max_bitrate: f64,
    ) -> Option<Arc<Representation>> {
        let mut playable: Vec<&Arc<Representation>> =
            representations.iter().filter(|r| r.is_playable()).collect();
        playable.sort_by(|a, b| a.bitrate.total_cmp(&b.bitrate));
        playable
            .iter()
            .rev()
            .find(|r| r.bitrate <= max_bitrate)
            .or_else(|| playable.first())
            .map(|r| Arc::clone(r))
    }
}

impl QualityEstimator for ManualEstimator {
    fn start(
        &self,
        context: EstimatorContext,
        mut representations: watch::Receiver<Vec<Arc<Representation>>>,
        _observations: watch::Receiver<PlaybackObservation>,
        token: CancellationToken,
    ) -> EstimateStream {
        let mut max_bitrate = self.max_bitrate.clone();
        let urgent = self.urgent;
        let estimate = move |reps: &[Arc<Representation>], max: f64| QualityEstimate {
            representation: ManualEstimator::choose(reps, max),
            bitrate: max.is_finite().then_some(max),
            urgent,
            known_stable_bitrate: None,
        };

        let initial = estimate(&representations.borrow_and_update(), *max_bitrate.borrow_and_update());
        let (tx, rx) = watch::channel(initial);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    res = representations.changed() => if res.is_err() { break },
                    _ = watch_changed(&mut max_bitrate) => {}
                }
                let next = estimate(&representations.borrow_and_update(), *max_bitrate.borrow_and_update());
                tx.send_if_modified(|current| {
                    let changed = current.representation_id() != next.representation_id();
                    if changed {
                        debug!(
                            adaptation = %context.adaptation.id,
                            representation = ?next.representation_id(),
                            "New quality estimate"
                        );
                        *current = next;
                    }
                    changed
                });
            }
        });

        EstimateStream {
            estimates: rx,
            fast_switch_threshold: self.fast_switch_threshold.clone(),
        }
    }
}
