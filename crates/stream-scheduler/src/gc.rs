// Buffer Garbage Collection: keeps each sink within its behind/ahead budgets and frees
// memory on demand when a push is rejected.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BufferConfig;
use crate::error::{SinkError, StreamError};
use crate::metrics::SchedulerMetrics;
use crate::observation::PlaybackObservation;
use crate::ranges::{TimeRange, inner_and_outer_ranges};
use crate::scheduler::watch_changed;
use crate::sink::MediaSink;

/// Ranges to remove so that nothing is buffered outside
/// `[position - max_behind, position + max_ahead]`.
///
/// The range containing the position is only trimmed at its budgeted edges.
pub fn select_ranges_to_clean(
    buffered: &[TimeRange],
    position: f64,
    max_behind: f64,
    max_ahead: f64,
) -> Vec<TimeRange> {
    let mut cleaned = Vec::new();
    let (inner, outer) = inner_and_outer_ranges(buffered, position);

    if max_behind.is_finite() {
        let limit = position - max_behind;
        for range in &outer {
            if limit >= range.end {
                cleaned.push(*range);
            } else if position >= range.end && limit > range.start {
                cleaned.push(TimeRange::new(range.start, limit));
            }
        }
        if let Some(inner) = inner
            && limit > inner.start
        {
            cleaned.push(TimeRange::new(inner.start, limit));
        }
    }

    if max_ahead.is_finite() {
        let limit = position + max_ahead;
        for range in &outer {
            if limit <= range.start {
                cleaned.push(*range);
            } else if position <= range.start && limit < range.end {
                cleaned.push(TimeRange::new(limit, range.end));
            }
        }
        if let Some(inner) = inner
            && limit < inner.end
        {
            cleaned.push(TimeRange::new(limit, inner.end));
        }
    }
    cleaned
}

/// Ranges farther than `gap` from the position, for a forced collection.
///
/// Ranges not containing the position are only removed when entirely beyond the gap.
pub fn select_forced_ranges(buffered: &[TimeRange], position: f64, gap: f64) -> Vec<TimeRange> {
    let mut cleaned = Vec::new();
    let (inner, outer) = inner_and_outer_ranges(buffered, position);
    for range in outer {
        if position - gap >= range.end || position + gap <= range.start {
            cleaned.push(range);
        }
    }
    if let Some(inner) = inner {
        if position - gap > inner.start {
            cleaned.push(TimeRange::new(inner.start, position - gap));
        }
        if position + gap < inner.end {
            cleaned.push(TimeRange::new(position + gap, inner.end));
        }
    }
    cleaned
}

async fn remove_ranges(sink: &dyn MediaSink, ranges: &[TimeRange]) -> Result<(), SinkError> {
    for range in ranges {
        sink.remove_buffer(range.start, range.end).await?;
    }
    Ok(())
}

/// Frees memory after a rejected push: a calm pass keeping a large margin around the
/// position first, then a beefy one. Fails with `BufferFull` when neither frees anything.
pub async fn force_garbage_collection(
    sink: &dyn MediaSink,
    position: f64,
    config: &BufferConfig,
) -> Result<(), StreamError> {
    let buffered = sink.buffered_ranges();
    for gap in [config.gc_calm_gap, config.gc_beefy_gap] {
        let ranges = select_forced_ranges(&buffered, position, gap);
        if ranges.is_empty() {
            continue;
        }
        debug!(
            track = %sink.track_type(),
            position,
            gap,
            ranges = ranges.len(),
            "Forcing garbage collection"
        );
        return remove_ranges(sink, &ranges)
            .await
            .map_err(|e| StreamError::sink("remove", e));
    }
    Err(StreamError::BufferFull { position })
}

/// Reactive collector of one sink, driven by the position and the buffer budgets.
pub struct BufferGarbageCollector {
    sink: Arc<dyn MediaSink>,
    observations: watch::Receiver<PlaybackObservation>,
    max_behind: watch::Receiver<f64>,
    max_ahead: watch::Receiver<f64>,
    metrics: Option<Arc<SchedulerMetrics>>,
}

impl BufferGarbageCollector {
    pub fn new(
        sink: Arc<dyn MediaSink>,
        observations: watch::Receiver<PlaybackObservation>,
        max_behind: watch::Receiver<f64>,
        max_ahead: watch::Receiver<f64>,
        metrics: Option<Arc<SchedulerMetrics>>,
    ) -> Self {
        Self {
            sink,
            observations,
            max_behind,
            max_ahead,
            metrics,
        }
    }

    /// Runs one collection pass, returning the number of removed ranges.
    pub async fn collect(&self) -> Result<usize, SinkError> {
        let position = self.observations.borrow().position;
        let max_behind = *self.max_behind.borrow();
        let max_ahead = *self.max_ahead.borrow();
        if !max_behind.is_finite() && !max_ahead.is_finite() {
            return Ok(0);
        }
        let ranges = select_ranges_to_clean(&self.sink.buffered_ranges(), position, max_behind, max_ahead);
        if ranges.is_empty() {
            return Ok(0);
        }
        debug!(
            track = %self.sink.track_type(),
            position,
            max_behind,
            max_ahead,
            ranges = ranges.len(),
            "Collecting buffer outside budgets"
        );
        remove_ranges(self.sink.as_ref(), &ranges).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_gc_run();
        }
        Ok(ranges.len())
    }

    pub async fn run(mut self, token: CancellationToken) {
        debug!(track = %self.sink.track_type(), "Garbage collector started");
        loop {
            if let Err(e) = self.collect().await {
                warn!(track = %self.sink.track_type(), error = %e, "Garbage collection failed");
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = watch_changed(&mut self.observations) => {}
                _ = watch_changed(&mut self.max_behind) => {}
                _ = watch_changed(&mut self.max_ahead) => {}
            }
        }
        debug!(track = %self.sink.track_type(), "Garbage collector stopped");
    }
}

struct CollectorEntry {
    users: usize,
    token: CancellationToken,
}

/// One garbage collector per sink, alive while at least one scheduler uses the sink.
#[derive(Default)]
pub struct GarbageCollectorRegistry {
    entries: Mutex<HashMap<usize, CollectorEntry>>,
}

/// Keeps a sink's collector alive. Dropping the last guard stops it.
pub struct GcGuard {
    registry: Arc<GarbageCollectorRegistry>,
    key: usize,
}

impl GarbageCollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(sink: &Arc<dyn MediaSink>) -> usize {
        Arc::as_ptr(sink) as *const () as usize
    }

    pub fn acquire(
        self: &Arc<Self>,
        sink: &Arc<dyn MediaSink>,
        observations: watch::Receiver<PlaybackObservation>,
        max_behind: watch::Receiver<f64>,
        max_ahead: watch::Receiver<f64>,
        metrics: Option<Arc<SchedulerMetrics>>,
    ) -> GcGuard {
        let key = Self::key(sink);
        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_insert_with(|| {
            let token = CancellationToken::new();
            let collector =
                BufferGarbageCollector::new(Arc::clone(sink), observations, max_behind, max_ahead, metrics);
            info!(track = %sink.track_type(), "Starting garbage collector for sink");
            tokio::spawn(collector.run(token.clone()));
            CollectorEntry { users: 0, token }
        });
        entry.users += 1;
        GcGuard {
            registry: Arc::clone(self),
            key,
        }
    }

    pub fn active_collectors(&self) -> usize {
        self.entries.lock().len()
    }

    fn release(&self, key: usize) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            entry.users = entry.users.saturating_sub(1);
            if entry.users == 0 {
                entry.token.cancel();
                entries.remove(&key);
            }
        }
    }
}

impl Drop for GcGuard {
    fn drop(&mut self) {
        self.registry.release(self.key);
    }
}
