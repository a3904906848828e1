// Request Prioritizer: holds back low-priority requests while urgent ones are in flight.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::trace;

use super::{FetchCallbacks, FetchRequest, FetchSummary, SegmentFetcher};
use crate::config::FetchConfig;
use crate::error::FetchError;

/// Wraps a [`SegmentFetcher`] so that requests at or above the low-priority
/// threshold only start once no high-priority request is pending.
///
/// A waiting request whose priority is raised in place starts immediately.
pub struct PrioritizedFetcher {
    inner: Arc<dyn SegmentFetcher>,
    high_threshold: i32,
    low_threshold: i32,
    high_in_flight: watch::Sender<usize>,
}

struct HighPriorityGuard<'a>(&'a watch::Sender<usize>);

impl Drop for HighPriorityGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

impl PrioritizedFetcher {
    pub fn new(inner: Arc<dyn SegmentFetcher>, config: &FetchConfig) -> Self {
        Self {
            inner,
            high_threshold: config.high_priority_threshold,
            low_threshold: config.low_priority_threshold,
            high_in_flight: watch::Sender::new(0),
        }
    }

    pub fn high_priority_in_flight(&self) -> usize {
        *self.high_in_flight.borrow()
    }
}

#[async_trait]
impl SegmentFetcher for PrioritizedFetcher {
    async fn fetch(
        &self,
        request: FetchRequest,
        callbacks: FetchCallbacks,
    ) -> Result<FetchSummary, FetchError> {
        let mut priority = request.priority.clone();
        let mut in_flight = self.high_in_flight.subscribe();
        loop {
            if priority.get() < self.low_threshold || *in_flight.borrow_and_update() == 0 {
                break;
            }
            trace!(
                segment = %request.context.segment.id,
                priority = priority.get(),
                "Holding back low-priority request"
            );
            tokio::select! {
                _ = request.token.cancelled() => return Err(FetchError::Cancelled),
                _ = priority.changed() => {}
                _ = in_flight.changed() => {}
            }
        }

        let _guard = (priority.get() <= self.high_threshold).then(|| {
            self.high_in_flight.send_modify(|count| *count += 1);
            HighPriorityGuard(&self.high_in_flight)
        });
        self.inner.fetch(request, callbacks).await
    }
}
