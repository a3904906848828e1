// Segment Scheduler: loads one representation, recomputing what is needed on every
// tick and pushing downloaded data to the sink.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::buffer_status::{BufferStatus, BufferStatusInput, get_buffer_status};
use super::download_queue::{DownloadQueue, DownloadQueueContent, QueueEvent, QueuedSegment};
use super::priority::HIGHEST_PRIORITY;
use super::{SchedulerContext, StreamContent, TerminationOrder, watch_changed};
use crate::error::{FetchError, SinkError, StreamError};
use crate::events::{StreamEvent, StreamStatus};
use crate::fetcher::retry::FailureClass;
use crate::gc::force_garbage_collection;
use crate::manifest::{ProtectionData, Segment, TrackType};
use crate::observation::PlaybackObservation;
use crate::sink::{ChunkKind, MediaSink, PushedChunk, SinkSnapshot};

/// How a segment scheduler stopped without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    /// A termination order was honored.
    Terminated,
    /// The parent cancelled the scheduler.
    Cancelled,
}

pub struct SegmentScheduler {
    ctx: SchedulerContext,
    content: StreamContent,
    sink: Arc<dyn MediaSink>,
    queue: DownloadQueue,
    observations: watch::Receiver<PlaybackObservation>,
    buffer_goal: watch::Receiver<f64>,
    max_buffer_size: watch::Receiver<f64>,
    fast_switch_threshold: watch::Receiver<Option<f64>>,
    termination: watch::Receiver<Option<TerminationOrder>>,
    terminating: Option<TerminationOrder>,
    token: CancellationToken,
}

impl SegmentScheduler {
    pub fn new(
        ctx: SchedulerContext,
        content: StreamContent,
        sink: Arc<dyn MediaSink>,
        fast_switch_threshold: watch::Receiver<Option<f64>>,
        termination: watch::Receiver<Option<TerminationOrder>>,
        token: CancellationToken,
    ) -> Self {
        let queue = DownloadQueue::new(
            content.clone(),
            Arc::clone(&ctx.fetcher),
            Arc::clone(&ctx.parser),
            ctx.metrics.clone(),
            token.child_token(),
        );
        Self {
            observations: ctx.observations.clone(),
            buffer_goal: ctx.options.wanted_buffer_ahead.clone(),
            max_buffer_size: ctx.options.max_video_buffer_size.clone(),
            ctx,
            content,
            sink,
            queue,
            fast_switch_threshold,
            termination,
            terminating: None,
            token,
        }
    }

    pub async fn run(mut self) -> Result<SchedulerExit, StreamError> {
        info!(
            period = %self.content.period.id,
            track = %self.content.track_type(),
            representation = %self.content.representation.id,
            "Segment scheduler started"
        );
        let result = self.run_loop().await;
        self.queue.abort();
        match &result {
            Ok(exit) => debug!(
                representation = %self.content.representation.id,
                exit = ?exit,
                "Segment scheduler stopped"
            ),
            Err(e) => warn!(
                representation = %self.content.representation.id,
                error = %e,
                "Segment scheduler failed"
            ),
        }
        result
    }

    async fn run_loop(&mut self) -> Result<SchedulerExit, StreamError> {
        let protection = self.content.representation.protection_data.clone();
        self.report_protection(protection);

        let order = *self.termination.borrow_and_update();
        if let Some(order) = order
            && self.handle_termination(order)
        {
            return Ok(SchedulerExit::Terminated);
        }
        self.tick().await?;

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(SchedulerExit::Cancelled),
                _ = watch_changed(&mut self.termination) => {
                    let order = *self.termination.borrow_and_update();
                    if let Some(order) = order
                        && self.handle_termination(order)
                    {
                        return Ok(SchedulerExit::Terminated);
                    }
                }
                event = self.queue.next_event() => {
                    if self.handle_queue_event(event).await? {
                        return Ok(SchedulerExit::Terminated);
                    }
                }
                _ = watch_changed(&mut self.observations) => self.tick().await?,
                _ = watch_changed(&mut self.buffer_goal) => self.tick().await?,
                _ = watch_changed(&mut self.max_buffer_size) => self.tick().await?,
                _ = watch_changed(&mut self.fast_switch_threshold) => self.tick().await?,
            }
        }
    }

    /// Returns true when the scheduler can stop right away.
    fn handle_termination(&mut self, order: TerminationOrder) -> bool {
        debug!(
            representation = %self.content.representation.id,
            urgent = order.urgent,
            "Termination requested"
        );
        if order.urgent {
            self.queue.abort();
            return true;
        }
        self.terminating = Some(order);
        self.queue.drain();
        self.queue.is_idle()
    }

    fn position(&self) -> f64 {
        self.observations.borrow().position
    }

    fn max_buffer_size(&self) -> f64 {
        if self.content.track_type() == TrackType::Video {
            *self.max_buffer_size.borrow()
        } else {
            f64::INFINITY
        }
    }

    fn buffer_status(&self) -> BufferStatus {
        let snapshot = SinkSnapshot::capture(self.sink.as_ref());
        get_buffer_status(BufferStatusInput {
            content: &self.content,
            snapshot: &snapshot,
            position: self.position(),
            buffer_goal: *self.buffer_goal.borrow(),
            max_buffer_size: self.max_buffer_size(),
            fast_switch_threshold: *self.fast_switch_threshold.borrow(),
            config: &self.ctx.config.buffer,
        })
    }

    async fn tick(&mut self) -> Result<(), StreamError> {
        let position = self.position();
        let status = self.buffer_status();
        trace!(
            representation = %self.content.representation.id,
            position,
            needed = status.needed_segments.len(),
            finished = status.has_finished_loading,
            full = status.is_buffer_full,
            "Buffer status"
        );

        self.ctx.emit(StreamEvent::StreamStatus(StreamStatus {
            period: Arc::clone(&self.content.period),
            track_type: self.content.track_type(),
            position,
            has_finished_loading: status.has_finished_loading,
            imminent_discontinuity: status.imminent_discontinuity,
            is_buffer_full: status.is_buffer_full,
            has_media_to_load: !status.needed_segments.is_empty(),
            needs_manifest_refresh: status.should_refresh_manifest,
        }));

        if status.is_buffer_full {
            self.clean_behind_position(status.needed_range.start).await?;
        }

        if self.terminating.is_some() {
            return Ok(());
        }
        let init_segment = match self.queue.init_metadata() {
            Some(_) => None,
            None => self
                .content
                .representation
                .index
                .init_segment()
                .map(|segment| QueuedSegment {
                    segment,
                    priority: HIGHEST_PRIORITY,
                }),
        };
        self.queue.update(DownloadQueueContent {
            init_segment,
            segment_queue: status.needed_segments,
        });
        Ok(())
    }

    /// Drops data well behind the position when memory is exhausted.
    async fn clean_behind_position(&self, wanted_start: f64) -> Result<(), StreamError> {
        let limit = (wanted_start - self.ctx.config.buffer.upto_current_position_cleanup).max(0.0);
        let has_data_behind = self
            .sink
            .buffered_ranges()
            .iter()
            .any(|range| range.start < limit);
        if limit <= 0.0 || !has_data_behind {
            return Ok(());
        }
        debug!(
            track = %self.content.track_type(),
            limit,
            "Buffer full, removing data behind the position"
        );
        self.sink
            .remove_buffer(0.0, limit)
            .await
            .map_err(|e| StreamError::sink("remove", e))
    }

    /// Handles one queue event. Returns true when a pending termination completed.
    async fn handle_queue_event(&mut self, event: QueueEvent) -> Result<bool, StreamError> {
        match event {
            QueueEvent::InitParsed { segment, metadata, data } => {
                self.report_protection(metadata.protection_data);
                let chunk = PushedChunk {
                    context: self.content.chunk_context(segment),
                    kind: ChunkKind::Init,
                    data,
                };
                self.push_with_recovery(chunk).await?;
                self.tick().await?;
            }
            QueueEvent::MediaChunk { segment, chunk } => {
                self.report_protection(chunk.protection_data);
                let pushed = PushedChunk {
                    context: self.content.chunk_context(segment),
                    kind: ChunkKind::Media {
                        start: chunk.start,
                        end: chunk.end,
                    },
                    data: chunk.data,
                };
                self.push_with_recovery(pushed).await?;
            }
            QueueEvent::SegmentLoaded { segment, size, .. } => {
                let context = self.content.chunk_context(segment);
                self.sink
                    .signal_segment_complete(context.clone())
                    .await
                    .map_err(|e| StreamError::sink("end of segment", e))?;
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_segment_pushed(size as u64);
                }
                self.ctx.emit(StreamEvent::AddedSegment {
                    context,
                    buffered: self.sink.buffered_ranges(),
                });
                if self.terminating.is_some() && self.queue.is_idle() {
                    return Ok(true);
                }
                self.tick().await?;
            }
            QueueEvent::Retry { segment, error } => {
                self.ctx
                    .emit(StreamEvent::Warning(StreamError::fetch(segment.id, error)));
            }
            QueueEvent::EmptyQueue => {
                if self.terminating.is_some() && self.queue.is_idle() {
                    return Ok(true);
                }
            }
            QueueEvent::Failed { segment, error } => self.handle_request_failure(segment, error)?,
            QueueEvent::ParseFailed { segment, error } => {
                return Err(StreamError::Parse {
                    segment: segment.id,
                    source: error,
                });
            }
        }
        Ok(false)
    }

    /// Maps a definitive request failure: index inconsistencies only ask for a
    /// manifest refresh, anything else stops the scheduler.
    fn handle_request_failure(&self, segment: Segment, error: FetchError) -> Result<(), StreamError> {
        match FailureClass::of(&error, &*self.content.representation.index, &segment) {
            FailureClass::Cancelled => Ok(()),
            FailureClass::SegmentGone => {
                warn!(segment = %segment.id, "Segment no longer available, refreshing manifest");
                self.ctx.emit(StreamEvent::NeedsManifestRefresh);
                Ok(())
            }
            FailureClass::OutOfSync => {
                warn!(segment = %segment.id, error = %error, "Manifest might be out of sync");
                self.ctx.emit(StreamEvent::ManifestMightBeOutOfSync);
                Ok(())
            }
            FailureClass::Transient | FailureClass::Fatal => Err(StreamError::fetch(segment.id, error)),
        }
    }

    /// Pushes a chunk, collecting garbage once if the sink is full.
    async fn push_with_recovery(&self, chunk: PushedChunk) -> Result<(), StreamError> {
        match self.sink.push_chunk(chunk.clone()).await {
            Ok(()) => Ok(()),
            Err(SinkError::QuotaExceeded) => {
                let position = self.position();
                warn!(
                    track = %self.content.track_type(),
                    segment = %chunk.context.segment.id,
                    position,
                    "Sink full, forcing garbage collection"
                );
                force_garbage_collection(self.sink.as_ref(), position, &self.ctx.config.buffer).await?;
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_forced_gc();
                }
                self.sink.push_chunk(chunk).await.map_err(|e| match e {
                    SinkError::QuotaExceeded => StreamError::BufferFull { position },
                    other => StreamError::sink("push", other),
                })
            }
            Err(e) => Err(StreamError::sink("push", e)),
        }
    }

    fn report_protection(&self, data: Vec<ProtectionData>) {
        if data.is_empty() {
            return;
        }
        self.ctx.emit(StreamEvent::EncryptionDataEncountered {
            representation: Arc::clone(&self.content.representation),
            data,
        });
    }
}
