// Download Queue: keeps at most one init and one media request in flight for a
// representation and turns their progress into parsed chunks.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::StreamContent;
use super::priority::HIGHEST_PRIORITY;
use crate::error::{FetchError, ParseError};
use crate::fetcher::{FetchCallbacks, FetchEvent, FetchRequest, FetchSummary, RequestPriority, SegmentFetcher};
use crate::manifest::Segment;
use crate::metrics::SchedulerMetrics;
use crate::parser::{InitMetadata, ParsedMediaChunk, SegmentParser};

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSegment {
    pub segment: Segment,
    /// Lower is more urgent.
    pub priority: i32,
}

/// What the queue should load, replaced on every scheduling tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadQueueContent {
    /// Initialization segment, while it has not been parsed yet.
    pub init_segment: Option<QueuedSegment>,
    /// Media segments in loading order.
    pub segment_queue: Vec<QueuedSegment>,
}

#[derive(Debug)]
pub enum QueueEvent {
    InitParsed {
        segment: Segment,
        metadata: InitMetadata,
        data: Bytes,
    },
    MediaChunk {
        segment: Segment,
        chunk: ParsedMediaChunk,
    },
    /// Every chunk of the segment has been emitted.
    SegmentLoaded {
        segment: Segment,
        size: usize,
        elapsed: Duration,
    },
    /// A request attempt failed and the fetcher retries it.
    Retry { segment: Segment, error: FetchError },
    /// No media segment is loading nor left to load.
    EmptyQueue,
    Failed { segment: Segment, error: FetchError },
    ParseFailed { segment: Segment, error: ParseError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Init,
    Media,
}

#[derive(Debug)]
enum RawEvent {
    Fetch { id: u64, event: FetchEvent },
    Done { id: u64, result: Result<FetchSummary, FetchError> },
}

/// Media progress parked until the initialization metadata is known.
#[derive(Debug)]
enum Parked {
    Chunk { segment: Segment, data: Bytes },
    Loaded { segment: Segment, summary: FetchSummary },
}

struct InFlight {
    id: u64,
    segment: Segment,
    priority: watch::Sender<i32>,
    token: CancellationToken,
    task: JoinHandle<()>,
    /// Init data, accumulated until the request completes.
    buffer: BytesMut,
}

impl InFlight {
    fn cancel(&self) {
        self.token.cancel();
        self.task.abort();
    }
}

pub struct DownloadQueue {
    content: StreamContent,
    fetcher: Arc<dyn SegmentFetcher>,
    parser: Arc<dyn SegmentParser>,
    metrics: Option<Arc<SchedulerMetrics>>,
    token: CancellationToken,

    queue: DownloadQueueContent,
    init: Option<InFlight>,
    media: Option<InFlight>,
    next_id: u64,
    raw_tx: mpsc::UnboundedSender<RawEvent>,
    raw_rx: mpsc::UnboundedReceiver<RawEvent>,

    init_metadata: Option<InitMetadata>,
    ready: VecDeque<QueueEvent>,
    awaiting_init: VecDeque<Parked>,
    /// Media segments fully downloaded whose data is still parked.
    delivering: HashSet<String>,
    empty_reported: bool,
}

impl DownloadQueue {
    pub fn new(
        content: StreamContent,
        fetcher: Arc<dyn SegmentFetcher>,
        parser: Arc<dyn SegmentParser>,
        metrics: Option<Arc<SchedulerMetrics>>,
        token: CancellationToken,
    ) -> Self {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        Self {
            content,
            fetcher,
            parser,
            metrics,
            token,
            queue: DownloadQueueContent::default(),
            init: None,
            media: None,
            next_id: 0,
            raw_tx,
            raw_rx,
            init_metadata: None,
            ready: VecDeque::new(),
            awaiting_init: VecDeque::new(),
            delivering: HashSet::new(),
            empty_reported: false,
        }
    }

    pub fn init_metadata(&self) -> Option<&InitMetadata> {
        self.init_metadata.as_ref()
    }

    /// Whether a request for `segment_id` is in flight or its data not yet emitted.
    pub fn holds(&self, segment_id: &str) -> bool {
        self.delivering.contains(segment_id)
            || self.media.as_ref().is_some_and(|m| m.segment.id == segment_id)
            || self.init.as_ref().is_some_and(|i| i.segment.id == segment_id)
    }

    /// Nothing in flight and nothing left to emit.
    pub fn is_idle(&self) -> bool {
        self.init.is_none()
            && self.media.is_none()
            && self.ready.is_empty()
            && self.awaiting_init.is_empty()
    }

    /// Replaces what the queue loads.
    ///
    /// A request whose segment stays at the head only gets its priority updated.
    /// Any other in-flight request is cancelled.
    pub fn update(&mut self, mut content: DownloadQueueContent) {
        content
            .segment_queue
            .retain(|queued| !self.delivering.contains(&queued.segment.id));
        if !content.segment_queue.is_empty() {
            self.empty_reported = false;
        }
        self.queue = content;
        self.sync_slot(SlotKind::Init);
        self.sync_slot(SlotKind::Media);
    }

    /// Stops loading anything after the request currently in flight.
    pub fn drain(&mut self) {
        let current = self.media.as_ref().map(|m| m.segment.id.clone());
        self.queue
            .segment_queue
            .retain(|queued| Some(&queued.segment.id) == current.as_ref());
        if self.init_metadata.is_some() || self.init.is_none() {
            self.queue.init_segment = None;
        }
    }

    /// Cancels every request immediately.
    pub fn abort(&mut self) {
        self.queue = DownloadQueueContent::default();
        for slot in [SlotKind::Init, SlotKind::Media] {
            self.cancel_slot(slot);
        }
        self.awaiting_init.clear();
        self.delivering.clear();
        self.ready.clear();
    }

    /// Next progress event. Cancel safe.
    pub async fn next_event(&mut self) -> QueueEvent {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return event;
            }
            if !self.empty_reported
                && self.media.is_none()
                && self.queue.segment_queue.is_empty()
                && self.awaiting_init.is_empty()
            {
                self.empty_reported = true;
                return QueueEvent::EmptyQueue;
            }
            // The queue owns a sender, so the channel never closes.
            if let Some(raw) = self.raw_rx.recv().await {
                self.handle_raw(raw);
            }
        }
    }

    fn slot(&mut self, kind: SlotKind) -> &mut Option<InFlight> {
        match kind {
            SlotKind::Init => &mut self.init,
            SlotKind::Media => &mut self.media,
        }
    }

    fn wanted(&self, kind: SlotKind) -> Option<QueuedSegment> {
        match kind {
            SlotKind::Init => self.queue.init_segment.clone().map(|mut queued| {
                queued.priority = queued.priority.min(HIGHEST_PRIORITY);
                queued
            }),
            SlotKind::Media => self.queue.segment_queue.first().cloned(),
        }
    }

    fn sync_slot(&mut self, kind: SlotKind) {
        let wanted = self.wanted(kind);
        let current = match kind {
            SlotKind::Init => &self.init,
            SlotKind::Media => &self.media,
        };
        if let Some(current) = current
            && let Some(queued) = &wanted
            && queued.segment.id == current.segment.id
        {
            if *current.priority.borrow() != queued.priority {
                trace!(
                    segment = %queued.segment.id,
                    priority = queued.priority,
                    "Updating request priority"
                );
                current.priority.send_replace(queued.priority);
            }
            return;
        }
        self.cancel_slot(kind);
        if let Some(queued) = wanted {
            self.start_request(kind, queued);
        }
    }

    fn cancel_slot(&mut self, kind: SlotKind) {
        if let Some(current) = self.slot(kind).take() {
            debug!(
                representation = %self.content.representation.id,
                segment = %current.segment.id,
                "Cancelling segment request"
            );
            current.cancel();
            if let Some(metrics) = &self.metrics {
                metrics.record_request_cancelled();
            }
        }
    }

    fn start_request(&mut self, kind: SlotKind, queued: QueuedSegment) {
        let id = self.next_id;
        self.next_id += 1;
        trace!(
            representation = %self.content.representation.id,
            segment = %queued.segment.id,
            priority = queued.priority,
            "Starting segment request"
        );

        let (priority_tx, priority) = RequestPriority::new(queued.priority);
        let token = self.token.child_token();
        let request = FetchRequest {
            context: self.content.chunk_context(queued.segment.clone()),
            priority,
            token: token.clone(),
        };
        let events = self.raw_tx.clone();
        let callbacks = FetchCallbacks::new(move |event| {
            let _ = events.send(RawEvent::Fetch { id, event });
        });
        let fetcher = Arc::clone(&self.fetcher);
        let done = self.raw_tx.clone();
        let task = tokio::spawn(async move {
            let result = fetcher.fetch(request, callbacks).await;
            let _ = done.send(RawEvent::Done { id, result });
        });

        if let Some(metrics) = &self.metrics {
            metrics.record_request_started();
        }
        *self.slot(kind) = Some(InFlight {
            id,
            segment: queued.segment,
            priority: priority_tx,
            token,
            task,
            buffer: BytesMut::new(),
        });
    }

    fn slot_of(&self, id: u64) -> Option<SlotKind> {
        if self.init.as_ref().is_some_and(|s| s.id == id) {
            Some(SlotKind::Init)
        } else if self.media.as_ref().is_some_and(|s| s.id == id) {
            Some(SlotKind::Media)
        } else {
            None
        }
    }

    fn handle_raw(&mut self, raw: RawEvent) {
        match raw {
            RawEvent::Fetch { id, event } => {
                // Events of cancelled requests are stale.
                let Some(kind) = self.slot_of(id) else {
                    return;
                };
                self.handle_fetch_event(kind, event);
            }
            RawEvent::Done { id, result } => {
                let Some(kind) = self.slot_of(id) else {
                    return;
                };
                let Some(slot) = self.slot(kind).take() else {
                    return;
                };
                match result {
                    Ok(summary) => self.handle_completion(kind, slot, summary),
                    Err(error) if error.is_cancelled() => {
                        trace!(segment = %slot.segment.id, "Segment request cancelled");
                    }
                    Err(error) => {
                        warn!(
                            representation = %self.content.representation.id,
                            segment = %slot.segment.id,
                            error = %error,
                            "Segment request failed"
                        );
                        if let Some(metrics) = &self.metrics {
                            metrics.record_download_error();
                        }
                        self.ready.push_back(QueueEvent::Failed {
                            segment: slot.segment,
                            error,
                        });
                    }
                }
            }
        }
    }

    fn handle_fetch_event(&mut self, kind: SlotKind, event: FetchEvent) {
        let Some(segment) = self.slot(kind).as_ref().map(|s| s.segment.clone()) else {
            return;
        };
        match event {
            FetchEvent::Retry(error) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_request_retry();
                }
                self.ready.push_back(QueueEvent::Retry { segment, error });
            }
            FetchEvent::Chunk(data) => match kind {
                SlotKind::Init => {
                    if let Some(slot) = self.init.as_mut() {
                        slot.buffer.extend_from_slice(&data);
                    }
                }
                SlotKind::Media => {
                    if self.must_wait_for_init(&segment) {
                        self.awaiting_init.push_back(Parked::Chunk { segment, data });
                    } else {
                        self.emit_media_chunk(segment, data);
                    }
                }
            },
            FetchEvent::AllChunksReceived => {}
        }
    }

    fn handle_completion(&mut self, kind: SlotKind, slot: InFlight, summary: FetchSummary) {
        if let Some(metrics) = &self.metrics {
            metrics.record_download(summary.size as u64, summary.elapsed.as_millis() as u64);
        }
        match kind {
            SlotKind::Init => {
                let context = self.content.chunk_context(slot.segment.clone());
                let data = slot.buffer.freeze();
                match self.parser.parse_init(&context, &data) {
                    Ok(metadata) => {
                        debug!(
                            representation = %self.content.representation.id,
                            timescale = ?metadata.timescale,
                            "Initialization segment parsed"
                        );
                        self.init_metadata = Some(metadata.clone());
                        self.queue.init_segment = None;
                        self.ready.push_back(QueueEvent::InitParsed {
                            segment: slot.segment,
                            metadata,
                            data,
                        });
                        self.release_parked();
                    }
                    Err(error) => self.ready.push_back(QueueEvent::ParseFailed {
                        segment: slot.segment,
                        error,
                    }),
                }
            }
            SlotKind::Media => {
                let segment = slot.segment;
                if self
                    .queue
                    .segment_queue
                    .first()
                    .is_some_and(|q| q.segment.id == segment.id)
                {
                    self.queue.segment_queue.remove(0);
                }
                if self.must_wait_for_init(&segment) || !self.awaiting_init.is_empty() {
                    self.delivering.insert(segment.id.clone());
                    self.awaiting_init.push_back(Parked::Loaded { segment, summary });
                } else {
                    self.ready.push_back(QueueEvent::SegmentLoaded {
                        segment,
                        size: summary.size,
                        elapsed: summary.elapsed,
                    });
                }
                self.sync_slot(SlotKind::Media);
            }
        }
    }

    fn must_wait_for_init(&self, segment: &Segment) -> bool {
        self.init_metadata.is_none()
            && self
                .parser
                .needs_init_metadata(&self.content.chunk_context(segment.clone()))
    }

    fn emit_media_chunk(&mut self, segment: Segment, data: Bytes) {
        let context = self.content.chunk_context(segment.clone());
        match self
            .parser
            .parse_media(&context, data, self.init_metadata.as_ref())
        {
            Ok(chunk) => self.ready.push_back(QueueEvent::MediaChunk { segment, chunk }),
            Err(error) => self.ready.push_back(QueueEvent::ParseFailed { segment, error }),
        }
    }

    /// Emits parked media progress in its original order.
    fn release_parked(&mut self) {
        while let Some(parked) = self.awaiting_init.pop_front() {
            match parked {
                Parked::Chunk { segment, data } => self.emit_media_chunk(segment, data),
                Parked::Loaded { segment, summary } => {
                    self.delivering.remove(&segment.id);
                    self.ready.push_back(QueueEvent::SegmentLoaded {
                        segment,
                        size: summary.size,
                        elapsed: summary.elapsed,
                    });
                }
            }
        }
    }
}

impl Drop for DownloadQueue {
    fn drop(&mut self) {
        for slot in [self.init.take(), self.media.take()].into_iter().flatten() {
            slot.cancel();
        }
    }
}

impl std::fmt::Debug for DownloadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadQueue")
            .field("representation", &self.content.representation.id)
            .field("init", &self.init.as_ref().map(|s| &s.segment.id))
            .field("media", &self.media.as_ref().map(|s| &s.segment.id))
            .field("queued", &self.queue.segment_queue.len())
            .finish()
    }
}
