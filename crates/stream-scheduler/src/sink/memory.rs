// In-Memory Sink: a MediaSink storing pushed data in memory, bounded by a byte capacity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    BufferedChunk, ChunkContext, ChunkKind, ContentId, MediaSink, PendingOperation, PendingPush,
    PushedChunk, SegmentHistoryEntry, SegmentInventory,
};
use crate::error::SinkError;
use crate::manifest::TrackType;
use crate::ranges::{TimeRange, exclude_ranges, insert_range};

#[derive(Debug)]
struct StoredData {
    range: TimeRange,
    size: usize,
}

#[derive(Debug, Default)]
struct MemorySinkState {
    buffered: Vec<TimeRange>,
    stored: Vec<StoredData>,
    init_size: usize,
    inventory: SegmentInventory,
    pending: Vec<(u64, PendingOperation)>,
    next_operation: u64,
    codec: Option<String>,
    completed: Vec<ContentId>,
}

impl MemorySinkState {
    fn used_bytes(&self) -> usize {
        self.init_size + self.stored.iter().map(|s| s.size).sum::<usize>()
    }
}

/// [`MediaSink`] keeping every pushed byte in memory.
///
/// Pushes exceeding the capacity fail with [`SinkError::QuotaExceeded`]. Operations
/// are applied one at a time in submission order.
#[derive(Debug)]
pub struct MemorySink {
    track_type: TrackType,
    native: bool,
    capacity: usize,
    operation_delay: Option<Duration>,
    state: Mutex<MemorySinkState>,
    queue: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new(track_type: TrackType, capacity: usize) -> Self {
        Self {
            track_type,
            native: track_type.is_native(),
            capacity,
            operation_delay: None,
            state: Mutex::new(MemorySinkState::default()),
            queue: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn unbounded(track_type: TrackType) -> Self {
        Self::new(track_type, usize::MAX)
    }

    pub fn with_native(mut self, native: bool) -> Self {
        self.native = native;
        self
    }

    /// Makes every operation take `delay` before being applied.
    pub fn with_operation_delay(mut self, delay: Duration) -> Self {
        self.operation_delay = Some(delay);
        self
    }

    /// Sets the codec as if data of that codec had already been loaded.
    pub fn with_codec(self, codec: impl Into<String>) -> Self {
        self.state.lock().codec = Some(codec.into());
        self
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes()
    }

    /// Segments whose completion was signalled, in order.
    pub fn completed_segments(&self) -> Vec<ContentId> {
        self.state.lock().completed.clone()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn check_open(&self) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        Ok(())
    }

    fn enqueue(&self, operation: PendingOperation) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_operation;
        state.next_operation += 1;
        state.pending.push((id, operation));
        id
    }

    fn dequeue(&self, id: u64) {
        self.state.lock().pending.retain(|(op, _)| *op != id);
    }

    async fn run_operation<T>(
        &self,
        operation: PendingOperation,
        apply: impl FnOnce(&mut MemorySinkState) -> Result<T, SinkError>,
    ) -> Result<T, SinkError> {
        self.check_open()?;
        let id = self.enqueue(operation);
        let _turn = self.queue.lock().await;
        if let Some(delay) = self.operation_delay {
            tokio::time::sleep(delay).await;
        }
        let result = match self.check_open() {
            Ok(()) => apply(&mut self.state.lock()),
            Err(e) => Err(e),
        };
        self.dequeue(id);
        result
    }
}

#[async_trait]
impl MediaSink for MemorySink {
    fn track_type(&self) -> TrackType {
        self.track_type
    }

    fn is_native(&self) -> bool {
        self.native
    }

    fn codec(&self) -> Option<String> {
        self.state.lock().codec.clone()
    }

    async fn push_chunk(&self, chunk: PushedChunk) -> Result<(), SinkError> {
        let size = chunk.data.len();
        let capacity = self.capacity;
        let pending = PendingOperation::Push(PendingPush {
            context: chunk.context.clone(),
            chunk_size: Some(size),
        });
        self.run_operation(pending, move |state| {
            if state.used_bytes().saturating_add(size) > capacity {
                debug!(
                    segment = %chunk.context.segment.id,
                    size,
                    used = state.used_bytes(),
                    capacity,
                    "Push rejected, sink is full"
                );
                return Err(SinkError::QuotaExceeded);
            }
            let codec = chunk.codec();
            match chunk.kind {
                ChunkKind::Init => {
                    state.init_size += size;
                    state.codec = Some(codec);
                }
                ChunkKind::Media { start, end } => {
                    if state.codec.is_none() {
                        state.codec = Some(codec);
                    }
                    let range = TimeRange::new(start, end);
                    insert_range(&mut state.buffered, range);
                    state.stored.push(StoredData { range, size });
                    state.inventory.insert_chunk(chunk.context, start, end, size);
                    trace!(start, end, size, "Media chunk stored");
                }
            }
            Ok(())
        })
        .await
    }

    async fn signal_segment_complete(&self, context: ChunkContext) -> Result<(), SinkError> {
        self.run_operation(PendingOperation::EndOfSegment(context.clone()), move |state| {
            let buffered = state.buffered.clone();
            state.inventory.synchronize_buffered(&buffered);
            state.inventory.complete_segment(&context);
            state.completed.push(context.content_id());
            Ok(())
        })
        .await
    }

    async fn remove_buffer(&self, start: f64, end: f64) -> Result<(), SinkError> {
        let removed = TimeRange::new(start, end);
        self.run_operation(PendingOperation::Remove(removed), move |state| {
            if end <= start {
                return Ok(());
            }
            state.buffered = exclude_ranges(&state.buffered, &[removed]);
            let stored = std::mem::take(&mut state.stored);
            state.stored = stored
                .into_iter()
                .filter_map(|data| {
                    let total = data.range.duration();
                    let kept = exclude_ranges(&[data.range], &[removed]);
                    if kept.is_empty() {
                        return None;
                    }
                    let kept_duration: f64 = kept.iter().map(TimeRange::duration).sum();
                    let size = if total > 0.0 {
                        (data.size as f64 * kept_duration / total) as usize
                    } else {
                        data.size
                    };
                    Some(StoredData {
                        range: TimeRange::new(kept[0].start, kept[kept.len() - 1].end),
                        size,
                    })
                })
                .collect();
            debug!(start, end, "Buffer removed");
            Ok(())
        })
        .await
    }

    fn buffered_ranges(&self) -> Vec<TimeRange> {
        self.state.lock().buffered.clone()
    }

    fn synchronize_inventory(&self) {
        let mut state = self.state.lock();
        let buffered = state.buffered.clone();
        state.inventory.synchronize_buffered(&buffered);
    }

    fn inventory(&self) -> Vec<BufferedChunk> {
        self.state.lock().inventory.chunks().to_vec()
    }

    fn pending_operations(&self) -> Vec<PendingOperation> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|(_, op)| op.clone())
            .collect()
    }

    fn segment_history(&self, content: &ContentId) -> Vec<SegmentHistoryEntry> {
        self.state.lock().inventory.history(content)
    }
}
