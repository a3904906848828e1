// Media Sink: the downstream buffer accepting pushed segment data.
//
// The sink serializes its own operations. Schedulers only issue pushes and removals
// and read point-in-time snapshots of its inventory.

pub mod inventory;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::SinkError;
use crate::manifest::{Adaptation, Period, Representation, Segment, TrackType};
use crate::ranges::TimeRange;

pub use inventory::SegmentInventory;
pub use memory::MemorySink;

/// Identity of a segment of a given representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentId {
    pub period: String,
    pub adaptation: String,
    pub representation: String,
    pub segment: String,
}

/// The content a chunk of data belongs to.
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub period: Arc<Period>,
    pub adaptation: Arc<Adaptation>,
    pub representation: Arc<Representation>,
    pub segment: Segment,
}

impl ChunkContext {
    pub fn content_id(&self) -> ContentId {
        ContentId {
            period: self.period.id.clone(),
            adaptation: self.adaptation.id.clone(),
            representation: self.representation.id.clone(),
            segment: self.segment.id.clone(),
        }
    }

    pub fn is_same_content(&self, other: &ChunkContext) -> bool {
        self.segment.id == other.segment.id
            && self.representation.id == other.representation.id
            && self.adaptation.id == other.adaptation.id
            && self.period.id == other.period.id
    }
}

/// Inventory entry attributing a buffered time range to a pushed segment.
#[derive(Debug, Clone)]
pub struct BufferedChunk {
    pub context: ChunkContext,
    /// Expected start, from the segment and the parsed chunk times.
    pub start: f64,
    pub end: f64,
    /// Start actually buffered, after the last synchronization.
    pub buffered_start: Option<f64>,
    pub buffered_end: Option<f64>,
    /// Bytes pushed for this chunk.
    pub chunk_size: Option<usize>,
    /// True until the end of the segment has been signalled.
    pub partially_pushed: bool,
}

impl BufferedChunk {
    pub fn effective_start(&self) -> f64 {
        self.buffered_start.unwrap_or(self.start)
    }

    pub fn effective_end(&self) -> f64 {
        self.buffered_end.unwrap_or(self.end)
    }

    pub fn is_playable(&self) -> bool {
        self.context.representation.is_playable()
    }
}

#[derive(Debug, Clone)]
pub struct PendingPush {
    pub context: ChunkContext,
    pub chunk_size: Option<usize>,
}

/// Operation queued or in progress in the sink.
#[derive(Debug, Clone)]
pub enum PendingOperation {
    Push(PendingPush),
    Remove(TimeRange),
    EndOfSegment(ChunkContext),
}

/// One completed push of a segment, as remembered by the inventory.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentHistoryEntry {
    /// Range actually buffered once the segment was complete.
    pub buffered: Option<TimeRange>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkKind {
    Init,
    /// Media covering `[start, end)` seconds.
    Media { start: f64, end: f64 },
}

/// Data handed to [`MediaSink::push_chunk`].
#[derive(Debug, Clone)]
pub struct PushedChunk {
    pub context: ChunkContext,
    pub kind: ChunkKind,
    pub data: Bytes,
}

impl PushedChunk {
    pub fn codec(&self) -> String {
        self.context.representation.codec_string()
    }
}

#[async_trait]
pub trait MediaSink: Send + Sync {
    fn track_type(&self) -> TrackType;

    /// Fixed-codec sinks require a reload to change codec family.
    fn is_native(&self) -> bool {
        self.track_type().is_native()
    }

    /// Codec of the data currently loaded, if any.
    fn codec(&self) -> Option<String>;

    async fn push_chunk(&self, chunk: PushedChunk) -> Result<(), SinkError>;

    /// Signals that every chunk of a segment has been pushed.
    async fn signal_segment_complete(&self, context: ChunkContext) -> Result<(), SinkError>;

    async fn remove_buffer(&self, start: f64, end: f64) -> Result<(), SinkError>;

    fn buffered_ranges(&self) -> Vec<TimeRange>;

    /// Reconciles the inventory with the ranges actually buffered.
    fn synchronize_inventory(&self);

    fn inventory(&self) -> Vec<BufferedChunk>;

    fn pending_operations(&self) -> Vec<PendingOperation>;

    fn segment_history(&self, content: &ContentId) -> Vec<SegmentHistoryEntry>;
}

/// Point-in-time copy of a sink's state, read once per scheduling tick.
#[derive(Debug, Clone, Default)]
pub struct SinkSnapshot {
    pub inventory: Vec<BufferedChunk>,
    pub pending_pushes: Vec<PendingPush>,
    pub histories: HashMap<ContentId, Vec<SegmentHistoryEntry>>,
}

impl SinkSnapshot {
    pub fn capture(sink: &dyn MediaSink) -> Self {
        sink.synchronize_inventory();
        let inventory = sink.inventory();
        let pending_pushes = sink
            .pending_operations()
            .into_iter()
            .filter_map(|op| match op {
                PendingOperation::Push(push) => Some(push),
                _ => None,
            })
            .collect();
        let histories = inventory
            .iter()
            .map(|chunk| {
                let id = chunk.context.content_id();
                let history = sink.segment_history(&id);
                (id, history)
            })
            .collect();
        Self {
            inventory,
            pending_pushes,
            histories,
        }
    }

    pub fn history(&self, content: &ContentId) -> &[SegmentHistoryEntry] {
        self.histories.get(content).map(Vec::as_slice).unwrap_or(&[])
    }
}
