// Segment Inventory: attributes buffered time ranges to the segments pushed into a sink.

use std::collections::{HashMap, VecDeque};

use tracing::trace;

use super::{BufferedChunk, ChunkContext, ContentId, SegmentHistoryEntry};
use crate::ranges::TimeRange;

const MAX_HISTORY_ENTRIES_PER_SEGMENT: usize = 5;
const MAX_HISTORY_SEGMENTS: usize = 1000;

/// Chronologically ordered list of [`BufferedChunk`]s, kept consistent with the
/// ranges the sink actually buffers.
#[derive(Debug, Default)]
pub struct SegmentInventory {
    chunks: Vec<BufferedChunk>,
    history: HashMap<ContentId, Vec<SegmentHistoryEntry>>,
    history_order: VecDeque<ContentId>,
}

impl SegmentInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> &[BufferedChunk] {
        &self.chunks
    }

    /// Records data of `context` covering `[start, end)`.
    ///
    /// Data of other segments overlapping that range is considered replaced.
    pub fn insert_chunk(&mut self, context: ChunkContext, start: f64, end: f64, size: usize) {
        if end <= start {
            return;
        }

        let existing = self
            .chunks
            .iter()
            .position(|c| c.partially_pushed && c.context.is_same_content(&context));
        let chunk = match existing {
            Some(index) => {
                let mut chunk = self.chunks.remove(index);
                chunk.start = chunk.start.min(start);
                chunk.end = chunk.end.max(end);
                chunk.chunk_size = Some(chunk.chunk_size.unwrap_or(0) + size);
                chunk
            }
            None => BufferedChunk {
                context,
                start,
                end,
                buffered_start: None,
                buffered_end: None,
                chunk_size: Some(size),
                partially_pushed: true,
            },
        };

        self.replace_range(chunk.start, chunk.end);
        let at = self.chunks.partition_point(|c| c.start <= chunk.start);
        self.chunks.insert(at, chunk);
    }

    /// Trims or splits chunks overlapping `[start, end)`.
    fn replace_range(&mut self, start: f64, end: f64) {
        let mut result = Vec::with_capacity(self.chunks.len() + 1);
        for mut chunk in self.chunks.drain(..) {
            if chunk.end <= start || chunk.start >= end {
                result.push(chunk);
                continue;
            }
            if chunk.start >= start && chunk.end <= end {
                trace!(segment = %chunk.context.segment.id, "Chunk fully replaced");
                continue;
            }
            if chunk.start < start && chunk.end > end {
                let total = chunk.end - chunk.start;
                let mut right = chunk.clone();
                right.start = end;
                right.buffered_start = right.buffered_start.map(|b| b.max(end));
                right.chunk_size = chunk
                    .chunk_size
                    .map(|s| (s as f64 * (right.end - end) / total) as usize);
                chunk.end = start;
                chunk.buffered_end = chunk.buffered_end.map(|b| b.min(start));
                chunk.chunk_size = chunk
                    .chunk_size
                    .map(|s| (s as f64 * (start - chunk.start) / total) as usize);
                result.push(chunk);
                result.push(right);
                continue;
            }
            if chunk.start < start {
                chunk.end = start;
                chunk.buffered_end = chunk.buffered_end.map(|b| b.min(start));
            } else {
                chunk.start = end;
                chunk.buffered_start = chunk.buffered_start.map(|b| b.max(end));
            }
            result.push(chunk);
        }
        self.chunks = result;
    }

    /// Marks the segment of `context` as fully pushed and remembers where it ended up.
    pub fn complete_segment(&mut self, context: &ChunkContext) {
        let mut buffered: Option<TimeRange> = None;
        let mut found = false;
        for chunk in self
            .chunks
            .iter_mut()
            .filter(|c| c.partially_pushed && c.context.is_same_content(context))
        {
            found = true;
            chunk.partially_pushed = false;
            if let (Some(start), Some(end)) = (chunk.buffered_start, chunk.buffered_end) {
                buffered = Some(match buffered {
                    Some(range) => TimeRange::new(range.start.min(start), range.end.max(end)),
                    None => TimeRange::new(start, end),
                });
            }
        }
        if found {
            self.record_history(context.content_id(), SegmentHistoryEntry { buffered });
        }
    }

    fn record_history(&mut self, id: ContentId, entry: SegmentHistoryEntry) {
        let entries = self.history.entry(id.clone()).or_default();
        if entries.is_empty() {
            self.history_order.push_back(id);
        }
        entries.push(entry);
        if entries.len() > MAX_HISTORY_ENTRIES_PER_SEGMENT {
            entries.remove(0);
        }
        while self.history_order.len() > MAX_HISTORY_SEGMENTS {
            if let Some(oldest) = self.history_order.pop_front() {
                self.history.remove(&oldest);
            }
        }
    }

    pub fn history(&self, id: &ContentId) -> Vec<SegmentHistoryEntry> {
        self.history.get(id).cloned().unwrap_or_default()
    }

    /// Updates buffered boundaries from the sink's real ranges and forgets
    /// complete chunks that are no longer buffered at all.
    pub fn synchronize_buffered(&mut self, ranges: &[TimeRange]) {
        self.chunks.retain_mut(|chunk| {
            let mut overlapping = ranges
                .iter()
                .filter(|r| r.start < chunk.end && r.end > chunk.start);
            let Some(first) = overlapping.next() else {
                chunk.buffered_start = None;
                chunk.buffered_end = None;
                if !chunk.partially_pushed {
                    trace!(segment = %chunk.context.segment.id, "Chunk garbage collected");
                }
                return chunk.partially_pushed;
            };
            let last = overlapping.last().unwrap_or(first);
            chunk.buffered_start = Some(first.start.max(chunk.start));
            chunk.buffered_end = Some(last.end.min(chunk.end));
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{chunk_context, video_content};

    #[test]
    fn test_insert_and_complete() {
        let content = video_content(1_000_000.0);
        let mut inventory = SegmentInventory::new();
        let ctx = chunk_context(&content, "s0", 0.0, 4.0);
        inventory.insert_chunk(ctx.clone(), 0.0, 2.0, 100);
        inventory.insert_chunk(ctx.clone(), 2.0, 4.0, 100);
        assert_eq!(inventory.chunks().len(), 1);
        assert_eq!(inventory.chunks()[0].chunk_size, Some(200));
        assert!(inventory.chunks()[0].partially_pushed);

        inventory.synchronize_buffered(&[TimeRange::new(0.0, 4.0)]);
        inventory.complete_segment(&ctx);
        assert!(!inventory.chunks()[0].partially_pushed);
        let history = inventory.history(&ctx.content_id());
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].buffered, Some(TimeRange::new(0.0, 4.0)));
    }

    #[test]
    fn test_overlapping_push_splits_previous_chunk() {
        let content = video_content(1_000_000.0);
        let mut inventory = SegmentInventory::new();
        let old = chunk_context(&content, "old", 0.0, 10.0);
        inventory.insert_chunk(old.clone(), 0.0, 10.0, 1000);
        inventory.complete_segment(&old);

        let new = chunk_context(&content, "new", 4.0, 2.0);
        inventory.insert_chunk(new, 4.0, 6.0, 50);
        let bounds: Vec<(f64, f64)> = inventory
            .chunks()
            .iter()
            .map(|c| (c.start, c.end))
            .collect();
        assert_eq!(bounds, [(0.0, 4.0), (4.0, 6.0), (6.0, 10.0)]);
        assert_eq!(inventory.chunks()[0].chunk_size, Some(400));
    }

    #[test]
    fn test_synchronize_detects_garbage_collection() {
        let content = video_content(1_000_000.0);
        let mut inventory = SegmentInventory::new();
        for (i, start) in [0.0, 4.0, 8.0].into_iter().enumerate() {
            let ctx = chunk_context(&content, &format!("s{i}"), start, 4.0);
            inventory.insert_chunk(ctx.clone(), start, start + 4.0, 10);
            inventory.complete_segment(&ctx);
        }
        inventory.synchronize_buffered(&[TimeRange::new(5.0, 12.0)]);
        assert_eq!(inventory.chunks().len(), 2);
        assert_eq!(inventory.chunks()[0].buffered_start, Some(5.0));
        assert_eq!(inventory.chunks()[1].buffered_end, Some(12.0));
    }
}
