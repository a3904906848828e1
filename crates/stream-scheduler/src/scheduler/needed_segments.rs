// Needed Segments: selects the segments of a representation that must be loaded
// for a time window, given what the sink already holds and a memory budget.

use tracing::{debug, trace};

use super::StreamContent;
use crate::config::BufferConfig;
use crate::manifest::Segment;
use crate::ranges::TimeRange;
use crate::sink::{BufferedChunk, ChunkContext, PendingPush, SegmentHistoryEntry, SinkSnapshot};

/// Minimum distance between two chunks for them to be considered contiguous.
const CONTIGUOUS_CHUNK_GAP: f64 = 0.1;

#[derive(Debug, Clone, Copy)]
pub struct NeededSegmentsInput<'a> {
    pub content: &'a StreamContent,
    pub snapshot: &'a SinkSnapshot,
    /// Window to fill, already clipped to the period.
    pub needed_range: TimeRange,
    pub position: f64,
    pub fast_switch_threshold: Option<f64>,
    /// Memory budget in kilobytes, infinite when unbounded.
    pub max_buffer_size: f64,
    pub config: &'a BufferConfig,
}

#[derive(Debug, Clone, Default)]
pub struct NeededSegments {
    /// Segments to request, in chronological order.
    pub to_load: Vec<Segment>,
    /// Segments that would be needed but do not fit in memory yet.
    pub on_hold: Vec<Segment>,
    pub is_buffer_full: bool,
    /// Buffered chunks of the window considered valid, in chronological order.
    pub kept: Vec<BufferedChunk>,
}

pub fn get_needed_segments(input: NeededSegmentsInput<'_>) -> NeededSegments {
    let NeededSegmentsInput {
        content,
        snapshot,
        needed_range,
        position,
        fast_switch_threshold,
        max_buffer_size,
        config,
    } = input;
    let rounding = config.rounding_error();

    let padded = TimeRange::new(
        needed_range.start - config.chunk_window_padding,
        needed_range.end + config.chunk_window_padding,
    );
    let mut considered: Vec<&BufferedChunk> = snapshot
        .inventory
        .iter()
        .filter(|chunk| {
            !chunk.partially_pushed
                && chunk.is_playable()
                && chunk.effective_start() < padded.end
                && chunk.effective_end() > padded.start
        })
        .filter(|chunk| {
            !snapshot
                .pending_pushes
                .iter()
                .any(|push| push.context.is_same_content(&chunk.context))
        })
        .filter(|chunk| {
            !should_content_be_replaced(&chunk.context, content, position, fast_switch_threshold, config)
        })
        .collect();
    considered.sort_by(|a, b| a.effective_start().total_cmp(&b.effective_start()));
    let kept = filter_garbage_collected(&considered, needed_range, snapshot, config);

    let mut available = available_buffer_size(snapshot, max_buffer_size);
    let mut result = NeededSegments {
        kept,
        ..Default::default()
    };

    let duration = needed_range.end - needed_range.start;
    if duration <= 0.0 {
        return result;
    }
    let candidates = content.representation.index.segments(needed_range.start, duration);

    let mut stop_loading = false;
    for segment in candidates {
        if snapshot.pending_pushes.iter().any(|push| {
            push.context.segment.id == segment.id
                && push.context.representation.id == content.representation.id
                && push.context.period.id == content.period.id
        }) {
            trace!(segment = %segment.id, "Segment already being pushed");
            continue;
        }
        if segment.complete && segment.duration < config.minimum_segment_size {
            trace!(segment = %segment.id, "Segment too small to be loaded");
            continue;
        }
        if let Some(push) = blocking_pending_push(&segment, content, &snapshot.pending_pushes, fast_switch_threshold, rounding) {
            trace!(
                segment = %segment.id,
                pending = %push.context.representation.id,
                "Segment superseded by a pending push"
            );
            continue;
        }
        if result.kept.iter().any(|chunk| {
            chunk.context.period.id == content.period.id
                && segment.time - chunk.start > -rounding
                && chunk.end - segment.end > -rounding
        }) {
            continue;
        }

        if stop_loading {
            result.on_hold.push(segment);
            continue;
        }

        let estimated = segment.duration * content.representation.bitrate / 8000.0;
        if available - estimated < 0.0 {
            let distance = segment.time - position;
            if distance < config.min_buffer_distance_before_clean_up {
                result.is_buffer_full = true;
            }
            if distance > config.min_buffer_length {
                debug!(
                    segment = %segment.id,
                    available_kb = available,
                    estimated_kb = estimated,
                    "Memory budget reached, holding remaining segments"
                );
                stop_loading = true;
                result.on_hold.push(segment);
                continue;
            }
        }
        available -= estimated;
        result.to_load.push(segment);
    }
    result
}

/// Remaining memory budget in kilobytes.
fn available_buffer_size(snapshot: &SinkSnapshot, max_buffer_size: f64) -> f64 {
    if max_buffer_size.is_infinite() {
        return f64::INFINITY;
    }
    let buffered: usize = snapshot
        .inventory
        .iter()
        .filter_map(|chunk| chunk.chunk_size)
        .sum();
    let pending: usize = snapshot
        .pending_pushes
        .iter()
        .filter_map(|push| push.chunk_size)
        .sum();
    max_buffer_size - (buffered + pending) as f64 / 1000.0
}

/// Whether buffered data of `old` should be replaced by data of `current`.
pub fn should_content_be_replaced(
    old: &ChunkContext,
    current: &StreamContent,
    position: f64,
    fast_switch_threshold: Option<f64>,
    config: &BufferConfig,
) -> bool {
    if old.period.id != current.period.id {
        return false;
    }
    if old.segment.time < position + config.content_replacement_padding {
        return false;
    }
    if old.adaptation.id != current.adaptation.id {
        return true;
    }
    if old.representation.id == current.representation.id {
        return false;
    }
    can_fast_switch(
        old.representation.bitrate,
        current.representation.bitrate,
        fast_switch_threshold,
        config,
    )
}

/// Whether data at `old_bitrate` may be replaced by data at `new_bitrate`.
pub fn can_fast_switch(
    old_bitrate: f64,
    new_bitrate: f64,
    fast_switch_threshold: Option<f64>,
    config: &BufferConfig,
) -> bool {
    match fast_switch_threshold {
        Some(threshold) => old_bitrate < threshold && new_bitrate > old_bitrate,
        None => new_bitrate > old_bitrate * config.bitrate_replacement_ratio,
    }
}

/// A pending push of another quality of the same track covering `segment`, which
/// the current representation is not allowed to replace.
fn blocking_pending_push<'a>(
    segment: &Segment,
    content: &StreamContent,
    pending: &'a [PendingPush],
    fast_switch_threshold: Option<f64>,
    rounding: f64,
) -> Option<&'a PendingPush> {
    pending.iter().find(|push| {
        let ctx = &push.context;
        if ctx.period.id != content.period.id
            || ctx.adaptation.id != content.adaptation.id
            || ctx.representation.id == content.representation.id
        {
            return false;
        }
        let covers = segment.time - ctx.segment.time > -rounding && ctx.segment.end - segment.end > -rounding;
        if !covers {
            return false;
        }
        let new_bitrate = content.representation.bitrate;
        let pending_bitrate = ctx.representation.bitrate;
        let replaceable = new_bitrate > pending_bitrate
            && fast_switch_threshold.is_none_or(|threshold| pending_bitrate < threshold);
        !replaceable
    })
}

/// Drops chunks whose edges look garbage collected, unless their push history shows
/// the same boundaries each time (the sink keeps cutting them, reloading is useless).
fn filter_garbage_collected(
    chunks: &[&BufferedChunk],
    needed_range: TimeRange,
    snapshot: &SinkSnapshot,
    config: &BufferConfig,
) -> Vec<BufferedChunk> {
    let mut kept = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        let previous = i.checked_sub(1).map(|j| chunks[j]);
        let next = chunks.get(i + 1).copied();
        let history = snapshot.history(&chunk.context.content_id());

        if start_seems_garbage_collected(chunk, previous, needed_range.start, config)
            && should_reload_start(history, chunk.buffered_start, config)
        {
            debug!(segment = %chunk.context.segment.id, "Start of segment garbage collected, reloading");
            continue;
        }
        if end_seems_garbage_collected(chunk, next, needed_range.end, config)
            && should_reload_end(history, chunk.buffered_end, config)
        {
            debug!(segment = %chunk.context.segment.id, "End of segment garbage collected, reloading");
            continue;
        }
        kept.push((*chunk).clone());
    }
    kept
}

fn start_seems_garbage_collected(
    chunk: &BufferedChunk,
    previous: Option<&BufferedChunk>,
    maximum_start: f64,
    config: &BufferConfig,
) -> bool {
    let Some(buffered_start) = chunk.buffered_start else {
        return false;
    };
    if let Some(previous_end) = previous.and_then(|p| p.buffered_end)
        && buffered_start - previous_end < CONTIGUOUS_CHUNK_GAP
    {
        return false;
    }
    maximum_start < buffered_start
        && buffered_start - chunk.start > config.max_time_missing_from_complete_segment
}

fn end_seems_garbage_collected(
    chunk: &BufferedChunk,
    next: Option<&BufferedChunk>,
    minimum_end: f64,
    config: &BufferConfig,
) -> bool {
    let Some(buffered_end) = chunk.buffered_end else {
        return false;
    };
    if let Some(next_start) = next.and_then(|n| n.buffered_start)
        && next_start - buffered_end < CONTIGUOUS_CHUNK_GAP
    {
        return false;
    }
    minimum_end > buffered_end
        && chunk.end - buffered_end > config.max_time_missing_from_complete_segment
}

fn should_reload_start(
    history: &[SegmentHistoryEntry],
    current_start: Option<f64>,
    config: &BufferConfig,
) -> bool {
    let [.., previous, last] = history else {
        return true;
    };
    let last_start = last.buffered.map(|r| r.start);
    if let (Some(current), Some(last)) = (current_start, last_start)
        && current - last > config.gc_suspicion_growth_tolerance
    {
        return true;
    }
    match (previous.buffered.map(|r| r.start), last_start) {
        (Some(previous), Some(last)) => {
            (previous - last).abs() > config.gc_suspicion_stability_tolerance
        }
        _ => true,
    }
}

fn should_reload_end(
    history: &[SegmentHistoryEntry],
    current_end: Option<f64>,
    config: &BufferConfig,
) -> bool {
    let [.., previous, last] = history else {
        return true;
    };
    let last_end = last.buffered.map(|r| r.end);
    if let (Some(current), Some(last)) = (current_end, last_end)
        && last - current > config.gc_suspicion_growth_tolerance
    {
        return true;
    }
    match (previous.buffered.map(|r| r.end), last_end) {
        (Some(previous), Some(last)) => {
            (previous - last).abs() > config.gc_suspicion_stability_tolerance
        }
        _ => true,
    }
}
