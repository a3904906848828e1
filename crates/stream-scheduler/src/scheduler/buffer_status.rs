// Buffer Status: per-tick summary of what a representation still has to load.

use tracing::trace;

use super::needed_segments::{NeededSegmentsInput, get_needed_segments};
use super::priority::segment_priority;
use super::{QueuedSegment, StreamContent};
use crate::config::BufferConfig;
use crate::events::BufferDiscontinuity;
use crate::manifest::Segment;
use crate::ranges::TimeRange;
use crate::sink::{BufferedChunk, SinkSnapshot};

/// Time window a scheduler wants buffered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeededRange {
    pub start: f64,
    pub end: f64,
    /// The window reaches the last position the index will ever list.
    pub has_reached_period_end: bool,
}

impl NeededRange {
    pub fn as_range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferStatusInput<'a> {
    pub content: &'a StreamContent,
    pub snapshot: &'a SinkSnapshot,
    pub position: f64,
    pub buffer_goal: f64,
    /// Memory budget in kilobytes, infinite when unbounded.
    pub max_buffer_size: f64,
    pub fast_switch_threshold: Option<f64>,
    pub config: &'a BufferConfig,
}

#[derive(Debug, Clone)]
pub struct BufferStatus {
    pub needed_range: NeededRange,
    /// Media segments to load with their priority, in chronological order.
    pub needed_segments: Vec<QueuedSegment>,
    pub on_hold: Vec<Segment>,
    pub has_finished_loading: bool,
    pub imminent_discontinuity: Option<BufferDiscontinuity>,
    pub is_buffer_full: bool,
    pub should_refresh_manifest: bool,
}

/// Window `[position, position + buffer_goal]` clipped to the period.
pub fn get_needed_range(
    content: &StreamContent,
    position: f64,
    buffer_goal: f64,
    config: &BufferConfig,
) -> NeededRange {
    let period = &content.period;
    let start = position.max(period.start);
    let end = (position + buffer_goal).min(period.end_or_infinity()).max(start);

    let index = &content.representation.index;
    let has_reached_period_end = if !index.is_initialized() || !index.is_finished() {
        false
    } else {
        let last = match (index.last_position(), period.end) {
            (Some(last), Some(period_end)) => Some(last.min(period_end)),
            (last, period_end) => last.or(period_end),
        };
        last.is_some_and(|last| end + config.rounding_error() >= last)
    };

    NeededRange {
        start,
        end,
        has_reached_period_end,
    }
}

pub fn get_buffer_status(input: BufferStatusInput<'_>) -> BufferStatus {
    let BufferStatusInput {
        content,
        snapshot,
        position,
        buffer_goal,
        max_buffer_size,
        fast_switch_threshold,
        config,
    } = input;

    let needed_range = get_needed_range(content, position, buffer_goal, config);
    let index = &content.representation.index;
    let should_refresh_manifest = index.should_refresh(needed_range.start, needed_range.end);

    let needed = get_needed_segments(NeededSegmentsInput {
        content,
        snapshot,
        needed_range: needed_range.as_range(),
        position,
        fast_switch_threshold,
        max_buffer_size,
        config,
    });

    let has_finished_loading = index.is_initialized()
        && index.is_finished()
        && needed_range.has_reached_period_end
        && needed.to_load.is_empty()
        && needed.on_hold.is_empty();

    let imminent_discontinuity = check_for_discontinuity(content, &needed_range, &needed.kept, config);
    if let Some(discontinuity) = imminent_discontinuity {
        trace!(
            representation = %content.representation.id,
            start = ?discontinuity.start,
            end = ?discontinuity.end,
            "Discontinuity ahead"
        );
    }

    let needed_segments = needed
        .to_load
        .into_iter()
        .map(|segment| QueuedSegment {
            priority: segment_priority(segment.time, position, &config.priority_steps),
            segment,
        })
        .collect();

    BufferStatus {
        needed_range,
        needed_segments,
        on_hold: needed.on_hold,
        has_finished_loading,
        imminent_discontinuity,
        is_buffer_full: needed.is_buffer_full,
        should_refresh_manifest,
    }
}

/// Looks for a hole in the needed range that no segment will ever fill.
///
/// Buffered chunks of the period are walked from the start of the range; the first
/// point they no longer cover is compared with the next segment the index knows.
pub fn check_for_discontinuity(
    content: &StreamContent,
    needed_range: &NeededRange,
    kept: &[BufferedChunk],
    config: &BufferConfig,
) -> Option<BufferDiscontinuity> {
    let index = &content.representation.index;
    if !index.is_initialized() || (!index.is_chronological() && !index.is_finished()) {
        return None;
    }

    if let Some(end) = index.check_discontinuity(needed_range.start) {
        return Some(BufferDiscontinuity {
            start: None,
            end: Some(end),
        });
    }

    let tolerance = config.rounding_error();
    let mut cursor = needed_range.start;
    let mut moved = false;
    for chunk in kept.iter().filter(|c| c.context.period.id == content.period.id) {
        if chunk.effective_start() > cursor + tolerance {
            break;
        }
        if chunk.effective_end() > cursor {
            cursor = chunk.effective_end();
            moved = true;
        }
    }
    if cursor >= needed_range.end - tolerance {
        return None;
    }

    let start = moved.then_some(cursor);
    let remaining = needed_range.end - cursor;
    match index
        .segments(cursor, remaining)
        .into_iter()
        .find(|segment| segment.end > cursor + tolerance)
    {
        Some(next) if next.time > cursor + tolerance => Some(BufferDiscontinuity {
            start,
            end: Some(next.time),
        }),
        Some(_) => None,
        None => {
            let period_end = content.period.end?;
            let last = index.last_position()?;
            let ends_before_period = index.is_finished()
                && last <= cursor + tolerance
                && cursor < period_end - tolerance;
            ends_before_period.then_some(BufferDiscontinuity {
                start,
                end: Some(period_end),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::manifest::{Adaptation, Manifest, Period, Representation, StaticSegmentIndex, TrackType};
    use crate::test_utils::{buffered_chunk, video_content};

    fn content_with_index(index: StaticSegmentIndex, period_end: Option<f64>) -> StreamContent {
        let representation = Arc::new(Representation::new("v", 1_000_000.0, "avc1.4d401f", Arc::new(index)));
        let adaptation = Adaptation::new("video", TrackType::Video, vec![Arc::clone(&representation)]);
        let period = Period::new("p0", 0.0, period_end).with_adaptation(adaptation);
        let manifest = Arc::new(Manifest::new("m", vec![period]));
        let period = manifest.first_period().unwrap();
        let adaptation = Arc::clone(&period.adaptations_for_type(TrackType::Video)[0]);
        StreamContent {
            manifest,
            period,
            adaptation,
            representation,
        }
    }

    fn status(content: &StreamContent, snapshot: &SinkSnapshot, position: f64, goal: f64) -> BufferStatus {
        get_buffer_status(BufferStatusInput {
            content,
            snapshot,
            position,
            buffer_goal: goal,
            max_buffer_size: f64::INFINITY,
            fast_switch_threshold: None,
            config: &BufferConfig::default(),
        })
    }

    fn starts(status: &BufferStatus) -> Vec<f64> {
        status.needed_segments.iter().map(|s| s.segment.time).collect()
    }

    #[test]
    fn test_needed_segments_ahead_of_position() {
        let content = video_content(1_000_000.0);
        // The segment at the position is already there.
        let snapshot = SinkSnapshot {
            inventory: vec![buffered_chunk(&content, 6.0, 6.0, 100)],
            ..Default::default()
        };
        let status = status(&content, &snapshot, 10.0, 30.0);
        assert_eq!(starts(&status), [12.0, 18.0, 24.0, 30.0, 36.0]);
        assert!(!status.has_finished_loading);
        assert!(status.needed_range.has_reached_period_end);
        assert!(status.imminent_discontinuity.is_none());
        assert_eq!(status.needed_segments[0].priority, 1);
    }

    #[test]
    fn test_everything_buffered_finishes_loading() {
        let content = video_content(1_000_000.0);
        let inventory = (0..7)
            .map(|i| {
                let time = i as f64 * 6.0;
                buffered_chunk(&content, time, (40.0 - time).min(6.0), 100)
            })
            .collect();
        let snapshot = SinkSnapshot {
            inventory,
            ..Default::default()
        };
        let status = status(&content, &snapshot, 10.0, 30.0);
        assert!(status.needed_segments.is_empty());
        assert!(status.has_finished_loading);
    }

    #[test]
    fn test_window_not_reaching_end_is_not_finished() {
        let content = video_content(1_000_000.0);
        let status = status(&content, &SinkSnapshot::default(), 0.0, 10.0);
        assert!(!status.needed_range.has_reached_period_end);
        assert!(!status.has_finished_loading);
    }

    #[test]
    fn test_gap_between_buffer_and_next_segment() {
        let segments = [(10.0, 6.0), (16.0, 4.0), (25.0, 5.0), (30.0, 5.0)]
            .into_iter()
            .enumerate()
            .map(|(i, (t, d))| Segment::media(format!("s{i}"), t, d))
            .collect();
        let content = content_with_index(StaticSegmentIndex::new(segments), Some(35.0));
        let snapshot = SinkSnapshot {
            inventory: vec![buffered_chunk(&content, 10.0, 6.0, 100), buffered_chunk(&content, 16.0, 4.0, 100)],
            ..Default::default()
        };
        let status = status(&content, &snapshot, 15.0, 15.0);
        assert_eq!(
            status.imminent_discontinuity,
            Some(BufferDiscontinuity {
                start: Some(20.0),
                end: Some(25.0),
            })
        );
        assert_eq!(starts(&status), [25.0]);
    }

    #[test]
    fn test_inside_hole_has_unknown_start() {
        let segments = vec![Segment::media("s0", 0.0, 4.0), Segment::media("s1", 8.0, 4.0)];
        let content = content_with_index(StaticSegmentIndex::new(segments), Some(12.0));
        let status = status(&content, &SinkSnapshot::default(), 5.0, 10.0);
        assert_eq!(
            status.imminent_discontinuity,
            Some(BufferDiscontinuity {
                start: None,
                end: Some(8.0),
            })
        );
    }

    #[test]
    fn test_announced_discontinuity() {
        let index = StaticSegmentIndex::uniform("v", 0.0, 40.0, 4.0).with_discontinuity(10.0, 14.0);
        let content = content_with_index(index, Some(40.0));
        let status = status(&content, &SinkSnapshot::default(), 11.0, 10.0);
        assert_eq!(
            status.imminent_discontinuity,
            Some(BufferDiscontinuity {
                start: None,
                end: Some(14.0),
            })
        );
    }

    #[test]
    fn test_void_until_period_end() {
        let index = StaticSegmentIndex::uniform("v", 0.0, 30.0, 6.0);
        let content = content_with_index(index, Some(40.0));
        let inventory = (0..5)
            .map(|i| buffered_chunk(&content, i as f64 * 6.0, 6.0, 100))
            .collect();
        let snapshot = SinkSnapshot {
            inventory,
            ..Default::default()
        };
        let status = status(&content, &snapshot, 25.0, 10.0);
        assert_eq!(
            status.imminent_discontinuity,
            Some(BufferDiscontinuity {
                start: Some(30.0),
                end: Some(40.0),
            })
        );
    }

    #[test]
    fn test_late_binding_index_suppresses_discontinuities() {
        let segments = vec![Segment::media("s0", 0.0, 4.0), Segment::media("s1", 8.0, 4.0)];
        let index = StaticSegmentIndex::new(segments).late_binding().with_finished(false);
        let content = content_with_index(index, None);
        let status = status(&content, &SinkSnapshot::default(), 5.0, 10.0);
        assert!(status.imminent_discontinuity.is_none());
        assert!(!status.has_finished_loading);
        assert!(status.should_refresh_manifest);
    }

    #[test]
    fn test_uninitialized_index_is_never_finished() {
        let index = StaticSegmentIndex::new(Vec::new()).with_initialized(false);
        let content = content_with_index(index, Some(10.0));
        let status = status(&content, &SinkSnapshot::default(), 0.0, 30.0);
        assert!(!status.has_finished_loading);
        assert!(status.imminent_discontinuity.is_none());
    }

    #[test]
    fn test_full_and_finished_are_independent() {
        let content = video_content(1_000_000.0);
        let snapshot = SinkSnapshot {
            inventory: vec![buffered_chunk(&content, 0.0, 6.0, 3_000_000)],
            ..Default::default()
        };
        let status = get_buffer_status(BufferStatusInput {
            content: &content,
            snapshot: &snapshot,
            position: 6.0,
            buffer_goal: 40.0,
            max_buffer_size: 2000.0,
            fast_switch_threshold: None,
            config: &BufferConfig::default(),
        });
        assert!(status.is_buffer_full);
        assert!(!status.on_hold.is_empty());
        assert!(!status.has_finished_loading);
    }
}
