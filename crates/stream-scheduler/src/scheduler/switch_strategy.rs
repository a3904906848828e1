// Switch Strategies: decide what to do with buffered data when the adaptation or the
// authorized representations of a period change.

use std::sync::Arc;

use tracing::debug;

use crate::config::SwitchPadding;
use crate::error::StreamError;
use crate::manifest::{Adaptation, Period, Representation, are_codecs_compatible};
use crate::observation::{PlaybackObservation, ReadyState};
use crate::ranges::{TimeRange, exclude_ranges, insert_range, intersect_with};
use crate::sink::MediaSink;
use crate::track_selector::SwitchingMode;

#[derive(Debug, Clone, PartialEq)]
pub enum SwitchStrategy {
    /// Nothing buffered conflicts with the new choice.
    Continue,
    /// The media pipeline must be reloaded.
    NeedsReload,
    /// Remove these ranges.
    CleanBuffer(Vec<TimeRange>),
    /// Remove these ranges and flush the decoder.
    FlushBuffer(Vec<TimeRange>),
}

impl SwitchStrategy {
    pub fn ranges(&self) -> &[TimeRange] {
        match self {
            Self::CleanBuffer(ranges) | Self::FlushBuffer(ranges) => ranges,
            Self::Continue | Self::NeedsReload => &[],
        }
    }

    /// Removes the ranges of a cleaning strategy from the sink.
    /// Returns whether the decoder must then be flushed.
    pub async fn apply(&self, sink: &dyn MediaSink) -> Result<bool, StreamError> {
        for range in self.ranges() {
            debug!(
                track = %sink.track_type(),
                start = range.start,
                end = range.end,
                "Removing data of a previous choice"
            );
            sink.remove_buffer(range.start, range.end)
                .await
                .map_err(|e| StreamError::sink("remove", e))?;
        }
        Ok(matches!(self, Self::FlushBuffer(_)))
    }
}

fn has_compatible_codec(representations: &[Arc<Representation>], sink_codec: &str) -> bool {
    representations
        .iter()
        .any(|r| are_codecs_compatible(sink_codec, &r.codec_string()))
}

fn is_playing(observation: &PlaybackObservation) -> bool {
    observation.ready_state > ReadyState::HaveMetadata || !observation.paused
}

/// Buffered data of `period`, or `None` when the sink holds nothing of it.
fn period_buffer(sink: &dyn MediaSink, period: &Period) -> Option<Vec<TimeRange>> {
    let span = TimeRange::new(period.start, period.end_or_infinity());
    let intersection = intersect_with(&sink.buffered_ranges(), &span);
    (!intersection.is_empty()).then_some(intersection)
}

/// Removes from `unwanted` the padding around the position and anything outside the
/// period, which may belong to a neighbouring period.
fn ranges_to_remove(
    unwanted: &[TimeRange],
    period: &Period,
    position: f64,
    padding: SwitchPadding,
) -> Vec<TimeRange> {
    let mut excluded = vec![TimeRange::new(
        (position - padding.before).max(0.0),
        position + padding.after,
    )];
    if period.start > 0.0 {
        excluded.push(TimeRange::new(0.0, period.start));
    }
    if let Some(end) = period.end {
        excluded.push(TimeRange::new(end, f64::INFINITY));
    }
    excluded.sort_by(|a, b| a.start.total_cmp(&b.start));
    exclude_ranges(unwanted, &excluded)
}

fn cleaning_strategy(mode: SwitchingMode, to_remove: Vec<TimeRange>) -> SwitchStrategy {
    if to_remove.is_empty() {
        SwitchStrategy::Continue
    } else if mode == SwitchingMode::Direct {
        SwitchStrategy::FlushBuffer(to_remove)
    } else {
        SwitchStrategy::CleanBuffer(to_remove)
    }
}

/// Strategy applied before loading `adaptation` for `period`.
pub fn adaptation_switch_strategy(
    sink: &dyn MediaSink,
    period: &Period,
    adaptation: &Adaptation,
    mode: SwitchingMode,
    observation: &PlaybackObservation,
    padding: SwitchPadding,
) -> SwitchStrategy {
    if sink.is_native()
        && let Some(codec) = sink.codec()
        && !has_compatible_codec(&adaptation.representations, &codec)
    {
        debug!(
            adaptation = %adaptation.id,
            sink_codec = %codec,
            "Incompatible codec, reload needed"
        );
        return SwitchStrategy::NeedsReload;
    }

    let Some(intersection) = period_buffer(sink, period) else {
        return SwitchStrategy::Continue;
    };
    sink.synchronize_inventory();
    let inventory = sink.inventory();
    let in_period = inventory.iter().filter(|c| c.context.period.id == period.id);
    if !in_period.clone().any(|c| c.context.adaptation.id != adaptation.id) {
        return SwitchStrategy::Continue;
    }
    let mut wanted = Vec::new();
    for chunk in in_period.filter(|c| c.context.adaptation.id == adaptation.id) {
        insert_range(
            &mut wanted,
            TimeRange::new(chunk.effective_start(), chunk.effective_end()),
        );
    }
    let unwanted = exclude_ranges(&intersection, &wanted);
    if unwanted.is_empty() {
        return SwitchStrategy::Continue;
    }

    let position = observation.position;
    if mode == SwitchingMode::Reload
        && period.contains(position)
        && is_playing(observation)
        && !wanted.iter().any(|r| r.contains(position))
    {
        return SwitchStrategy::NeedsReload;
    }
    cleaning_strategy(mode, ranges_to_remove(&unwanted, period, position, padding))
}

/// Strategy applied when the representations authorized in `adaptation` change.
pub fn representation_switch_strategy(
    sink: &dyn MediaSink,
    period: &Period,
    adaptation: &Adaptation,
    authorized: &[Arc<Representation>],
    mode: SwitchingMode,
    observation: &PlaybackObservation,
    padding: SwitchPadding,
) -> SwitchStrategy {
    if mode == SwitchingMode::Lazy {
        return SwitchStrategy::Continue;
    }
    if period_buffer(sink, period).is_none() {
        return SwitchStrategy::Continue;
    }
    sink.synchronize_inventory();
    let mut unwanted = Vec::new();
    for chunk in sink.inventory() {
        let ctx = &chunk.context;
        if ctx.period.id != period.id {
            continue;
        }
        let is_authorized = ctx.adaptation.id == adaptation.id
            && authorized.iter().any(|r| r.id == ctx.representation.id);
        if !is_authorized {
            insert_range(
                &mut unwanted,
                TimeRange::new(chunk.effective_start(), chunk.effective_end()),
            );
        }
    }

    let position = observation.position;
    let data_at_position = unwanted.iter().any(|r| r.contains(position));
    let incompatible = sink.is_native()
        && sink
            .codec()
            .is_some_and(|codec| !has_compatible_codec(authorized, &codec));
    let wants_reload = incompatible || (mode == SwitchingMode::Reload && is_playing(observation));
    if data_at_position && period.contains(position) && wants_reload {
        return SwitchStrategy::NeedsReload;
    }
    cleaning_strategy(mode, ranges_to_remove(&unwanted, period, position, padding))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwitchConfig;
    use crate::manifest::TrackType;
    use crate::sink::MemorySink;
    use crate::test_utils::{chunk_context, media_chunk, multi_quality_content};

    async fn sink_with(content: &crate::scheduler::StreamContent, times: &[f64]) -> MemorySink {
        let sink = MemorySink::unbounded(TrackType::Video);
        for (i, time) in times.iter().enumerate() {
            let ctx = chunk_context(content, &format!("s{i}"), *time, 6.0);
            sink.push_chunk(media_chunk(&ctx, 100)).await.unwrap();
            sink.signal_segment_complete(ctx).await.unwrap();
        }
        sink
    }

    fn padding() -> SwitchPadding {
        SwitchConfig::default().padding_for(TrackType::Video)
    }

    #[tokio::test]
    async fn test_quality_upgrade_cleans_outside_padding() {
        let content = multi_quality_content(&[500_000.0, 2_000_000.0]);
        let low = content.with_representation("video-500000").unwrap();
        let high = content.with_representation("video-2000000").unwrap();
        let sink = sink_with(&low, &[0.0, 6.0, 12.0, 18.0, 24.0]).await;
        let observation = PlaybackObservation::at(10.0).playing();

        let strategy = representation_switch_strategy(
            &sink,
            &content.period,
            &content.adaptation,
            std::slice::from_ref(&high.representation),
            SwitchingMode::Seamless,
            &observation,
            padding(),
        );
        assert_eq!(
            strategy,
            SwitchStrategy::CleanBuffer(vec![TimeRange::new(0.0, 5.0), TimeRange::new(15.0, 30.0)])
        );

        let strategy = representation_switch_strategy(
            &sink,
            &content.period,
            &content.adaptation,
            std::slice::from_ref(&high.representation),
            SwitchingMode::Direct,
            &observation,
            padding(),
        );
        assert!(matches!(strategy, SwitchStrategy::FlushBuffer(_)));
    }

    #[tokio::test]
    async fn test_authorized_data_continues() {
        let content = multi_quality_content(&[500_000.0, 2_000_000.0]);
        let low = content.with_representation("video-500000").unwrap();
        let sink = sink_with(&low, &[0.0, 6.0]).await;
        let strategy = representation_switch_strategy(
            &sink,
            &content.period,
            &content.adaptation,
            &content.adaptation.representations,
            SwitchingMode::Seamless,
            &PlaybackObservation::at(3.0),
            padding(),
        );
        assert_eq!(strategy, SwitchStrategy::Continue);

        let strategy = representation_switch_strategy(
            &sink,
            &content.period,
            &content.adaptation,
            &[],
            SwitchingMode::Lazy,
            &PlaybackObservation::at(3.0),
            padding(),
        );
        assert_eq!(strategy, SwitchStrategy::Continue);
    }

    #[tokio::test]
    async fn test_incompatible_codec_at_position_needs_reload() {
        let content = multi_quality_content(&[500_000.0]);
        let sink = sink_with(&content, &[0.0, 6.0]).await.with_codec("hvc1.1.6.L93");
        let strategy = representation_switch_strategy(
            &sink,
            &content.period,
            &content.adaptation,
            &[],
            SwitchingMode::Seamless,
            &PlaybackObservation::at(3.0).playing(),
            padding(),
        );
        assert_eq!(strategy, SwitchStrategy::NeedsReload);

        let strategy = adaptation_switch_strategy(
            &sink,
            &content.period,
            &content.adaptation,
            SwitchingMode::Seamless,
            &PlaybackObservation::at(3.0),
            padding(),
        );
        assert_eq!(strategy, SwitchStrategy::NeedsReload);
    }

    #[tokio::test]
    async fn test_adaptation_switch_removes_other_adaptation() {
        let content = multi_quality_content(&[500_000.0]);
        let sink = sink_with(&content, &[0.0, 6.0, 12.0, 18.0]).await;
        let other = Adaptation::new("video-alt", TrackType::Video, content.adaptation.representations.clone());
        let strategy = adaptation_switch_strategy(
            &sink,
            &content.period,
            &other,
            SwitchingMode::Seamless,
            &PlaybackObservation::at(12.0),
            padding(),
        );
        assert_eq!(
            strategy,
            SwitchStrategy::CleanBuffer(vec![TimeRange::new(0.0, 7.0), TimeRange::new(17.0, 24.0)])
        );

        let strategy = adaptation_switch_strategy(
            &sink,
            &content.period,
            &content.adaptation,
            SwitchingMode::Seamless,
            &PlaybackObservation::at(12.0),
            padding(),
        );
        assert_eq!(strategy, SwitchStrategy::Continue);
    }
}
