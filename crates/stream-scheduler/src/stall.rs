// Stall Recovery: tracks holes reported by the schedulers and seeks over them when
// playback gets stuck.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::StallConfig;
use crate::events::{BufferDiscontinuity, StreamStatus};
use crate::manifest::{Manifest, Period, TrackType};
use crate::observation::{PlaybackObservation, ReadyState};
use crate::ranges::{TimeRange, next_range_gap, range_containing};

/// Seeks on behalf of the recovery logic.
pub trait PlaybackController: Send + Sync {
    fn seek(&self, position: f64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    /// A hole announced by a scheduler.
    Discontinuity,
    /// A small hole in the buffered ranges.
    BufferHole,
    /// The position sits between two periods.
    PeriodGap,
    /// Playback does not advance although data is buffered.
    Freeze,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecoveryAction {
    Seek { from: f64, to: f64, reason: RecoveryReason },
}

#[derive(Debug, Clone)]
struct DiscontinuityEntry {
    period: Arc<Period>,
    track_type: TrackType,
    discontinuity: BufferDiscontinuity,
    /// Position when the discontinuity was reported.
    position: f64,
}

/// Last discontinuity reported for each period and track type, ordered by period.
#[derive(Debug, Default)]
pub struct DiscontinuityTracker {
    entries: Vec<DiscontinuityEntry>,
}

impl DiscontinuityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn update(&mut self, status: &StreamStatus) {
        let existing = self
            .entries
            .iter()
            .position(|e| e.period.id == status.period.id && e.track_type == status.track_type);
        match (existing, status.imminent_discontinuity) {
            (Some(at), None) => {
                self.entries.remove(at);
            }
            (Some(at), Some(discontinuity)) => {
                self.entries[at].discontinuity = discontinuity;
                self.entries[at].position = status.position;
            }
            (None, Some(discontinuity)) => {
                let at = self
                    .entries
                    .partition_point(|e| e.period.start <= status.period.start);
                self.entries.insert(
                    at,
                    DiscontinuityEntry {
                        period: Arc::clone(&status.period),
                        track_type: status.track_type,
                        discontinuity,
                        position: status.position,
                    },
                );
            }
            (None, None) => {}
        }
    }

    /// Forgets periods ending more than `retention` seconds before `position`.
    pub fn prune(&mut self, position: f64, retention: f64) {
        self.entries
            .retain(|e| e.period.end.is_none_or(|end| end >= position - retention));
    }

    /// Where to seek to leave the discontinuity containing `position`, if any.
    pub fn skip_target(&self, position: f64, epsilon: f64) -> Option<f64> {
        for entry in &self.entries {
            if entry.period.start > position + epsilon {
                return None;
            }
            if entry.period.end.is_some_and(|end| end <= position) {
                continue;
            }
            let BufferDiscontinuity { start, end } = entry.discontinuity;
            let lower = start.unwrap_or(entry.position);
            if position + epsilon < lower {
                continue;
            }
            match end.or(entry.period.end) {
                Some(end) if end > position => return Some(end + epsilon),
                _ => continue,
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy)]
struct Freeze {
    since: Instant,
    position: f64,
}

/// Decides the corrective seeks from stream statuses and playback observations.
#[derive(Debug)]
pub struct StallRecovery {
    config: StallConfig,
    manifest: Arc<Manifest>,
    discontinuities: DiscontinuityTracker,
    previous_position: Option<f64>,
    /// Target of the last seek this component asked for.
    last_seek: Option<f64>,
    /// The device seeked back by itself during the current stall.
    auto_recovering: bool,
    freeze: Option<Freeze>,
}

impl StallRecovery {
    pub fn new(config: StallConfig, manifest: Arc<Manifest>) -> Self {
        Self {
            config,
            manifest,
            discontinuities: DiscontinuityTracker::new(),
            previous_position: None,
            last_seek: None,
            auto_recovering: false,
            freeze: None,
        }
    }

    pub fn discontinuities(&self) -> &DiscontinuityTracker {
        &self.discontinuities
    }

    /// Only tracks rendered by the media pipeline can stall playback.
    pub fn on_status(&mut self, status: &StreamStatus) {
        if status.track_type.is_native() {
            self.discontinuities.update(status);
        }
    }

    pub fn on_observation(
        &mut self,
        observation: &PlaybackObservation,
        now: Instant,
    ) -> Option<RecoveryAction> {
        let position = observation.position;
        let epsilon = self.config.epsilon;
        self.discontinuities
            .prune(position, self.config.discontinuity_retention);

        let moved_back = self
            .previous_position
            .is_some_and(|previous| position + epsilon < previous);
        let own_seek = self
            .last_seek
            .is_some_and(|target| (target - position).abs() <= epsilon);
        if observation.rebuffering && observation.seeking && moved_back && !own_seek {
            debug!(position, "Device seeked back during a stall, letting it recover");
            self.auto_recovering = true;
        }
        self.previous_position = Some(position);

        if !observation.rebuffering {
            // The stall is over: a later one may need the same seek again.
            self.auto_recovering = false;
            self.last_seek = None;
            return self.check_freeze(observation, now);
        }
        self.freeze = None;
        if self.auto_recovering {
            return None;
        }

        let (to, reason) = self.stall_target(observation)?;
        if to <= position || self.last_seek.is_some_and(|last| (last - to).abs() <= epsilon) {
            return None;
        }
        info!(from = position, to, reason = ?reason, "Seeking over a stall");
        self.last_seek = Some(to);
        Some(RecoveryAction::Seek {
            from: position,
            to,
            reason,
        })
    }

    fn stall_target(&self, observation: &PlaybackObservation) -> Option<(f64, RecoveryReason)> {
        let position = observation.position;
        let epsilon = self.config.epsilon;
        if let Some(to) = self.discontinuities.skip_target(position, epsilon) {
            return Some((to, RecoveryReason::Discontinuity));
        }

        let gap = next_range_gap(&observation.buffered, position);
        if gap < self.config.buffer_discontinuity_threshold {
            return Some((position + gap + epsilon, RecoveryReason::BufferHole));
        }

        if self.manifest.period_for_time(position).is_none()
            && let Some(next) = self
                .manifest
                .periods()
                .into_iter()
                .find(|p| p.start > position)
        {
            return Some((next.start + epsilon, RecoveryReason::PeriodGap));
        }
        None
    }

    /// Re-seeks in place when the position stays still while playing with data ahead.
    fn check_freeze(
        &mut self,
        observation: &PlaybackObservation,
        now: Instant,
    ) -> Option<RecoveryAction> {
        let position = observation.position;
        let buffered_ahead = range_containing(&observation.buffered, position)
            .map_or(0.0, |range: TimeRange| range.end - position);
        let may_freeze = !observation.paused
            && !observation.seeking
            && observation.ready_state >= ReadyState::HaveFutureData
            && buffered_ahead >= self.config.freezing_min_buffer;
        if !may_freeze {
            self.freeze = None;
            return None;
        }

        match self.freeze {
            Some(freeze) if (freeze.position - position).abs() <= self.config.epsilon => {
                if now.duration_since(freeze.since) < self.config.unfreezing_seek_delay() {
                    return None;
                }
                let to = position + self.config.unfreezing_delta_position;
                info!(position, to, "Playback looks frozen, seeking");
                self.freeze = Some(Freeze { since: now, position: to });
                self.last_seek = Some(to);
                Some(RecoveryAction::Seek {
                    from: position,
                    to,
                    reason: RecoveryReason::Freeze,
                })
            }
            _ => {
                self.freeze = Some(Freeze { since: now, position });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    fn manifest() -> Arc<Manifest> {
        Arc::new(Manifest::new(
            "m",
            vec![
                Period::new("p0", 0.0, Some(40.0)),
                Period::new("p1", 45.0, Some(80.0)),
            ],
        ))
    }

    fn status(
        manifest: &Manifest,
        period: &str,
        track_type: TrackType,
        discontinuity: Option<BufferDiscontinuity>,
    ) -> StreamStatus {
        StreamStatus {
            period: manifest.period(period).unwrap(),
            track_type,
            position: 10.0,
            has_finished_loading: false,
            imminent_discontinuity: discontinuity,
            is_buffer_full: false,
            has_media_to_load: true,
            needs_manifest_refresh: false,
        }
    }

    fn hole(start: f64, end: f64) -> Option<BufferDiscontinuity> {
        Some(BufferDiscontinuity {
            start: Some(start),
            end: Some(end),
        })
    }

    #[test]
    fn test_tracker_replaces_and_prunes() {
        let manifest = manifest();
        let mut tracker = DiscontinuityTracker::new();
        tracker.update(&status(&manifest, "p1", TrackType::Video, hole(50.0, 52.0)));
        tracker.update(&status(&manifest, "p0", TrackType::Video, hole(12.0, 14.0)));
        tracker.update(&status(&manifest, "p0", TrackType::Video, hole(20.0, 22.0)));
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.skip_target(21.0, 0.001), Some(22.001));
        assert_eq!(tracker.skip_target(13.0, 0.001), None);

        tracker.update(&status(&manifest, "p0", TrackType::Video, None));
        assert_eq!(tracker.len(), 1);
        tracker.prune(100.0, 10.0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_open_ended_hole_skips_to_period_end() {
        let manifest = manifest();
        let mut tracker = DiscontinuityTracker::new();
        tracker.update(&status(
            &manifest,
            "p0",
            TrackType::Audio,
            Some(BufferDiscontinuity {
                start: None,
                end: None,
            }),
        ));
        assert_eq!(tracker.skip_target(12.0, 0.001), Some(40.001));
    }

    #[test]
    fn test_stall_in_discontinuity_seeks_past_it() {
        let manifest = manifest();
        let mut recovery = StallRecovery::new(StallConfig::default(), Arc::clone(&manifest));
        recovery.on_status(&status(&manifest, "p0", TrackType::Video, hole(20.0, 22.0)));

        let now = Instant::now();
        assert_eq!(recovery.on_observation(&PlaybackObservation::at(20.5).playing(), now), None);
        let action = recovery.on_observation(&PlaybackObservation::at(20.5).stalled(), now);
        assert_eq!(
            action,
            Some(RecoveryAction::Seek {
                from: 20.5,
                to: 22.001,
                reason: RecoveryReason::Discontinuity
            })
        );
        // Same stall reported again: no second seek to the same target.
        assert_eq!(recovery.on_observation(&PlaybackObservation::at(20.5).stalled(), now), None);
    }

    #[test]
    fn test_same_hole_is_skipped_again_after_seeking_back() {
        let manifest = manifest();
        let mut recovery = StallRecovery::new(StallConfig::default(), Arc::clone(&manifest));
        recovery.on_status(&status(&manifest, "p0", TrackType::Video, hole(20.0, 22.0)));
        let now = Instant::now();
        let skip = Some(RecoveryAction::Seek {
            from: 20.5,
            to: 22.001,
            reason: RecoveryReason::Discontinuity,
        });

        assert_eq!(recovery.on_observation(&PlaybackObservation::at(20.5).stalled(), now), skip);
        recovery.on_observation(&PlaybackObservation::at(25.0).playing(), now);
        recovery.on_observation(&PlaybackObservation::at(10.0).playing(), now);
        assert_eq!(recovery.on_observation(&PlaybackObservation::at(20.5).playing(), now), None);
        assert_eq!(recovery.on_observation(&PlaybackObservation::at(20.5).stalled(), now), skip);
    }

    #[test]
    fn test_text_discontinuities_are_ignored() {
        let manifest = manifest();
        let mut recovery = StallRecovery::new(StallConfig::default(), Arc::clone(&manifest));
        recovery.on_status(&status(&manifest, "p0", TrackType::Text, hole(20.0, 22.0)));
        assert!(recovery.discontinuities().is_empty());
    }

    #[rstest]
    #[case(0.1, Some(10.101))]
    #[case(0.5, None)]
    fn test_small_buffer_hole(#[case] gap: f64, #[case] expected: Option<f64>) {
        let mut recovery = StallRecovery::new(StallConfig::default(), manifest());
        let observation = PlaybackObservation::at(10.0)
            .stalled()
            .with_buffered(vec![TimeRange::new(0.0, 10.0), TimeRange::new(10.0 + gap, 30.0)]);
        let action = recovery.on_observation(&observation, Instant::now());
        let target = action.map(|RecoveryAction::Seek { to, .. }| to);
        match (target, expected) {
            (Some(to), Some(expected)) => assert!((to - expected).abs() < 1e-9),
            (None, None) => {}
            other => panic!("unexpected recovery {other:?}"),
        }
    }

    #[test]
    fn test_period_gap_seeks_to_next_period() {
        let mut recovery = StallRecovery::new(StallConfig::default(), manifest());
        let action = recovery.on_observation(&PlaybackObservation::at(41.0).stalled(), Instant::now());
        assert_eq!(
            action,
            Some(RecoveryAction::Seek {
                from: 41.0,
                to: 45.001,
                reason: RecoveryReason::PeriodGap
            })
        );
    }

    #[test]
    fn test_device_back_seek_suspends_recovery() {
        let manifest = manifest();
        let mut recovery = StallRecovery::new(StallConfig::default(), Arc::clone(&manifest));
        recovery.on_status(&status(&manifest, "p0", TrackType::Video, hole(20.0, 22.0)));
        let now = Instant::now();
        recovery.on_observation(&PlaybackObservation::at(21.0).playing(), now);

        let mut back = PlaybackObservation::at(20.5).stalled();
        back.seeking = true;
        assert_eq!(recovery.on_observation(&back, now), None);
        assert_eq!(recovery.on_observation(&PlaybackObservation::at(20.5).stalled(), now), None);

        // A new stall after playback resumed is handled again.
        recovery.on_observation(&PlaybackObservation::at(20.5).playing(), now);
        assert!(recovery.on_observation(&PlaybackObservation::at(20.5).stalled(), now).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_triggers_reseek_after_delay() {
        let mut recovery = StallRecovery::new(StallConfig::default(), manifest());
        let observation = PlaybackObservation::at(12.0)
            .playing()
            .with_buffered(vec![TimeRange::new(0.0, 30.0)]);

        assert_eq!(recovery.on_observation(&observation, Instant::now()), None);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(recovery.on_observation(&observation, Instant::now()), None);
        tokio::time::advance(Duration::from_secs(3)).await;
        let action = recovery.on_observation(&observation, Instant::now());
        assert!(matches!(
            action,
            Some(RecoveryAction::Seek { to, reason: RecoveryReason::Freeze, .. }) if (to - 12.001).abs() < 1e-9
        ));

        // Advancing playback clears the freeze.
        let moving = PlaybackObservation { position: 13.0, ..observation };
        assert_eq!(recovery.on_observation(&moving, Instant::now()), None);
        tokio::time::advance(Duration::from_secs(10)).await;
        let moving = PlaybackObservation { position: 23.0, ..moving };
        assert_eq!(recovery.on_observation(&moving, Instant::now()), None);
    }

    #[test]
    fn test_paused_playback_is_not_frozen() {
        let mut recovery = StallRecovery::new(StallConfig::default(), manifest());
        let mut observation = PlaybackObservation::at(12.0).with_buffered(vec![TimeRange::new(0.0, 30.0)]);
        observation.ready_state = ReadyState::HaveEnoughData;
        let start = Instant::now();
        recovery.on_observation(&observation, start);
        assert_eq!(
            recovery.on_observation(&observation, start + Duration::from_secs(7)),
            None
        );
    }
}
