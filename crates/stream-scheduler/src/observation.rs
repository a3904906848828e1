// Playback Observations: snapshots of the media element state driving every tick.

use crate::ranges::TimeRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ReadyState {
    #[default]
    HaveNothing,
    HaveMetadata,
    HaveCurrentData,
    HaveFutureData,
    HaveEnoughData,
}

/// Point-in-time state of playback, as reported by the position observer.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackObservation {
    pub position: f64,
    pub duration: f64,
    pub paused: bool,
    pub ready_state: ReadyState,
    /// Playback is stalled because no data is available at the position.
    pub rebuffering: bool,
    pub seeking: bool,
    /// Buffered ranges of the media element, all tracks combined.
    pub buffered: Vec<TimeRange>,
}

impl Default for PlaybackObservation {
    fn default() -> Self {
        Self {
            position: 0.0,
            duration: f64::NAN,
            paused: true,
            ready_state: ReadyState::HaveNothing,
            rebuffering: false,
            seeking: false,
            buffered: Vec::new(),
        }
    }
}

impl PlaybackObservation {
    pub fn at(position: f64) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    pub fn playing(mut self) -> Self {
        self.paused = false;
        self.ready_state = ReadyState::HaveEnoughData;
        self
    }

    pub fn with_buffered(mut self, buffered: Vec<TimeRange>) -> Self {
        self.buffered = buffered;
        self
    }

    pub fn stalled(mut self) -> Self {
        self.rebuffering = true;
        self.ready_state = ReadyState::HaveMetadata;
        self
    }
}
