// Stream Scheduler Configuration: tunable constants and live buffer options.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::fetcher::retry::RetryPolicy;
use crate::manifest::TrackType;

// --- Buffer management ---

/// Constants used when deciding which segments to load and keep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    /// Segments shorter than this (seconds) are never requested.
    pub minimum_segment_size: f64,
    /// Buffered segments starting closer than this to the position are never replaced.
    pub content_replacement_padding: f64,
    /// A segment is trusted as complete when at most this much is missing at either edge.
    pub max_time_missing_from_complete_segment: f64,
    /// Buffer ahead of the position that is always allowed, regardless of memory limits.
    pub min_buffer_length: f64,
    /// A memory-limited segment closer than this marks the buffer as full.
    pub min_buffer_distance_before_clean_up: f64,
    /// Data older than `position - upto_current_position_cleanup` is dropped when full.
    pub upto_current_position_cleanup: f64,
    /// Padding applied to both sides of the needed range when listing buffered chunks.
    pub chunk_window_padding: f64,
    /// Distance thresholds (seconds) mapping a segment to a request priority.
    pub priority_steps: Vec<f64>,
    /// Default bitrate ratio above which a new quality replaces buffered data.
    pub bitrate_replacement_ratio: f64,
    /// First garbage-collection pass keeps this much around the position (seconds).
    pub gc_calm_gap: f64,
    /// Second, more aggressive garbage-collection pass.
    pub gc_beefy_gap: f64,
    /// Garbage-collection heuristic: trailing growth tolerated between pushes.
    pub gc_suspicion_growth_tolerance: f64,
    /// Garbage-collection heuristic: stability tolerance between the last two pushes.
    pub gc_suspicion_stability_tolerance: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            minimum_segment_size: 0.005,
            content_replacement_padding: 1.2,
            max_time_missing_from_complete_segment: 0.15,
            min_buffer_length: 5.0,
            min_buffer_distance_before_clean_up: 10.0,
            upto_current_position_cleanup: 5.0,
            chunk_window_padding: 0.5,
            priority_steps: vec![2.0, 4.0, 8.0, 12.0, 18.0, 25.0],
            bitrate_replacement_ratio: 1.5,
            gc_calm_gap: 240.0,
            gc_beefy_gap: 30.0,
            gc_suspicion_growth_tolerance: 0.05,
            gc_suspicion_stability_tolerance: 0.01,
        }
    }
}

impl BufferConfig {
    /// Tolerance used when comparing segment boundaries.
    pub fn rounding_error(&self) -> f64 {
        (1.0_f64 / 60.0).min(self.minimum_segment_size)
    }
}

// --- Track and quality switching ---

/// Paddings kept around the position when switching tracks, per track type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SwitchPadding {
    pub before: f64,
    pub after: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SwitchConfig {
    pub video_padding: SwitchPadding,
    pub audio_padding: SwitchPadding,
    pub text_padding: SwitchPadding,
    pub image_padding: SwitchPadding,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            video_padding: SwitchPadding {
                before: 5.0,
                after: 5.0,
            },
            audio_padding: SwitchPadding {
                before: 2.0,
                after: 2.5,
            },
            text_padding: SwitchPadding {
                before: 0.0,
                after: 0.0,
            },
            image_padding: SwitchPadding {
                before: 0.0,
                after: 0.0,
            },
        }
    }
}

impl SwitchConfig {
    pub fn padding_for(&self, track_type: TrackType) -> SwitchPadding {
        match track_type {
            TrackType::Video => self.video_padding,
            TrackType::Audio => self.audio_padding,
            TrackType::Text => self.text_padding,
            TrackType::Image => self.image_padding,
        }
    }
}

// --- Stall recovery ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StallConfig {
    /// Holes smaller than this (seconds) are seeked over while rebuffering.
    pub buffer_discontinuity_threshold: f64,
    /// Tolerance used when comparing a position against a known discontinuity.
    pub epsilon: f64,
    /// Time without progress, with data available, before an unfreezing seek (ms).
    pub unfreezing_seek_delay_ms: u64,
    /// Distance of the unfreezing seek (seconds).
    pub unfreezing_delta_position: f64,
    /// Minimum data ahead of the position for a frozen playback to be suspected.
    pub freezing_min_buffer: f64,
    /// Discontinuities of periods ending this far behind the position are forgotten.
    pub discontinuity_retention: f64,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            buffer_discontinuity_threshold: 0.2,
            epsilon: 0.001,
            unfreezing_seek_delay_ms: 6000,
            unfreezing_delta_position: 0.001,
            freezing_min_buffer: 1.0,
            discontinuity_retention: 10.0,
        }
    }
}

impl StallConfig {
    pub fn unfreezing_seek_delay(&self) -> Duration {
        Duration::from_millis(self.unfreezing_seek_delay_ms)
    }
}

// --- Segment fetching ---

/// Configuration of the HTTP fetcher and its request prioritizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    /// Timeout for a single segment request attempt (ms).
    pub request_timeout_ms: u64,
    /// Maximum retries after the first attempt.
    pub max_retries: u32,
    /// Base delay of the exponential backoff (ms).
    pub retry_base_delay_ms: u64,
    /// Cap of the exponential backoff (ms).
    pub retry_max_delay_ms: u64,
    /// Each backoff delay is scaled by a random factor within `1 ± fuzz`.
    pub retry_fuzz_factor: f64,
    /// Requests at or below this priority are considered urgent.
    pub high_priority_threshold: i32,
    /// Requests at or above this priority wait for urgent requests to finish.
    pub low_priority_threshold: i32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            max_retries: 4,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 3_000,
            retry_fuzz_factor: 0.3,
            high_priority_threshold: 0,
            low_priority_threshold: 4,
        }
    }
}

impl FetchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            fuzz_factor: self.retry_fuzz_factor,
        }
    }
}

// --- Aggregated configuration ---

/// Static configuration shared by every scheduler of a playback session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub buffer: BufferConfig,
    pub switching: SwitchConfig,
    pub stall: StallConfig,
    pub fetch: FetchConfig,
    /// Record scheduler counters in [`SchedulerMetrics`](crate::metrics::SchedulerMetrics).
    pub metrics_enabled: bool,
}

impl StreamConfig {
    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    pub fn builder() -> StreamConfigBuilder {
        StreamConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct StreamConfigBuilder {
    config: StreamConfig,
}

impl StreamConfigBuilder {
    pub fn buffer(mut self, buffer: BufferConfig) -> Self {
        self.config.buffer = buffer;
        self
    }

    pub fn switching(mut self, switching: SwitchConfig) -> Self {
        self.config.switching = switching;
        self
    }

    pub fn stall(mut self, stall: StallConfig) -> Self {
        self.config.stall = stall;
        self
    }

    pub fn fetch(mut self, fetch: FetchConfig) -> Self {
        self.config.fetch = fetch;
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.config.metrics_enabled = enabled;
        self
    }

    pub fn build(self) -> StreamConfig {
        self.config
    }
}

// --- Live buffer options ---

/// Buffer sizing values that may change during playback.
///
/// Every scheduler observes the receivers and reacts on the next change.
/// Sizes are in seconds except `max_video_buffer_size`, in kilobytes.
#[derive(Debug, Clone)]
pub struct BufferOptions {
    pub wanted_buffer_ahead: watch::Receiver<f64>,
    pub max_buffer_ahead: watch::Receiver<f64>,
    pub max_buffer_behind: watch::Receiver<f64>,
    pub max_video_buffer_size: watch::Receiver<f64>,
}

/// Owner side of [`BufferOptions`].
#[derive(Debug)]
pub struct BufferOptionsHandle {
    pub wanted_buffer_ahead: watch::Sender<f64>,
    pub max_buffer_ahead: watch::Sender<f64>,
    pub max_buffer_behind: watch::Sender<f64>,
    pub max_video_buffer_size: watch::Sender<f64>,
}

impl BufferOptions {
    /// Creates options with the given buffer goal and no memory or range limits.
    pub fn channel(wanted_buffer_ahead: f64) -> (BufferOptionsHandle, BufferOptions) {
        let (wanted_tx, wanted_rx) = watch::channel(wanted_buffer_ahead);
        let (ahead_tx, ahead_rx) = watch::channel(f64::INFINITY);
        let (behind_tx, behind_rx) = watch::channel(f64::INFINITY);
        let (size_tx, size_rx) = watch::channel(f64::INFINITY);
        (
            BufferOptionsHandle {
                wanted_buffer_ahead: wanted_tx,
                max_buffer_ahead: ahead_tx,
                max_buffer_behind: behind_tx,
                max_video_buffer_size: size_tx,
            },
            BufferOptions {
                wanted_buffer_ahead: wanted_rx,
                max_buffer_ahead: ahead_rx,
                max_buffer_behind: behind_rx,
                max_video_buffer_size: size_rx,
            },
        )
    }
}
