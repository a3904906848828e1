use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Counters of a playback session's scheduling activity.
///
/// All counters use atomic operations and may be shared by every lane.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    // Requests
    /// Segment requests started by download queues
    pub requests_started: AtomicU64,
    /// Requests cancelled before completion
    pub requests_cancelled: AtomicU64,
    /// Retries reported by fetchers
    pub request_retries: AtomicU64,
    /// Completed downloads
    pub downloads_total: AtomicU64,
    pub download_bytes_total: AtomicU64,
    pub download_latency_sum_ms: AtomicU64,
    pub download_errors: AtomicU64,

    // Sink
    /// Segments fully pushed to a sink
    pub segments_pushed: AtomicU64,
    /// Bytes pushed to sinks
    pub pushed_bytes_total: AtomicU64,

    // Garbage collection
    /// Regular garbage collection passes that removed data
    pub gc_runs: AtomicU64,
    /// Forced collections after a full sink
    pub forced_gc_runs: AtomicU64,

    // Recovery
    /// Seeks performed to skip discontinuities, holes or freezes
    pub recovery_seeks: AtomicU64,
    /// Quality switches realized by a scheduler handoff
    pub quality_switches: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request_started(&self) {
        self.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_retry(&self) {
        self.request_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download(&self, bytes: u64, latency_ms: u64) {
        self.downloads_total.fetch_add(1, Ordering::Relaxed);
        self.download_bytes_total.fetch_add(bytes, Ordering::Relaxed);
        self.download_latency_sum_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_download_error(&self) {
        self.download_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_pushed(&self, bytes: u64) {
        self.segments_pushed.fetch_add(1, Ordering::Relaxed);
        self.pushed_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_gc_run(&self) {
        self.gc_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forced_gc(&self) {
        self.forced_gc_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery_seek(&self) {
        self.recovery_seeks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quality_switch(&self) {
        self.quality_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns None if no downloads have been recorded
    pub fn average_download_latency_ms(&self) -> Option<f64> {
        let total = self.downloads_total.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        let sum = self.download_latency_sum_ms.load(Ordering::Relaxed);
        Some(sum as f64 / total as f64)
    }

    /// Share of started requests that were cancelled (0.0 to 1.0)
    pub fn cancellation_rate(&self) -> f64 {
        let started = self.requests_started.load(Ordering::Relaxed);
        if started == 0 {
            return 0.0;
        }
        self.requests_cancelled.load(Ordering::Relaxed) as f64 / started as f64
    }

    pub fn log_summary(&self) {
        let avg_latency = self
            .average_download_latency_ms()
            .map(|l| format!("{:.2}ms", l))
            .unwrap_or_else(|| "N/A".to_string());

        info!(
            requests = self.requests_started.load(Ordering::Relaxed),
            cancelled = self.requests_cancelled.load(Ordering::Relaxed),
            cancellation_rate = format!("{:.1}%", self.cancellation_rate() * 100.0),
            retries = self.request_retries.load(Ordering::Relaxed),
            downloads = self.downloads_total.load(Ordering::Relaxed),
            download_bytes = self.download_bytes_total.load(Ordering::Relaxed),
            download_errors = self.download_errors.load(Ordering::Relaxed),
            avg_latency = %avg_latency,
            segments_pushed = self.segments_pushed.load(Ordering::Relaxed),
            pushed_bytes = self.pushed_bytes_total.load(Ordering::Relaxed),
            gc_runs = self.gc_runs.load(Ordering::Relaxed),
            forced_gc_runs = self.forced_gc_runs.load(Ordering::Relaxed),
            recovery_seeks = self.recovery_seeks.load(Ordering::Relaxed),
            quality_switches = self.quality_switches.load(Ordering::Relaxed),
            "Stream scheduler metrics summary"
        );
    }
}
