// Manifest Model: periods, adaptations, representations and their segment indexes.
//
// The catalog is shared read-only between every scheduler. The only mutable parts
// are the period list (grown by refreshes), the "last period known" flag and the
// per-representation decipherability, all of which are announced to the
// orchestrator through `ManifestEvent`s.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
    Audio,
    Video,
    Text,
    Image,
}

impl TrackType {
    pub const ALL: [TrackType; 4] = [
        TrackType::Audio,
        TrackType::Video,
        TrackType::Text,
        TrackType::Image,
    ];

    /// Native tracks are decoded by a fixed-codec media pipeline whose failures are fatal.
    pub fn is_native(self) -> bool {
        matches!(self, TrackType::Audio | TrackType::Video)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackType::Audio => "audio",
            TrackType::Video => "video",
            TrackType::Text => "text",
            TrackType::Image => "image",
        }
    }
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive end offset.
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn to_header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// A fetchable piece of a representation, either an initialization or a media segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub id: String,
    /// Start time in seconds.
    pub time: f64,
    /// Duration in seconds.
    pub duration: f64,
    pub end: f64,
    pub timescale: u32,
    pub is_init: bool,
    /// False while the duration is only an estimate (live edge).
    pub complete: bool,
    pub url: Option<String>,
    pub byte_range: Option<ByteRange>,
}

impl Segment {
    pub fn media(id: impl Into<String>, time: f64, duration: f64) -> Self {
        Self {
            id: id.into(),
            time,
            duration,
            end: time + duration,
            timescale: 1,
            is_init: false,
            complete: true,
            url: None,
            byte_range: None,
        }
    }

    pub fn init(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            time: 0.0,
            duration: 0.0,
            end: 0.0,
            timescale: 1,
            is_init: true,
            complete: true,
            url: None,
            byte_range: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_byte_range(mut self, range: ByteRange) -> Self {
        self.byte_range = Some(range);
        self
    }

    pub fn with_timescale(mut self, timescale: u32) -> Self {
        self.timescale = timescale;
        self
    }
}

/// Lookup capabilities of a representation's segment list.
pub trait SegmentIndex: Send + Sync + fmt::Debug {
    fn init_segment(&self) -> Option<Segment>;

    /// Media segments overlapping `[start, start + duration)`, in chronological order.
    fn segments(&self, start: f64, duration: f64) -> Vec<Segment>;

    /// Whether the index can be queried at all.
    fn is_initialized(&self) -> bool;

    /// Whether no further segments will ever be added.
    fn is_finished(&self) -> bool;

    /// End of the last known segment.
    fn last_position(&self) -> Option<f64>;

    /// Whether the index should be refreshed before segments in `[start, end]` are listed.
    fn should_refresh(&self, start: f64, end: f64) -> bool;

    /// End of an announced hole containing `time`, if any.
    fn check_discontinuity(&self, time: f64) -> Option<f64>;

    /// The last segment starting before `time`.
    fn segment_before(&self, time: f64) -> Option<Segment>;

    /// The first segment starting at or after `time`.
    fn segment_after(&self, time: f64) -> Option<Segment>;

    /// Late-binding indexes only learn segment times as they are fetched.
    fn is_chronological(&self) -> bool {
        true
    }

    /// `None` when availability cannot be determined.
    fn is_segment_still_available(&self, _segment: &Segment) -> Option<bool> {
        None
    }

    /// Whether `error` may come from the index lagging behind the server.
    fn can_be_out_of_sync_error(&self, _error: &FetchError) -> bool {
        false
    }
}

/// List-based [`SegmentIndex`], optionally growing for live content.
#[derive(Debug)]
pub struct StaticSegmentIndex {
    init: Option<Segment>,
    segments: RwLock<Vec<Segment>>,
    finished: AtomicBool,
    initialized: bool,
    chronological: bool,
    discontinuities: Vec<(f64, f64)>,
    /// Segments removed from a sliding live window.
    evicted_before: RwLock<Option<f64>>,
}

impl StaticSegmentIndex {
    pub fn new(mut segments: Vec<Segment>) -> Self {
        segments.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self {
            init: None,
            segments: RwLock::new(segments),
            finished: AtomicBool::new(true),
            initialized: true,
            chronological: true,
            discontinuities: Vec::new(),
            evicted_before: RwLock::new(None),
        }
    }

    /// Contiguous segments of `segment_duration` seconds from `start` to `end`.
    pub fn uniform(prefix: &str, start: f64, end: f64, segment_duration: f64) -> Self {
        let mut segments = Vec::new();
        let mut time = start;
        let mut n = 0usize;
        while time < end - 1e-9 {
            let duration = segment_duration.min(end - time);
            segments.push(
                Segment::media(format!("{prefix}-{n}"), time, duration)
                    .with_url(format!("{prefix}/{n}.m4s")),
            );
            time += segment_duration;
            n += 1;
        }
        Self::new(segments)
    }

    pub fn with_init(mut self, init: Segment) -> Self {
        self.init = Some(init);
        self
    }

    pub fn with_finished(self, finished: bool) -> Self {
        self.finished.store(finished, Ordering::Release);
        self
    }

    pub fn with_initialized(mut self, initialized: bool) -> Self {
        self.initialized = initialized;
        self
    }

    /// Marks the index as late-binding: segment times are not chronologically reliable
    /// until the index is finished.
    pub fn late_binding(mut self) -> Self {
        self.chronological = false;
        self
    }

    pub fn with_discontinuity(mut self, start: f64, end: f64) -> Self {
        self.discontinuities.push((start, end));
        self
    }

    pub fn append(&self, segment: Segment) {
        let mut segments = self.segments.write();
        let at = segments.partition_point(|s| s.time <= segment.time);
        segments.insert(at, segment);
    }

    /// Drops segments ending before `time`, like a live sliding window.
    pub fn evict_before(&self, time: f64) {
        self.segments.write().retain(|s| s.end > time);
        *self.evicted_before.write() = Some(time);
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

impl SegmentIndex for StaticSegmentIndex {
    fn init_segment(&self) -> Option<Segment> {
        self.init.clone()
    }

    fn segments(&self, start: f64, duration: f64) -> Vec<Segment> {
        let end = start + duration;
        self.segments
            .read()
            .iter()
            .filter(|s| s.end > start && s.time < end)
            .cloned()
            .collect()
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn last_position(&self) -> Option<f64> {
        self.segments.read().last().map(|s| s.end)
    }

    fn should_refresh(&self, _start: f64, end: f64) -> bool {
        if self.is_finished() {
            return false;
        }
        self.last_position().is_none_or(|last| end > last)
    }

    fn check_discontinuity(&self, time: f64) -> Option<f64> {
        self.discontinuities
            .iter()
            .find(|(start, end)| time >= *start && time < *end)
            .map(|(_, end)| *end)
    }

    fn segment_before(&self, time: f64) -> Option<Segment> {
        self.segments
            .read()
            .iter()
            .rev()
            .find(|s| s.time < time)
            .cloned()
    }

    fn segment_after(&self, time: f64) -> Option<Segment> {
        self.segments.read().iter().find(|s| s.time >= time).cloned()
    }

    fn is_chronological(&self) -> bool {
        self.chronological
    }

    fn is_segment_still_available(&self, segment: &Segment) -> Option<bool> {
        if segment.is_init {
            return Some(true);
        }
        let present = self.segments.read().iter().any(|s| s.id == segment.id);
        if present {
            return Some(true);
        }
        match *self.evicted_before.read() {
            Some(limit) if segment.end <= limit => Some(false),
            _ => None,
        }
    }

    fn can_be_out_of_sync_error(&self, error: &FetchError) -> bool {
        !self.is_finished() && matches!(error, FetchError::HttpStatus { status: 404 | 412, .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtectionData {
    pub system_id: String,
    pub data: Bytes,
}

/// One quality variant of a track.
#[derive(Debug)]
pub struct Representation {
    pub id: String,
    /// Bits per second.
    pub bitrate: f64,
    pub codec: String,
    pub mime_type: String,
    pub is_supported: bool,
    pub protection_data: Vec<ProtectionData>,
    pub index: Arc<dyn SegmentIndex>,
    decipherable: RwLock<Option<bool>>,
}

impl Representation {
    pub fn new(
        id: impl Into<String>,
        bitrate: f64,
        codec: impl Into<String>,
        index: Arc<dyn SegmentIndex>,
    ) -> Self {
        Self {
            id: id.into(),
            bitrate,
            codec: codec.into(),
            mime_type: String::new(),
            is_supported: true,
            protection_data: Vec::new(),
            index,
            decipherable: RwLock::new(None),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_supported(mut self, supported: bool) -> Self {
        self.is_supported = supported;
        self
    }

    pub fn with_protection_data(mut self, data: ProtectionData) -> Self {
        self.protection_data.push(data);
        self
    }

    /// `None` until the decryption layer has decided.
    pub fn decipherable(&self) -> Option<bool> {
        *self.decipherable.read()
    }

    pub fn set_decipherable(&self, value: Option<bool>) {
        *self.decipherable.write() = value;
    }

    pub fn is_playable(&self) -> bool {
        self.is_supported && self.decipherable() != Some(false)
    }

    /// Full codec description, as compared against a sink's current codec.
    pub fn codec_string(&self) -> String {
        if self.mime_type.is_empty() {
            self.codec.clone()
        } else {
            format!("{};codecs=\"{}\"", self.mime_type, self.codec)
        }
    }
}

/// Whether data of `new` can follow data of `current` in a fixed-codec sink.
///
/// Codec profiles may differ (`avc1.4d401f` vs `avc1.640028`) but not families.
pub fn are_codecs_compatible(current: &str, new: &str) -> bool {
    fn split(codec: &str) -> (&str, &str) {
        match codec.split_once(';') {
            Some((mime, params)) => {
                let codec = params
                    .trim()
                    .trim_start_matches("codecs=")
                    .trim_matches('"');
                (mime.trim(), codec)
            }
            None => ("", codec.trim()),
        }
    }
    let (mime_a, codec_a) = split(current);
    let (mime_b, codec_b) = split(new);
    if !mime_a.is_empty() && !mime_b.is_empty() && mime_a != mime_b {
        return false;
    }
    let family = |c: &str| c.split('.').next().unwrap_or(c).to_ascii_lowercase();
    family(codec_a) == family(codec_b)
}

/// A selectable track of a period.
#[derive(Debug)]
pub struct Adaptation {
    pub id: String,
    pub track_type: TrackType,
    pub language: Option<String>,
    pub representations: Vec<Arc<Representation>>,
}

impl Adaptation {
    pub fn new(
        id: impl Into<String>,
        track_type: TrackType,
        representations: Vec<Arc<Representation>>,
    ) -> Self {
        Self {
            id: id.into(),
            track_type,
            language: None,
            representations,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn playable_representations(&self) -> Vec<Arc<Representation>> {
        self.representations
            .iter()
            .filter(|r| r.is_playable())
            .cloned()
            .collect()
    }

    pub fn representation(&self, id: &str) -> Option<Arc<Representation>> {
        self.representations.iter().find(|r| r.id == id).cloned()
    }
}

#[derive(Debug)]
pub struct Period {
    pub id: String,
    pub start: f64,
    /// `None` while the end is unknown (live edge).
    pub end: Option<f64>,
    adaptations: HashMap<TrackType, Vec<Arc<Adaptation>>>,
}

impl Period {
    pub fn new(id: impl Into<String>, start: f64, end: Option<f64>) -> Self {
        Self {
            id: id.into(),
            start,
            end,
            adaptations: HashMap::new(),
        }
    }

    pub fn with_adaptation(mut self, adaptation: Adaptation) -> Self {
        self.adaptations
            .entry(adaptation.track_type)
            .or_default()
            .push(Arc::new(adaptation));
        self
    }

    pub fn adaptations_for_type(&self, track_type: TrackType) -> &[Arc<Adaptation>] {
        self.adaptations
            .get(&track_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn end_or_infinity(&self) -> f64 {
        self.end.unwrap_or(f64::INFINITY)
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end_or_infinity()
    }

    pub fn track_types(&self) -> Vec<TrackType> {
        let mut types: Vec<TrackType> = self.adaptations.keys().copied().collect();
        types.sort();
        types
    }
}

/// Notifications emitted when the manifest changes in place.
#[derive(Debug, Clone)]
pub enum ManifestEvent {
    /// Periods were added or updated by a refresh.
    Updated,
    /// Representations whose decipherability changed.
    DecipherabilityUpdate(Vec<DecipherabilityChange>),
}

#[derive(Debug, Clone)]
pub struct DecipherabilityChange {
    pub period: Arc<Period>,
    pub adaptation: Arc<Adaptation>,
    pub representation: Arc<Representation>,
    pub decipherable: Option<bool>,
}

#[derive(Debug)]
pub struct Manifest {
    pub id: String,
    pub is_dynamic: bool,
    periods: RwLock<Vec<Arc<Period>>>,
    last_period_known: AtomicBool,
}

impl Manifest {
    pub fn new(id: impl Into<String>, periods: Vec<Period>) -> Self {
        let mut periods: Vec<Arc<Period>> = periods.into_iter().map(Arc::new).collect();
        periods.sort_by(|a, b| a.start.total_cmp(&b.start));
        Self {
            id: id.into(),
            is_dynamic: false,
            periods: RwLock::new(periods),
            last_period_known: AtomicBool::new(true),
        }
    }

    /// A live manifest whose later periods are still unknown.
    pub fn dynamic(mut self) -> Self {
        self.is_dynamic = true;
        self.last_period_known.store(false, Ordering::Release);
        self
    }

    pub fn periods(&self) -> Vec<Arc<Period>> {
        self.periods.read().clone()
    }

    pub fn first_period(&self) -> Option<Arc<Period>> {
        self.periods.read().first().cloned()
    }

    pub fn period(&self, id: &str) -> Option<Arc<Period>> {
        self.periods.read().iter().find(|p| p.id == id).cloned()
    }

    pub fn period_for_time(&self, time: f64) -> Option<Arc<Period>> {
        self.periods.read().iter().find(|p| p.contains(time)).cloned()
    }

    pub fn period_after(&self, period: &Period) -> Option<Arc<Period>> {
        self.periods
            .read()
            .iter()
            .find(|p| p.start >= period.end_or_infinity() - 1e-9 && p.id != period.id)
            .cloned()
    }

    pub fn is_last_period_known(&self) -> bool {
        self.last_period_known.load(Ordering::Acquire)
    }

    pub fn set_last_period_known(&self, known: bool) {
        self.last_period_known.store(known, Ordering::Release);
    }

    /// Adds a period from a refresh. Callers then broadcast [`ManifestEvent::Updated`].
    pub fn add_period(&self, period: Period) -> Arc<Period> {
        let period = Arc::new(period);
        let mut periods = self.periods.write();
        let at = periods.partition_point(|p| p.start <= period.start);
        periods.insert(at, Arc::clone(&period));
        period
    }

    /// Applies `decide` to every representation and returns those whose
    /// decipherability changed.
    pub fn update_decipherability(
        &self,
        decide: impl Fn(&Representation) -> Option<bool>,
    ) -> Vec<DecipherabilityChange> {
        let mut changes = Vec::new();
        for period in self.periods.read().iter() {
            for track_type in TrackType::ALL {
                for adaptation in period.adaptations_for_type(track_type) {
                    for representation in &adaptation.representations {
                        let value = decide(representation);
                        if value != representation.decipherable() {
                            representation.set_decipherable(value);
                            changes.push(DecipherabilityChange {
                                period: Arc::clone(period),
                                adaptation: Arc::clone(adaptation),
                                representation: Arc::clone(representation),
                                decipherable: value,
                            });
                        }
                    }
                }
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest::new(
            "m",
            vec![
                Period::new("p1", 40.0, Some(80.0)),
                Period::new("p0", 0.0, Some(40.0)),
            ],
        )
    }

    #[test]
    fn test_period_lookup() {
        let manifest = manifest();
        assert_eq!(manifest.period_for_time(10.0).unwrap().id, "p0");
        assert_eq!(manifest.period_for_time(40.0).unwrap().id, "p1");
        assert!(manifest.period_for_time(90.0).is_none());

        let p0 = manifest.period("p0").unwrap();
        assert_eq!(manifest.period_after(&p0).unwrap().id, "p1");
        let p1 = manifest.period("p1").unwrap();
        assert!(manifest.period_after(&p1).is_none());
    }

    #[test]
    fn test_add_period_keeps_order() {
        let manifest = manifest().dynamic();
        assert!(!manifest.is_last_period_known());
        manifest.add_period(Period::new("p2", 80.0, None));
        let ids: Vec<String> = manifest.periods().iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, ["p0", "p1", "p2"]);
    }

    #[test]
    fn test_uniform_index() {
        let index = StaticSegmentIndex::uniform("v", 0.0, 40.0, 6.0);
        let segments = index.segments(10.0, 30.0);
        let starts: Vec<f64> = segments.iter().map(|s| s.time).collect();
        assert_eq!(starts, [6.0, 12.0, 18.0, 24.0, 30.0, 36.0]);
        assert_eq!(index.last_position(), Some(40.0));
        assert_eq!(segments.last().unwrap().duration, 4.0);
        assert!(!index.should_refresh(0.0, 50.0));
    }

    #[test]
    fn test_live_index_refresh_and_availability() {
        let index = StaticSegmentIndex::uniform("v", 0.0, 20.0, 4.0).with_finished(false);
        assert!(index.should_refresh(10.0, 30.0));
        assert!(!index.should_refresh(0.0, 10.0));

        let old = index.segments(0.0, 4.0).remove(0);
        index.evict_before(8.0);
        assert_eq!(index.is_segment_still_available(&old), Some(false));
        index.append(Segment::media("v-5", 20.0, 4.0));
        assert_eq!(index.last_position(), Some(24.0));
        assert!(index.can_be_out_of_sync_error(&FetchError::http_status(404, "u")));
    }

    #[test]
    fn test_codec_compatibility() {
        assert!(are_codecs_compatible("avc1.4d401f", "avc1.640028"));
        assert!(!are_codecs_compatible("avc1.4d401f", "hev1.1.6.L93.B0"));
        assert!(are_codecs_compatible(
            "video/mp4;codecs=\"avc1.4d401f\"",
            "video/mp4;codecs=\"avc1.64001f\""
        ));
        assert!(!are_codecs_compatible(
            "video/mp4;codecs=\"avc1.4d401f\"",
            "video/webm;codecs=\"avc1.4d401f\""
        ));
    }

    #[test]
    fn test_decipherability_update() {
        let index: Arc<dyn SegmentIndex> = Arc::new(StaticSegmentIndex::new(vec![]));
        let rep = Representation::new("r1", 1000.0, "avc1", index);
        let period = Period::new("p0", 0.0, None).with_adaptation(Adaptation::new(
            "a",
            TrackType::Video,
            vec![Arc::new(rep)],
        ));
        let manifest = Manifest::new("m", vec![period]);
        let changes = manifest.update_decipherability(|r| (r.id == "r1").then_some(false));
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].representation.is_playable());
        assert!(manifest.update_decipherability(|_| Some(false)).is_empty());
    }
}
