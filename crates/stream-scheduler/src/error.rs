// Stream Scheduler Errors: fatal conditions, warnings and collaborator failures.

use std::time::Duration;

use crate::manifest::TrackType;

/// Failure reported by a [`SegmentFetcher`](crate::fetcher::SegmentFetcher).
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("network error: {reason}")]
    Network { reason: String },

    #[error("invalid segment URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("segment `{segment}` has no URL")]
    MissingUrl { segment: String },

    #[error("fetch failed: {reason}")]
    Other { reason: String },
}

impl FetchError {
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    pub fn http_status(status: u16, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled | Self::InvalidUrl { .. } | Self::MissingUrl { .. } => false,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429 || *status == 412,
            Self::Timeout(_) | Self::Network { .. } | Self::Other { .. } => true,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout(Duration::ZERO);
        }
        if let Some(status) = err.status() {
            return Self::HttpStatus {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        Self::Network {
            reason: err.to_string(),
        }
    }
}

/// Failure reported by a [`MediaSink`](crate::sink::MediaSink) operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SinkError {
    /// The sink has no room left for the pushed data.
    #[error("sink quota exceeded")]
    QuotaExceeded,

    /// The sink was detached from the playback session.
    #[error("sink has been removed")]
    Removed,

    /// The sink's operation queue no longer accepts operations.
    #[error("sink is closed")]
    Closed,

    #[error("sink operation failed: {reason}")]
    Other { reason: String },
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct ParseError {
    pub reason: String,
}

impl ParseError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Stable classification of [`StreamError`]s, for consumers matching on kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    SegmentRequestError,
    BufferAppendError,
    BufferFull,
    ParseError,
    DiscontinuityEncountered,
    LaneDisabled,
    NoPlayableRepresentation,
    ManifestError,
    InternalError,
}

/// Error surfaced by the schedulers, either as a `warning` event or as the fatal
/// result of the orchestrator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("request for segment `{segment}` failed: {source}")]
    Fetch {
        segment: String,
        #[source]
        source: FetchError,
    },

    #[error("sink rejected {operation}: {source}")]
    Sink {
        operation: &'static str,
        #[source]
        source: SinkError,
    },

    #[error("buffer full at position {position}: no data could be garbage collected")]
    BufferFull { position: f64 },

    #[error("could not parse segment `{segment}`: {source}")]
    Parse {
        segment: String,
        #[source]
        source: ParseError,
    },

    #[error("discontinuity encountered at {from}, seeking to {to}")]
    Discontinuity { from: f64, to: f64 },

    #[error("{track} lane failed and was disabled: {reason}")]
    LaneDisabled { track: TrackType, reason: String },

    #[error("no playable representation in adaptation `{adaptation}`")]
    NoPlayableRepresentation { adaptation: String },

    #[error("manifest error: {reason}")]
    Manifest { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl StreamError {
    pub fn fetch(segment: impl Into<String>, source: FetchError) -> Self {
        Self::Fetch {
            segment: segment.into(),
            source,
        }
    }

    pub fn sink(operation: &'static str, source: SinkError) -> Self {
        Self::Sink { operation, source }
    }

    /// Whether the error stops playback. Non-fatal errors are surfaced as warnings.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Fetch { source, .. } => !source.is_retryable(),
            Self::Discontinuity { .. } | Self::LaneDisabled { .. } => false,
            _ => true,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Fetch { .. } => ErrorCode::SegmentRequestError,
            Self::Sink { .. } => ErrorCode::BufferAppendError,
            Self::BufferFull { .. } => ErrorCode::BufferFull,
            Self::Parse { .. } => ErrorCode::ParseError,
            Self::Discontinuity { .. } => ErrorCode::DiscontinuityEncountered,
            Self::LaneDisabled { .. } => ErrorCode::LaneDisabled,
            Self::NoPlayableRepresentation { .. } => ErrorCode::NoPlayableRepresentation,
            Self::Manifest { .. } => ErrorCode::ManifestError,
            Self::Internal { .. } => ErrorCode::InternalError,
        }
    }
}
