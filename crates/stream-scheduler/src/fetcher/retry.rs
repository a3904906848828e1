// Segment Retry: decides whether a failed segment request is tried again, and how
// long to wait before doing so.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::FetchError;
use crate::manifest::{Segment, SegmentIndex};

/// How a failed segment request should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The request was stopped on purpose. Never reported.
    Cancelled,
    /// Network trouble or an overloaded server: the same request may succeed later.
    Transient,
    /// The segment left the live window. Only a refreshed manifest can help.
    SegmentGone,
    /// The server answered as if our index were ahead of it. Worth retrying while
    /// the manifest catches up.
    OutOfSync,
    /// Retrying cannot help.
    Fatal,
}

impl FailureClass {
    /// Classifies `error`, raised while requesting `segment` from `index`.
    pub fn of(error: &FetchError, index: &dyn SegmentIndex, segment: &Segment) -> Self {
        if error.is_cancelled() {
            return Self::Cancelled;
        }
        if index.is_segment_still_available(segment) == Some(false) {
            return Self::SegmentGone;
        }
        if index.can_be_out_of_sync_error(error) {
            return Self::OutOfSync;
        }
        if error.is_retryable() {
            Self::Transient
        } else {
            Self::Fatal
        }
    }

    pub fn should_retry(self) -> bool {
        matches!(self, Self::Transient | Self::OutOfSync)
    }
}

/// Backoff between attempts of one segment request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Each delay is scaled by a random factor in `[1 - fuzz, 1 + fuzz]`.
    pub fuzz_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
            fuzz_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Nominal delay before retry `retry` (1 for the first retry), doubling each
    /// time up to `max_delay`.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }

    /// Delay actually waited before retry `retry`.
    pub fn delay(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        let fuzz = self.fuzz_factor.clamp(0.0, 1.0);
        if fuzz == 0.0 {
            return nominal;
        }
        let factor = rand::rng().random_range(1.0 - fuzz..=1.0 + fuzz);
        nominal.mul_f64(factor)
    }
}

/// Runs `attempt` until it succeeds or `classify` rules the failure out.
///
/// Every retried failure goes through `on_retry` first, so callers can surface it
/// as a warning. Cancellation wins over any pending delay.
pub async fn retry_segment_request<T, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    classify: impl Fn(&FetchError) -> FailureClass,
    on_retry: impl Fn(&FetchError, FailureClass),
    attempt: F,
) -> Result<T, FetchError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut retries = 0;
    loop {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FetchError::Cancelled),
            result = attempt() => result,
        };
        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        let class = classify(&error);
        if !class.should_retry() || retries >= policy.max_retries {
            return Err(error);
        }

        retries += 1;
        let delay = policy.delay(retries);
        warn!(
            retry = retries,
            max = policy.max_retries,
            class = ?class,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Segment request failed, retrying"
        );
        on_retry(&error, class);
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FetchError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
