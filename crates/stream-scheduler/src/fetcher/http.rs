// HTTP Segment Fetcher: loads segments over HTTP with retry and backoff.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Client;
use tracing::{debug, trace};
use url::Url;

use super::retry::{FailureClass, RetryPolicy, retry_segment_request};
use super::{FetchCallbacks, FetchRequest, FetchSummary, SegmentFetcher};
use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::manifest::Segment;
use crate::metrics::SchedulerMetrics;

/// [`SegmentFetcher`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpSegmentFetcher {
    client: Client,
    base_url: Option<Url>,
    config: FetchConfig,
    retry_policy: RetryPolicy,
    metrics: Option<Arc<SchedulerMetrics>>,
}

impl HttpSegmentFetcher {
    pub fn new(client: Client, config: FetchConfig) -> Self {
        let retry_policy = config.retry_policy();
        Self {
            client,
            base_url: None,
            config,
            retry_policy,
            metrics: None,
        }
    }

    /// Relative segment URLs are resolved against `base_url`.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SchedulerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn resolve_url(&self, segment: &Segment) -> Result<Url, FetchError> {
        let input = segment.url.as_deref().ok_or_else(|| FetchError::MissingUrl {
            segment: segment.id.clone(),
        })?;
        let parsed = match &self.base_url {
            Some(base) => base.join(input),
            None => Url::parse(input),
        };
        parsed.map_err(|e| FetchError::InvalidUrl {
            input: input.to_string(),
            reason: e.to_string(),
        })
    }

    async fn attempt(&self, url: &Url, segment: &Segment) -> Result<Bytes, FetchError> {
        let mut builder = self
            .client
            .get(url.clone())
            .timeout(self.config.request_timeout());
        if let Some(range) = &segment.byte_range {
            builder = builder.header(reqwest::header::RANGE, range.to_header_value());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.config.request_timeout())
            } else {
                FetchError::from(e)
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::http_status(status.as_u16(), url.as_str()));
        }

        trace!(url = %url, http_version = ?response.version(), "Segment response received");
        let mut buffer = BytesMut::with_capacity(response.content_length().unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk.map_err(FetchError::from)?);
        }
        Ok(buffer.freeze())
    }
}

#[async_trait]
impl SegmentFetcher for HttpSegmentFetcher {
    async fn fetch(
        &self,
        request: FetchRequest,
        callbacks: FetchCallbacks,
    ) -> Result<FetchSummary, FetchError> {
        let segment = &request.context.segment;
        let url = self.resolve_url(segment)?;
        let started = Instant::now();

        let index = &*request.context.representation.index;
        let result = retry_segment_request(
            &self.retry_policy,
            &request.token,
            |err| FailureClass::of(err, index, segment),
            |err, _| {
                if let Some(metrics) = &self.metrics {
                    metrics.record_request_retry();
                }
                callbacks.on_retry(err.clone());
            },
            || self.attempt(&url, segment),
        )
        .await;

        match result {
            Ok(data) => {
                let summary = FetchSummary {
                    size: data.len(),
                    elapsed: started.elapsed(),
                };
                debug!(
                    segment = %segment.id,
                    bytes = summary.size,
                    latency_ms = summary.elapsed.as_millis() as u64,
                    "Segment downloaded"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_download(summary.size as u64, summary.elapsed.as_millis() as u64);
                }
                callbacks.on_chunk(data);
                callbacks.on_all_chunks_received();
                Ok(summary)
            }
            Err(err) => {
                if !err.is_cancelled()
                    && let Some(metrics) = &self.metrics
                {
                    metrics.record_download_error();
                }
                Err(err)
            }
        }
    }
}
