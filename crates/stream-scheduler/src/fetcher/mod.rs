// Segment Fetcher: the network seam turning a segment descriptor into bytes.

pub mod http;
pub mod prioritizer;
pub mod retry;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::sink::ChunkContext;

pub use http::HttpSegmentFetcher;
pub use prioritizer::PrioritizedFetcher;

/// Progress notifications of a request.
#[derive(Debug, Clone)]
pub enum FetchEvent {
    /// An attempt failed and will be retried.
    Retry(FetchError),
    Chunk(Bytes),
    AllChunksReceived,
}

/// Callbacks through which a fetcher reports progress.
#[derive(Clone)]
pub struct FetchCallbacks {
    listener: Arc<dyn Fn(FetchEvent) + Send + Sync>,
}

impl FetchCallbacks {
    pub fn new(listener: impl Fn(FetchEvent) + Send + Sync + 'static) -> Self {
        Self {
            listener: Arc::new(listener),
        }
    }

    pub fn on_retry(&self, error: FetchError) {
        (self.listener)(FetchEvent::Retry(error));
    }

    pub fn on_chunk(&self, data: Bytes) {
        (self.listener)(FetchEvent::Chunk(data));
    }

    pub fn on_all_chunks_received(&self) {
        (self.listener)(FetchEvent::AllChunksReceived);
    }
}

impl fmt::Debug for FetchCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCallbacks").finish_non_exhaustive()
    }
}

/// Live priority of an in-flight request. Lower is more urgent.
#[derive(Debug, Clone)]
pub struct RequestPriority(watch::Receiver<i32>);

impl RequestPriority {
    pub fn new(priority: i32) -> (watch::Sender<i32>, RequestPriority) {
        let (tx, rx) = watch::channel(priority);
        (tx, RequestPriority(rx))
    }

    pub fn get(&self) -> i32 {
        *self.0.borrow()
    }

    /// Resolves once the priority was updated. Never resolves after the sender is gone.
    pub async fn changed(&mut self) -> i32 {
        match self.0.changed().await {
            Ok(()) => *self.0.borrow_and_update(),
            Err(_) => std::future::pending().await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub context: ChunkContext,
    pub priority: RequestPriority,
    /// Cancelled when the request is no longer wanted.
    pub token: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchSummary {
    pub size: usize,
    pub elapsed: Duration,
}

#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    /// Loads the request's segment, reporting chunks and retries through `callbacks`.
    ///
    /// Resolves once every chunk has been reported. Returns
    /// [`FetchError::Cancelled`] if the request token is cancelled first.
    async fn fetch(
        &self,
        request: FetchRequest,
        callbacks: FetchCallbacks,
    ) -> Result<FetchSummary, FetchError>;
}
