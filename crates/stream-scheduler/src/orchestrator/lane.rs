// Lane: the chain of track schedulers loading one track type, one per period.
//
// A lane starts at the period of the current position, appends the next period
// once the last one finished loading, drops periods playback has left and restarts
// from scratch when the position jumps outside what it covers.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::next_manifest_event;
use crate::error::StreamError;
use crate::events::{StreamEvent, StreamStatus};
use crate::manifest::{DecipherabilityChange, Manifest, ManifestEvent, Period, TrackType};
use crate::ranges::{TimeRange, insert_range};
use crate::scheduler::{SchedulerContext, TrackScheduler, watch_changed};
use crate::sink::MediaSink;
use crate::track_selector::TrackSelector;

/// What a lane reports to the orchestrator.
#[derive(Debug)]
pub(crate) enum LaneMessage {
    Event(StreamEvent),
    /// Whether the lane loaded everything up to the end of the content.
    Completion { track_type: TrackType, complete: bool },
}

struct Chain {
    period: Arc<Period>,
    generation: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
    finished: bool,
}

struct ChainExit {
    generation: u64,
    result: Result<(), StreamError>,
}

pub(crate) struct Lane {
    ctx: SchedulerContext,
    track_type: TrackType,
    manifest: Arc<Manifest>,
    sink: Arc<dyn MediaSink>,
    track_selector: Arc<dyn TrackSelector>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    manifest_events: Option<broadcast::Receiver<ManifestEvent>>,
    output: mpsc::UnboundedSender<LaneMessage>,
    exits_tx: mpsc::UnboundedSender<ChainExit>,
    exits_rx: mpsc::UnboundedReceiver<ChainExit>,
    chains: Vec<Chain>,
    next_generation: u64,
    complete: bool,
    token: CancellationToken,
}

impl Lane {
    /// `ctx.events` must be the sender side of `events`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: SchedulerContext,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        sink: Arc<dyn MediaSink>,
        manifest: Arc<Manifest>,
        track_selector: Arc<dyn TrackSelector>,
        manifest_events: Option<broadcast::Receiver<ManifestEvent>>,
        output: mpsc::UnboundedSender<LaneMessage>,
        token: CancellationToken,
    ) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            track_type: sink.track_type(),
            manifest,
            sink,
            track_selector,
            events,
            manifest_events,
            output,
            exits_tx,
            exits_rx,
            chains: Vec::new(),
            next_generation: 0,
            complete: false,
            token,
        }
    }

    pub(crate) async fn run(mut self) -> Result<(), StreamError> {
        info!(track = %self.track_type, "Lane started");
        let result = self.run_loop().await;
        let chains = std::mem::take(&mut self.chains);
        for chain in chains {
            chain.token.cancel();
            if let Err(e) = chain.task.await
                && e.is_panic()
            {
                warn!(track = %self.track_type, period = %chain.period.id, "Period chain panicked");
            }
        }
        match &result {
            Ok(()) => debug!(track = %self.track_type, "Lane stopped"),
            Err(e) => warn!(track = %self.track_type, error = %e, "Lane failed"),
        }
        result
    }

    async fn run_loop(&mut self) -> Result<(), StreamError> {
        let mut observations = self.ctx.observations.clone();
        let position = observations.borrow_and_update().position;
        let period = self.period_for(position).ok_or_else(|| StreamError::Manifest {
            reason: "manifest has no period".to_string(),
        })?;
        self.restart(period).await;

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(()),
                Some(exit) = self.exits_rx.recv() => self.on_chain_exit(exit)?,
                Some(event) = self.events.recv() => self.on_event(event).await,
                _ = watch_changed(&mut observations) => {
                    let position = observations.borrow_and_update().position;
                    self.on_position(position).await;
                }
                event = next_manifest_event(&mut self.manifest_events) => {
                    self.on_manifest_event(event).await?;
                }
            }
        }
    }

    /// Period a chain should start from for `position`: the one containing it, the
    /// next one when in a gap, the last one past the end.
    fn period_for(&self, position: f64) -> Option<Arc<Period>> {
        let periods = self.manifest.periods();
        periods
            .iter()
            .find(|p| p.contains(position))
            .or_else(|| periods.iter().find(|p| p.start > position))
            .or_else(|| periods.last())
            .cloned()
    }

    fn forward(&self, event: StreamEvent) {
        self.send_output(LaneMessage::Event(event));
    }

    /// Returns false once the orchestrator stopped listening.
    fn send_output(&self, message: LaneMessage) -> bool {
        if self.output.send(message).is_err() {
            debug!(track = %self.track_type, "Lane output closed, dropping message");
            return false;
        }
        true
    }

    fn start_chain(&mut self, period: Arc<Period>) {
        let generation = self.next_generation;
        self.next_generation += 1;
        debug!(track = %self.track_type, period = %period.id, "Starting period chain");

        let token = self.token.child_token();
        let scheduler = TrackScheduler::new(
            self.ctx.clone(),
            Arc::clone(&self.manifest),
            Arc::clone(&period),
            self.track_type,
            Arc::clone(&self.sink),
            self.track_selector.select(&period, self.track_type),
            token.clone(),
        );
        let exits = self.exits_tx.clone();
        let task = tokio::spawn(async move {
            let result = scheduler.run().await;
            if exits.send(ChainExit { generation, result }).is_err() {
                debug!(generation, "Lane gone before period chain exit");
            }
        });
        self.chains.push(Chain {
            period,
            generation,
            token,
            task,
            finished: false,
        });
    }

    async fn stop_chain(&self, chain: Chain) {
        chain.token.cancel();
        if let Err(e) = chain.task.await
            && e.is_panic()
        {
            warn!(track = %self.track_type, period = %chain.period.id, "Period chain panicked");
        }
        debug!(track = %self.track_type, period = %chain.period.id, "Period chain cleared");
        self.forward(StreamEvent::PeriodStreamCleared {
            track_type: self.track_type,
            period: chain.period,
        });
    }

    async fn stop_chains_from(&mut self, index: usize) {
        let removed: Vec<Chain> = self.chains.drain(index..).collect();
        for chain in removed.into_iter().rev() {
            self.stop_chain(chain).await;
        }
    }

    async fn restart(&mut self, period: Arc<Period>) {
        info!(track = %self.track_type, period = %period.id, "Restarting lane");
        self.stop_chains_from(0).await;
        self.start_chain(period);
        self.update_completion();
    }

    /// Appends the period following the last chain, if known.
    fn extend(&mut self) {
        let Some(last) = self.chains.last() else {
            return;
        };
        if let Some(next) = self.manifest.period_after(&last.period)
            && !self.chains.iter().any(|c| c.period.id == next.id)
        {
            self.start_chain(next);
        }
    }

    fn update_completion(&mut self) {
        let complete = self.manifest.is_last_period_known()
            && self
                .chains
                .last()
                .is_some_and(|c| c.finished && self.manifest.period_after(&c.period).is_none());
        if complete != self.complete {
            debug!(track = %self.track_type, complete, "Lane completion changed");
            self.complete = complete;
            self.send_output(LaneMessage::Completion {
                track_type: self.track_type,
                complete,
            });
        }
    }

    fn on_chain_exit(&mut self, exit: ChainExit) -> Result<(), StreamError> {
        let Some(at) = self.chains.iter().position(|c| c.generation == exit.generation) else {
            return Ok(());
        };
        let chain = self.chains.remove(at);
        debug!(track = %self.track_type, period = %chain.period.id, "Period chain exited");
        exit.result
    }

    async fn on_event(&mut self, event: StreamEvent) {
        let status = match &event {
            StreamEvent::StreamStatus(status) => Some(status.clone()),
            _ => None,
        };
        self.forward(event);
        if let Some(status) = status {
            self.on_status(&status).await;
        }
    }

    async fn on_status(&mut self, status: &StreamStatus) {
        let Some(at) = self.chains.iter().position(|c| c.period.id == status.period.id) else {
            return;
        };
        self.chains[at].finished = status.has_finished_loading;
        if status.has_finished_loading {
            if at + 1 == self.chains.len() {
                self.extend();
            }
        } else if at + 1 < self.chains.len() {
            debug!(
                track = %self.track_type,
                period = %status.period.id,
                "Period needs data again, clearing the following ones"
            );
            self.stop_chains_from(at + 1).await;
        }
        self.update_completion();
    }

    async fn on_position(&mut self, position: f64) {
        while self.chains.len() > 1
            && self.chains[0]
                .period
                .end
                .is_some_and(|end| position >= end)
        {
            let chain = self.chains.remove(0);
            self.stop_chain(chain).await;
        }

        let Some(period) = self.period_for(position) else {
            return;
        };
        if !self.chains.iter().any(|c| c.period.id == period.id) {
            debug!(track = %self.track_type, position, "Position left the loaded periods");
            self.restart(period).await;
        }
    }

    async fn on_manifest_event(&mut self, event: ManifestEvent) -> Result<(), StreamError> {
        match event {
            ManifestEvent::Updated => {
                if self.chains.last().is_some_and(|c| c.finished) {
                    self.extend();
                }
                self.update_completion();
                Ok(())
            }
            ManifestEvent::DecipherabilityUpdate(changes) => self.on_decipherability_update(&changes).await,
        }
    }

    /// Removes data that can no longer be decrypted, then reloads from the position.
    async fn on_decipherability_update(&mut self, changes: &[DecipherabilityChange]) -> Result<(), StreamError> {
        let relevant: Vec<&DecipherabilityChange> = changes
            .iter()
            .filter(|c| c.adaptation.track_type == self.track_type)
            .collect();
        if relevant.is_empty() {
            return Ok(());
        }
        self.stop_chains_from(0).await;

        self.sink.synchronize_inventory();
        let mut to_remove = Vec::new();
        for chunk in self.sink.inventory() {
            let ctx = &chunk.context;
            let undecipherable = relevant.iter().any(|c| {
                c.decipherable == Some(false)
                    && c.period.id == ctx.period.id
                    && c.representation.id == ctx.representation.id
            });
            if undecipherable {
                insert_range(
                    &mut to_remove,
                    TimeRange::new(chunk.effective_start(), chunk.effective_end()),
                );
            }
        }
        for range in &to_remove {
            info!(
                track = %self.track_type,
                start = range.start,
                end = range.end,
                "Removing undecipherable data"
            );
            self.sink
                .remove_buffer(range.start, range.end)
                .await
                .map_err(|e| StreamError::sink("remove", e))?;
        }
        if !to_remove.is_empty() && self.sink.is_native() {
            self.forward(StreamEvent::NeedsBufferFlush {
                track_type: self.track_type,
            });
        }

        if let Some(period) = self.period_for(self.ctx.position()) {
            self.restart(period).await;
        }
        Ok(())
    }
}
