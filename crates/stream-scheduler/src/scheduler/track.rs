// Track Scheduler: loads one track type of one period, following the adaptation
// choices of the track selector.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::quality::{QualitySwitchScheduler, RepresentationSet};
use super::switch_strategy::{SwitchStrategy, adaptation_switch_strategy};
use super::{SchedulerContext, watch_changed};
use crate::error::StreamError;
use crate::events::{StreamEvent, StreamStatus};
use crate::manifest::{Manifest, Period, TrackType};
use crate::ranges::{TimeRange, intersect_with};
use crate::sink::MediaSink;
use crate::track_selector::AdaptationChoice;

pub struct TrackScheduler {
    ctx: SchedulerContext,
    manifest: Arc<Manifest>,
    period: Arc<Period>,
    track_type: TrackType,
    sink: Arc<dyn MediaSink>,
    choices: watch::Receiver<Option<AdaptationChoice>>,
    token: CancellationToken,
}

/// What currently loads the track.
struct Running {
    token: CancellationToken,
    representations: Option<watch::Sender<RepresentationSet>>,
    task: BoxFuture<'static, Result<(), StreamError>>,
}

impl TrackScheduler {
    pub fn new(
        ctx: SchedulerContext,
        manifest: Arc<Manifest>,
        period: Arc<Period>,
        track_type: TrackType,
        sink: Arc<dyn MediaSink>,
        choices: watch::Receiver<Option<AdaptationChoice>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            manifest,
            period,
            track_type,
            sink,
            choices,
            token,
        }
    }

    pub async fn run(mut self) -> Result<(), StreamError> {
        let mut choice = self.choices.borrow_and_update().clone();
        'choice: loop {
            let mut running = self.start(choice.as_ref()).await?;
            loop {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => {
                        running.token.cancel();
                        let _ = running.task.await;
                        return Ok(());
                    }
                    result = &mut running.task => match result {
                        Ok(()) => return Ok(()),
                        Err(e) if !self.sink.is_native() && choice.is_some() => {
                            warn!(
                                period = %self.period.id,
                                track = %self.track_type,
                                error = %e,
                                "Track failed, disabling it"
                            );
                            self.ctx.emit(StreamEvent::Warning(StreamError::LaneDisabled {
                                track: self.track_type,
                                reason: e.to_string(),
                            }));
                            choice = None;
                            continue 'choice;
                        }
                        Err(e) => return Err(e),
                    },
                    _ = watch_changed(&mut self.choices) => {
                        let next = self.choices.borrow_and_update().clone();
                        let same_adaptation = matches!(
                            (&choice, &next),
                            (Some(current), Some(update)) if current.adaptation.id == update.adaptation.id
                        );
                        if same_adaptation
                            && let (Some(representations), Some(update)) = (&running.representations, &next)
                        {
                            representations.send_replace(RepresentationSet::from(update));
                            choice = next;
                            continue;
                        }
                        running.token.cancel();
                        if let Err(e) = running.task.await {
                            debug!(track = %self.track_type, error = %e, "Previous choice failed while stopping");
                        }
                        choice = next;
                        continue 'choice;
                    }
                }
            }
        }
    }

    async fn start(&self, choice: Option<&AdaptationChoice>) -> Result<Running, StreamError> {
        let token = self.token.child_token();
        let Some(choice) = choice else {
            info!(period = %self.period.id, track = %self.track_type, "Track disabled");
            self.clear_period().await?;
            self.emit_adaptation(None);
            return Ok(Running {
                task: disabled_track(self.ctx.clone(), Arc::clone(&self.period), self.track_type, token.clone())
                    .boxed(),
                token,
                representations: None,
            });
        };

        let observation = self.ctx.observations.borrow().clone();
        let padding = self.ctx.config.switching.padding_for(self.track_type);
        let strategy = adaptation_switch_strategy(
            self.sink.as_ref(),
            &self.period,
            &choice.adaptation,
            choice.switching_mode,
            &observation,
            padding,
        );
        debug!(
            period = %self.period.id,
            adaptation = %choice.adaptation.id,
            strategy = ?strategy,
            "Adaptation chosen"
        );
        if strategy == SwitchStrategy::NeedsReload {
            self.ctx.emit(StreamEvent::NeedsMediaSourceReload {
                position: observation.position,
                auto_play: !observation.paused,
            });
            let idle = token.clone();
            return Ok(Running {
                task: async move {
                    idle.cancelled().await;
                    Ok(())
                }
                .boxed(),
                token,
                representations: None,
            });
        }
        if strategy.apply(self.sink.as_ref()).await? {
            self.ctx.emit(StreamEvent::NeedsBufferFlush {
                track_type: self.track_type,
            });
        }

        self.emit_adaptation(Some(choice));
        let (representations_tx, representations_rx) = watch::channel(RepresentationSet::from(choice));
        let scheduler = QualitySwitchScheduler::new(
            self.ctx.clone(),
            Arc::clone(&self.manifest),
            Arc::clone(&self.period),
            Arc::clone(&choice.adaptation),
            Arc::clone(&self.sink),
            representations_rx,
            token.clone(),
        );
        Ok(Running {
            task: scheduler.run().boxed(),
            token,
            representations: Some(representations_tx),
        })
    }

    fn emit_adaptation(&self, choice: Option<&AdaptationChoice>) {
        self.ctx.emit(StreamEvent::AdaptationChange {
            track_type: self.track_type,
            period: Arc::clone(&self.period),
            adaptation: choice.map(|c| Arc::clone(&c.adaptation)),
        });
    }

    /// Removes whatever the sink holds for this period.
    async fn clear_period(&self) -> Result<(), StreamError> {
        let span = TimeRange::new(self.period.start, self.period.end_or_infinity());
        if intersect_with(&self.sink.buffered_ranges(), &span).is_empty() {
            return Ok(());
        }
        self.sink
            .remove_buffer(span.start, span.end)
            .await
            .map_err(|e| StreamError::sink("remove", e))
    }
}

/// Reports a finished track on every observation so that the end of the stream
/// can still be detected.
async fn disabled_track(
    ctx: SchedulerContext,
    period: Arc<Period>,
    track_type: TrackType,
    token: CancellationToken,
) -> Result<(), StreamError> {
    let mut observations = ctx.observations.clone();
    loop {
        let position = observations.borrow_and_update().position;
        ctx.emit(StreamEvent::StreamStatus(StreamStatus {
            period: Arc::clone(&period),
            track_type,
            position,
            has_finished_loading: true,
            imminent_discontinuity: None,
            is_buffer_full: false,
            has_media_to_load: false,
            needs_manifest_refresh: false,
        }));
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            _ = watch_changed(&mut observations) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::FetchError;
    use crate::manifest::Adaptation;
    use crate::observation::PlaybackObservation;
    use crate::sink::MemorySink;
    use crate::test_utils::{ScriptedFetcher, TestSession, chunk_context, media_chunk, video_content};

    fn track_scheduler(
        session: &TestSession,
        content: &super::super::StreamContent,
        sink: Arc<dyn MediaSink>,
        choice: Option<AdaptationChoice>,
        token: CancellationToken,
    ) -> (watch::Sender<Option<AdaptationChoice>>, TrackScheduler) {
        let (choice_tx, choice_rx) = watch::channel(choice);
        let scheduler = TrackScheduler::new(
            session.ctx.clone(),
            Arc::clone(&content.manifest),
            Arc::clone(&content.period),
            content.track_type(),
            sink,
            choice_rx,
            token,
        );
        (choice_tx, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_track_reports_finished() {
        let mut session = TestSession::new(ScriptedFetcher::new());
        let content = video_content(1_000_000.0);
        let sink = Arc::new(MemorySink::unbounded(TrackType::Video));
        let ctx = chunk_context(&content, "video-1000000-0", 0.0, 6.0);
        sink.push_chunk(media_chunk(&ctx, 100)).await.unwrap();
        sink.signal_segment_complete(ctx).await.unwrap();

        let token = CancellationToken::new();
        let (_choice, scheduler) = track_scheduler(&session, &content, sink.clone(), None, token.clone());
        let task = tokio::spawn(scheduler.run());

        session
            .wait_for_event(|e| matches!(e, StreamEvent::AdaptationChange { adaptation: None, .. }))
            .await;
        session.wait_for_finished_status(TrackType::Video).await;
        assert!(sink.buffered_ranges().is_empty());

        session.observe(PlaybackObservation::at(3.0));
        session
            .wait_for_event(|e| matches!(e, StreamEvent::StreamStatus(s) if s.position == 3.0 && s.has_finished_loading))
            .await;

        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptation_change_restarts_loading() {
        let mut session = TestSession::new(ScriptedFetcher::new().with_delay(Duration::from_millis(50)));
        let content = video_content(1_000_000.0);
        let sink: Arc<dyn MediaSink> = Arc::new(MemorySink::unbounded(TrackType::Video));
        let token = CancellationToken::new();
        let (choice_tx, scheduler) = track_scheduler(
            &session,
            &content,
            sink,
            Some(AdaptationChoice::new(Arc::clone(&content.adaptation))),
            token.clone(),
        );
        let task = tokio::spawn(scheduler.run());
        session
            .wait_for_event(|e| matches!(e, StreamEvent::AdaptationChange { adaptation: Some(a), .. } if a.id == "video"))
            .await;

        let other = Arc::new(Adaptation::new(
            "video-alt",
            TrackType::Video,
            content.adaptation.representations.clone(),
        ));
        choice_tx.send_replace(Some(AdaptationChoice::new(other)));
        session
            .wait_for_event(|e| matches!(e, StreamEvent::AdaptationChange { adaptation: Some(a), .. } if a.id == "video-alt"))
            .await;

        choice_tx.send_replace(None);
        session
            .wait_for_event(|e| matches!(e, StreamEvent::AdaptationChange { adaptation: None, .. }))
            .await;

        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_text_track_is_disabled() {
        let mut session = TestSession::new(
            ScriptedFetcher::new().with_failure("text-0", FetchError::http_status(403, "denied")),
        );
        let content = crate::test_utils::text_content();
        let sink: Arc<dyn MediaSink> = Arc::new(MemorySink::unbounded(TrackType::Text).with_native(false));
        let token = CancellationToken::new();
        let (_choice, scheduler) = track_scheduler(
            &session,
            &content,
            sink,
            Some(AdaptationChoice::new(Arc::clone(&content.adaptation))),
            token.clone(),
        );
        let task = tokio::spawn(scheduler.run());

        session
            .wait_for_event(|e| matches!(e, StreamEvent::Warning(StreamError::LaneDisabled { track: TrackType::Text, .. })))
            .await;
        session.wait_for_finished_status(TrackType::Text).await;

        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_native_track_is_fatal() {
        let session = TestSession::new(
            ScriptedFetcher::new().with_failure("video-1000000-0", FetchError::http_status(403, "denied")),
        );
        let content = video_content(1_000_000.0);
        let sink: Arc<dyn MediaSink> = Arc::new(MemorySink::unbounded(TrackType::Video));
        let (_choice, scheduler) = track_scheduler(
            &session,
            &content,
            sink,
            Some(AdaptationChoice::new(Arc::clone(&content.adaptation))),
            CancellationToken::new(),
        );
        let err = scheduler.run().await.unwrap_err();
        assert!(matches!(err, StreamError::Fetch { .. }));
    }
}
