use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use frame_bus::{
    buffer::FrameBuffer,
    encoder::{EncoderProcessHandle, EncoderSink, FeedError},
    frame::{Frame, SourceKind, StreamInfo},
    output::{Destination, purge_artifacts},
    source::{FrameSource, SourceError},
};
use tokio_util::sync::CancellationToken;

use super::{
    annotate::AnnotationStage,
    retry::{BackoffPolicy, Readiness, pause, wait_ready},
    state::{PipelineState, StateMachine},
    stats::PipelineStats,
};
use crate::config::PipelineConfig;

type SharedSource = Arc<Mutex<Box<dyn FrameSource>>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The finite source was fully streamed.
    Finished,
    /// `stop()` ended the session.
    Stopped,
    /// The push destination never answered the startup probe.
    Unreachable(String),
    Failed(String),
}

/// Why one attempt (open, encode, stream) ended.
#[derive(Debug)]
enum AttemptEnd {
    EndOfStream,
    Cancelled,
    SourceFailed(String),
    SinkClosed(String),
    Fatal(String),
}

enum CaptureEnd {
    EndOfStream,
    Cancelled,
    Failed(String),
}

/// One streaming session: owns the source, the encoder sink and the
/// annotation stage until it settles back to `Stopped`.
pub(crate) struct Session {
    config: PipelineConfig,
    source: SharedSource,
    sink: EncoderSink,
    annotation: AnnotationStage,
    state: Arc<StateMachine>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        config: PipelineConfig,
        source: Box<dyn FrameSource>,
        sink: EncoderSink,
        annotation: AnnotationStage,
        state: Arc<StateMachine>,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            source: Arc::new(Mutex::new(source)),
            sink,
            annotation,
            state,
            stats,
            cancel,
        }
    }

    pub(crate) async fn run(self) -> SessionOutcome {
        self.stats.session_started();
        let outcome = self.run_attempts().await;

        if !matches!(outcome, SessionOutcome::Unreachable(_)) {
            let _ = self.state.transition(PipelineState::Stopping);
        }
        if let Destination::Segmented(out) = &self.config.destination {
            if let Err(e) = purge_artifacts(&out.dir) {
                log::warn!("pipeline: failed to clear {}: {}", out.dir.display(), e);
            }
        }
        let _ = self.state.transition(PipelineState::Stopped);

        match &outcome {
            SessionOutcome::Unreachable(reason) | SessionOutcome::Failed(reason) => {
                log::error!("pipeline: session failed: {}", reason);
                self.stats.set_error(reason.clone());
            }
            SessionOutcome::Finished => log::info!("pipeline: source finished"),
            SessionOutcome::Stopped => log::info!("pipeline: session stopped"),
        }
        outcome
    }

    async fn run_attempts(&self) -> SessionOutcome {
        let reconnect = BackoffPolicy::fixed(self.config.reconnect_delay);
        let mut reconnects = 0;

        loop {
            if let Destination::Push(push) = &self.config.destination {
                // only the first probe of a session is bounded
                let (policy, budget) = if reconnects == 0 {
                    (
                        BackoffPolicy::within(self.config.probe_timeout, self.config.probe_interval),
                        Some(self.config.probe_timeout),
                    )
                } else {
                    (BackoffPolicy::fixed(self.config.probe_interval), None)
                };
                match wait_ready(&push.probe_addr(), policy, budget, &self.cancel).await {
                    Readiness::Ready => {}
                    Readiness::Cancelled => return SessionOutcome::Stopped,
                    Readiness::Exhausted { attempts } => {
                        return SessionOutcome::Unreachable(format!(
                            "destination {} unreachable after {} attempts",
                            push.probe_addr(),
                            attempts
                        ));
                    }
                }
            }

            let Some(info) = self.open_source().await else {
                self.close_source().await;
                return SessionOutcome::Stopped;
            };

            let mut handle = match self.sink.start(&info, &self.config.destination) {
                Ok(handle) => handle,
                Err(e) => {
                    self.close_source().await;
                    return SessionOutcome::Failed(e.to_string());
                }
            };

            let end = if self.cancel.is_cancelled()
                || self.state.transition(PipelineState::Running).is_err()
            {
                AttemptEnd::Cancelled
            } else {
                self.stream(&mut handle, &info).await
            };

            self.close_source().await;
            self.sink.stop(handle).await;

            match end {
                AttemptEnd::EndOfStream => return SessionOutcome::Finished,
                AttemptEnd::Cancelled => return SessionOutcome::Stopped,
                AttemptEnd::Fatal(reason) => return SessionOutcome::Failed(reason),
                AttemptEnd::SinkClosed(reason) if !self.config.destination.is_push() => {
                    return SessionOutcome::Failed(reason);
                }
                AttemptEnd::SourceFailed(reason) | AttemptEnd::SinkClosed(reason) => {
                    log::warn!("pipeline: {}, reconnecting", reason);
                    self.stats.set_error(reason);
                }
            }

            if self.state.transition(PipelineState::Reconnecting).is_err() {
                return SessionOutcome::Stopped;
            }
            reconnects += 1;
            self.stats.reconnected();
            let Some(delay) = reconnect.delay_for(reconnects) else {
                return SessionOutcome::Failed("reconnect attempts exhausted".to_string());
            };
            if !pause(delay, &self.cancel).await {
                return SessionOutcome::Stopped;
            }
        }
    }

    /// Opens the source, polling until it succeeds. `None` once cancelled.
    async fn open_source(&self) -> Option<StreamInfo> {
        let policy = BackoffPolicy::fixed(self.config.open_poll);
        let mut failures = 0;
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            let source = self.source.clone();
            let locator = self.config.source.clone();
            let result = tokio::task::spawn_blocking(move || {
                let mut source = lock(&source);
                source.open(&locator)
            })
            .await;
            let reason = match result {
                Ok(Ok(info)) => return Some(info),
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };
            failures += 1;
            log::warn!("pipeline: open attempt {} failed: {}", failures, reason);

            let delay = policy.delay_for(failures)?;
            if !pause(delay, &self.cancel).await {
                return None;
            }
        }
    }

    async fn close_source(&self) {
        let source = self.source.clone();
        let closed = tokio::task::spawn_blocking(move || {
            let mut source = lock(&source);
            source.close();
        });
        if let Err(e) = closed.await {
            log::warn!("pipeline: closing source failed: {}", e);
        }
    }

    /// Runs the capture unit and the processing unit until one of them ends
    /// the attempt.
    async fn stream(&self, handle: &mut EncoderProcessHandle, info: &StreamInfo) -> AttemptEnd {
        let buffer = Arc::new(FrameBuffer::with_capacity(self.config.buffer_capacity));
        let units = self.cancel.child_token();
        let pacing = (info.kind == SourceKind::Finite)
            .then(|| Duration::from_secs_f64(1.0 / info.fps as f64));

        let capture = {
            let source = self.source.clone();
            let buffer = buffer.clone();
            let units = units.clone();
            let stats = self.stats.clone();
            tokio::task::spawn_blocking(move || capture(&source, &buffer, &units, &stats, pacing))
        };

        let sink_end = self.process(handle, &buffer).await;
        units.cancel();
        let capture_end = match capture.await {
            Ok(end) => end,
            Err(e) => CaptureEnd::Failed(format!("capture unit failed: {}", e)),
        };

        if self.cancel.is_cancelled() {
            return AttemptEnd::Cancelled;
        }
        if let Some(end) = sink_end {
            return end;
        }
        match capture_end {
            CaptureEnd::EndOfStream => AttemptEnd::EndOfStream,
            CaptureEnd::Cancelled => AttemptEnd::Cancelled,
            CaptureEnd::Failed(reason) => AttemptEnd::SourceFailed(reason),
        }
    }

    /// Feeds buffered frames to the encoder in order until the buffer is
    /// closed and drained, or the encoder rejects a frame. Once stopping,
    /// draining is bounded by the encoder grace period.
    async fn process(
        &self,
        handle: &mut EncoderProcessHandle,
        buffer: &FrameBuffer,
    ) -> Option<AttemptEnd> {
        let mut drain_deadline: Option<tokio::time::Instant> = None;
        loop {
            if drain_deadline.is_some_and(|deadline| deadline <= tokio::time::Instant::now()) {
                return Some(AttemptEnd::Cancelled);
            }
            let Some(frame) = buffer.get(self.config.buffer_timeout).await else {
                if buffer.is_finished() {
                    return None;
                }
                continue;
            };

            let annotated = self.annotation.annotate(frame).await;
            let Some(fed) = self.feed(handle, &annotated, &mut drain_deadline).await else {
                log::warn!(
                    "pipeline: encoder did not accept frames within {:?} of stop",
                    self.config.encoder_grace
                );
                return Some(AttemptEnd::Cancelled);
            };
            match fed {
                Ok(()) => self.stats.frame_encoded(),
                Err(e @ FeedError::Closed(_)) => return Some(AttemptEnd::SinkClosed(e.to_string())),
                Err(e @ FeedError::GeometryMismatch { .. }) => {
                    return Some(AttemptEnd::Fatal(e.to_string()));
                }
            }
        }
    }

    /// Writes one frame. A write in flight when the session is cancelled is
    /// not interrupted, but from then on every write must finish before
    /// `drain_deadline`; `None` once it passes.
    async fn feed(
        &self,
        handle: &mut EncoderProcessHandle,
        frame: &Frame,
        drain_deadline: &mut Option<tokio::time::Instant>,
    ) -> Option<Result<(), FeedError>> {
        let feed = self.sink.feed(handle, frame);
        tokio::pin!(feed);

        if drain_deadline.is_none() {
            tokio::select! {
                fed = &mut feed => return Some(fed),
                _ = self.cancel.cancelled() => {
                    *drain_deadline = Some(tokio::time::Instant::now() + self.config.encoder_grace);
                }
            }
        }
        let deadline = (*drain_deadline)?;
        tokio::time::timeout_at(deadline, feed).await.ok()
    }
}

fn capture(
    source: &SharedSource,
    buffer: &FrameBuffer,
    cancel: &CancellationToken,
    stats: &PipelineStats,
    pacing: Option<Duration>,
) -> CaptureEnd {
    let mut source = lock(source);
    let mut next_due = Instant::now();

    let end = loop {
        if cancel.is_cancelled() {
            break CaptureEnd::Cancelled;
        }
        match source.read_frame() {
            Ok(frame) => {
                stats.frame_captured();
                if !buffer.try_put(frame) {
                    let dropped = stats.frame_dropped();
                    if dropped % 100 == 1 {
                        log::warn!("pipeline: buffer full, {} frames dropped so far", dropped);
                    }
                }
            }
            Err(SourceError::EndOfStream) => break CaptureEnd::EndOfStream,
            Err(e) => break CaptureEnd::Failed(e.to_string()),
        }

        if let Some(interval) = pacing {
            next_due += interval;
            let now = Instant::now();
            if next_due > now {
                std::thread::sleep(next_due - now);
            } else {
                next_due = now;
            }
        }
    };

    buffer.close();
    end
}

fn lock(source: &SharedSource) -> MutexGuard<'_, Box<dyn FrameSource>> {
    source.lock().unwrap_or_else(PoisonError::into_inner)
}
