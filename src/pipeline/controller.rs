use std::{
    path::PathBuf,
    sync::{Arc, PoisonError},
};

use frame_bus::encoder::EncoderSink;
use tokio::{
    sync::{Mutex, broadcast, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::{
    Backend,
    annotate::AnnotationStage,
    session::{Session, SessionOutcome},
    state::{PipelineState, StateMachine, Transition},
    stats::{PipelineStats, StatsSnapshot},
};
use crate::config::PipelineConfig;

pub type ConfigLoader = Arc<dyn Fn() -> anyhow::Result<PipelineConfig> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyStreaming,
    /// The session could not be set up (configuration or detector).
    Failed(String),
}

struct ActiveSession {
    cancel: CancellationToken,
    task: JoinHandle<SessionOutcome>,
}

/// Owns the pipeline lifecycle. At most one session exists at a time, and a
/// new one is only spawned after the previous one has fully settled.
pub struct PipelineController {
    state: Arc<StateMachine>,
    stats: Arc<PipelineStats>,
    backend: Arc<dyn Backend>,
    loader: ConfigLoader,
    session: Mutex<Option<ActiveSession>>,
    /// Segmented output directory of the last loaded configuration.
    output_dir: std::sync::Mutex<Option<PathBuf>>,
}

impl PipelineController {
    pub fn new(backend: Arc<dyn Backend>, loader: ConfigLoader) -> Self {
        Self {
            state: Arc::new(StateMachine::new()),
            stats: Arc::new(PipelineStats::default()),
            backend,
            loader,
            session: Mutex::new(None),
            output_dir: std::sync::Mutex::new(None),
        }
    }

    /// Starts a session unless one is already streaming. Returns as soon as
    /// the session task is spawned; probing and opening happen in the task.
    pub async fn start(&self) -> StartOutcome {
        let mut session = self.session.lock().await;

        if let Some(active) = session.as_ref() {
            if !active.task.is_finished() && self.state.current().is_active() {
                return StartOutcome::AlreadyStreaming;
            }
        }
        // a finished or tearing-down session is reaped before a new one starts
        if let Some(previous) = session.take() {
            self.settle(previous).await;
        }

        let config = match (self.loader)() {
            Ok(config) => config,
            Err(e) => return self.refuse(format!("invalid configuration: {:#}", e)),
        };
        *self
            .output_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(config.hls_dir.clone());
        let detector = match self.backend.detector(&config) {
            Ok(detector) => detector,
            Err(e) => return self.refuse(format!("detector unavailable: {:#}", e)),
        };

        if let Err(e) = self.state.transition(PipelineState::Starting) {
            return self.refuse(e.to_string());
        }
        log::info!(
            "pipeline: starting {} -> {}",
            config.source,
            config.destination
        );

        let cancel = CancellationToken::new();
        let sink = EncoderSink::new(self.backend.launcher(&config), config.encoder_grace);
        let annotation = AnnotationStage::new(detector, self.stats.clone());
        let source = self.backend.source(&config);
        let task = tokio::spawn(
            Session::new(
                config,
                source,
                sink,
                annotation,
                self.state.clone(),
                self.stats.clone(),
                cancel.clone(),
            )
            .run(),
        );

        *session = Some(ActiveSession { cancel, task });
        StartOutcome::Started
    }

    /// Stops the current session and waits until its resources are released.
    /// Calling it with no session is a no-op.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        let Some(active) = session.take() else {
            return;
        };
        active.cancel.cancel();
        let _ = self.state.transition(PipelineState::Stopping);
        self.settle(active).await;
    }

    async fn settle(&self, active: ActiveSession) {
        match active.task.await {
            Ok(outcome) => log::debug!("pipeline: session ended with {:?}", outcome),
            Err(e) => {
                log::error!("pipeline: session task failed: {}", e);
                self.stats.set_error(format!("session task failed: {}", e));
                let _ = self.state.transition(PipelineState::Stopping);
                let _ = self.state.transition(PipelineState::Stopped);
            }
        }
    }

    fn refuse(&self, reason: String) -> StartOutcome {
        log::error!("pipeline: {}", reason);
        self.stats.set_error(reason.clone());
        StartOutcome::Failed(reason)
    }

    pub fn state(&self) -> PipelineState {
        self.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn transitions(&self) -> broadcast::Receiver<Transition> {
        self.state.transitions()
    }

    /// Waits until the pipeline reaches a state matching `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> PipelineState
    where
        F: Fn(PipelineState) -> bool,
    {
        self.state.wait_for(predicate).await
    }

    /// Directory the current or most recent session writes segments to.
    /// `None` until a configuration has been loaded.
    pub fn output_dir(&self) -> Option<PathBuf> {
        self.output_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod controller_test;
