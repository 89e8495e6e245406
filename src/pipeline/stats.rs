use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use serde::Serialize;

/// Counters shared by every session of the pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    sessions: AtomicU64,
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    annotation_failures: AtomicU64,
    frames_encoded: AtomicU64,
    reconnects: AtomicU64,
    last_error: Mutex<Option<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sessions: u64,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub annotation_failures: u64,
    pub frames_encoded: u64,
    pub reconnects: u64,
    pub last_error: Option<String>,
}

impl PipelineStats {
    pub fn session_started(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total number of dropped frames so far.
    pub fn frame_dropped(&self) -> u64 {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn annotation_failed(&self) {
        self.annotation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_encoded(&self) {
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_error(&self, error: impl Into<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.into());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions: self.sessions.load(Ordering::Relaxed),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            annotation_failures: self.annotation_failures.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_error: self.last_error(),
        }
    }
}
