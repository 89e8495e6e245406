use std::{
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::frame::Frame;

pub const DEFAULT_CAPACITY: usize = 100;

/// Bounded FIFO between the capture unit and the processing unit.
///
/// `try_put` never blocks: when the queue is full the incoming frame is
/// dropped and counted. `get` waits at most `timeout`. Once `close` is called
/// the remaining frames can still be drained.
pub struct FrameBuffer {
    writer: Mutex<Option<mpsc::Sender<Frame>>>,
    inner: tokio::sync::Mutex<mpsc::Receiver<Frame>>,
    capacity: usize,
    queued: AtomicUsize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (writer, receiver) = mpsc::channel(capacity);
        Self {
            writer: Mutex::new(Some(writer)),
            inner: tokio::sync::Mutex::new(receiver),
            capacity,
            queued: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns false when the frame was not queued (buffer full or closed).
    pub fn try_put(&self, frame: Frame) -> bool {
        let guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(writer) = guard.as_ref() else {
            return false;
        };
        // count before sending so a fast consumer never sees the counter underflow
        self.queued.fetch_add(1, Ordering::SeqCst);
        match writer.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                false
            }
        }
    }

    /// Next frame in production order, or `None` on timeout or once the
    /// buffer is closed and empty.
    pub async fn get(&self, timeout: Duration) -> Option<Frame> {
        let mut receiver = self.inner.lock().await;
        match tokio::time::timeout(timeout, receiver.recv()).await {
            Ok(Some(frame)) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                Some(frame)
            }
            Ok(None) | Err(_) => None,
        }
    }

    /// Stops accepting frames. Frames already queued stay available to `get`.
    pub fn close(&self) {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(writer);
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closed and fully drained.
    pub fn is_finished(&self) -> bool {
        self.is_closed() && self.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "buffer_test.rs"]
mod buffer_test;
