use std::{io, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    frame::{Frame, Geometry, StreamInfo},
    output::{Destination, purge_artifacts},
};

#[derive(Debug, Error)]
pub enum FeedError {
    /// The encoder's input channel is gone: the process exited or the
    /// destination dropped the connection.
    #[error("encoder input closed: {0}")]
    Closed(String),
    #[error("frame geometry {actual} does not match encoder configuration {expected}")]
    GeometryMismatch { expected: Geometry, actual: Geometry },
}

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("failed to launch encoder: {0:#}")]
    Launch(anyhow::Error),
    #[error("failed to prepare output directory {path}: {source}")]
    Output { path: PathBuf, source: io::Error },
}

/// A running external encoder fed with raw frames.
#[async_trait]
pub trait EncoderProcess: Send {
    async fn write_frame(&mut self, frame: &Frame) -> io::Result<()>;

    /// Describes the exit once the process has terminated on its own.
    fn exit_status(&mut self) -> Option<String>;

    /// Closes the input channel and waits up to `grace` before killing.
    async fn shutdown(&mut self, grace: Duration) -> anyhow::Result<()>;
}

pub trait EncoderLauncher: Send + Sync {
    fn launch(
        &self,
        info: &StreamInfo,
        destination: &Destination,
    ) -> anyhow::Result<Box<dyn EncoderProcess>>;
}

/// Exclusive handle on the encoder of one session attempt.
pub struct EncoderProcessHandle {
    process: Box<dyn EncoderProcess>,
    info: StreamInfo,
    destination: Destination,
    alive: bool,
    frames: u64,
}

impl EncoderProcessHandle {
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }
}

/// Owns the encoder lifecycle: launch, feed, drain and terminate.
pub struct EncoderSink {
    launcher: Arc<dyn EncoderLauncher>,
    grace: Duration,
}

impl EncoderSink {
    pub fn new(launcher: Arc<dyn EncoderLauncher>, grace: Duration) -> Self {
        Self { launcher, grace }
    }

    /// Launches the encoder for `info`. Segmented output starts from an
    /// empty directory so the manifest never references a previous session.
    pub fn start(
        &self,
        info: &StreamInfo,
        destination: &Destination,
    ) -> Result<EncoderProcessHandle, EncoderError> {
        if let Destination::Segmented(out) = destination {
            std::fs::create_dir_all(&out.dir).map_err(|source| EncoderError::Output {
                path: out.dir.clone(),
                source,
            })?;
            purge_artifacts(&out.dir).map_err(|source| EncoderError::Output {
                path: out.dir.clone(),
                source,
            })?;
        }

        let process = self
            .launcher
            .launch(info, destination)
            .map_err(EncoderError::Launch)?;
        log::info!("encoder: started {} -> {}", info, destination);

        Ok(EncoderProcessHandle {
            process,
            info: *info,
            destination: destination.clone(),
            alive: true,
            frames: 0,
        })
    }

    /// Writes one frame's pixels to the encoder input.
    pub async fn feed(
        &self,
        handle: &mut EncoderProcessHandle,
        frame: &Frame,
    ) -> Result<(), FeedError> {
        if !handle.alive {
            return Err(FeedError::Closed("encoder already closed".to_string()));
        }
        if let Some(status) = handle.process.exit_status() {
            handle.alive = false;
            return Err(FeedError::Closed(format!("encoder exited ({})", status)));
        }
        if frame.geometry() != handle.info.geometry {
            return Err(FeedError::GeometryMismatch {
                expected: handle.info.geometry,
                actual: frame.geometry(),
            });
        }
        if let Err(e) = handle.process.write_frame(frame).await {
            handle.alive = false;
            return Err(FeedError::Closed(e.to_string()));
        }
        handle.frames += 1;
        Ok(())
    }

    /// Ends the stream, terminates the process and, for segmented output,
    /// deletes what it wrote.
    pub async fn stop(&self, mut handle: EncoderProcessHandle) {
        if let Err(e) = handle.process.shutdown(self.grace).await {
            log::warn!("encoder: shutdown error: {:#}", e);
        }
        if let Destination::Segmented(out) = &handle.destination {
            match purge_artifacts(&out.dir) {
                Ok(removed) => log::info!(
                    "encoder: removed {} artifacts from {}",
                    removed,
                    out.dir.display()
                ),
                Err(e) => log::warn!("encoder: failed to clear {}: {}", out.dir.display(), e),
            }
        }
        log::info!(
            "encoder: stopped after {} frames -> {}",
            handle.frames,
            handle.destination
        );
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
