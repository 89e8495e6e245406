use std::time::Duration;

use thiserror::Error;

use crate::frame::{Frame, PixelLayout, StreamInfo};

/// Output shape requested from a source. Unset fields are taken from the
/// origin, falling back to 640x480 and the per-kind frame rate.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub layout: PixelLayout,
    /// I/O timeout for live origins, so a silent peer surfaces as a read error.
    pub read_timeout: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            fps: None,
            layout: PixelLayout::Rgb24,
            read_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open video source {locator:?}: {reason}")]
    Open { locator: String, reason: String },
    /// Normal end of a finite source.
    #[error("end of stream")]
    EndOfStream,
    /// Transient failure; the caller closes and reopens the source.
    #[error("read failed: {0}")]
    Read(String),
    #[error("source is not open")]
    NotOpen,
}

/// A decodable video origin.
///
/// One instance lives for a whole streaming session and may be closed and
/// reopened on reconnect. Sequence numbers keep increasing across reopens.
/// Calls block, so the pipeline drives sources from the blocking pool.
pub trait FrameSource: Send {
    fn open(&mut self, locator: &str) -> Result<StreamInfo, SourceError>;

    fn read_frame(&mut self) -> Result<Frame, SourceError>;

    fn close(&mut self);
}
