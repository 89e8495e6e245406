use std::fmt::{Display, Formatter};

use bytes::Bytes;
use thiserror::Error;

/// Channel order of a packed 8-bit frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    Rgb24,
    Bgr24,
}

impl PixelLayout {
    pub fn bytes_per_pixel(&self) -> usize {
        3
    }

    /// Name understood by the encoder's `-pix_fmt` flag.
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelLayout::Rgb24 => "rgb24",
            PixelLayout::Bgr24 => "bgr24",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid frame size {width}x{height}")]
    EmptyGeometry { width: u32, height: u32 },
    #[error("frame {width}x{height} {layout:?} needs {expected} bytes, got {actual}")]
    SizeMismatch {
        width: u32,
        height: u32,
        layout: PixelLayout,
        expected: usize,
        actual: usize,
    },
}

/// Width, height and layout shared by every frame of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
}

impl Geometry {
    pub fn new(width: u32, height: u32, layout: PixelLayout) -> Self {
        Self {
            width,
            height,
            layout,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * self.layout.bytes_per_pixel()
    }
}

impl Display for Geometry {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}x{} {}", self.width, self.height, self.layout.ffmpeg_name())
    }
}

/// Packed pixel buffer produced by a source. The byte length is checked
/// against the geometry when the frame is built, so later stages can rely on it.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Bytes,
    geometry: Geometry,
    seq: u64,
    timestamp_ms: i64,
}

impl Frame {
    pub fn new(
        data: impl Into<Bytes>,
        geometry: Geometry,
        seq: u64,
        timestamp_ms: i64,
    ) -> Result<Self, FrameError> {
        let data = data.into();
        if geometry.width == 0 || geometry.height == 0 {
            return Err(FrameError::EmptyGeometry {
                width: geometry.width,
                height: geometry.height,
            });
        }
        let expected = geometry.frame_len();
        if data.len() != expected {
            return Err(FrameError::SizeMismatch {
                width: geometry.width,
                height: geometry.height,
                layout: geometry.layout,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            geometry,
            seq,
            timestamp_ms,
        })
    }

    /// Same frame identity with new pixels, e.g. after annotation.
    pub fn with_data(&self, data: impl Into<Bytes>) -> Result<Self, FrameError> {
        Self::new(data, self.geometry, self.seq, self.timestamp_ms)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    pub fn layout(&self) -> PixelLayout {
        self.geometry.layout
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Frame {{ seq: {}, geometry: {}, data: {} }}",
            self.seq,
            self.geometry,
            self.data.len()
        )
    }
}

/// Finite sources end; live sources are expected to run until stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Finite,
    Live,
}

impl SourceKind {
    pub fn from_locator(locator: &str) -> Self {
        const LIVE_SCHEMES: [&str; 6] = ["rtsp://", "rtsps://", "rtmp://", "udp://", "srt://", "tcp://"];
        let lower = locator.to_ascii_lowercase();
        if LIVE_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
            return SourceKind::Live;
        }
        if device_path(locator).is_some() {
            return SourceKind::Live;
        }
        SourceKind::Finite
    }

    /// Frame rate assumed when the origin does not report one.
    pub fn fallback_fps(&self) -> u32 {
        match self {
            SourceKind::Finite => 30,
            SourceKind::Live => 15,
        }
    }
}

/// Locators read over a network connection (anything with a scheme other
/// than `file://`). Reads on these can stall and need a timeout.
pub fn is_network_locator(locator: &str) -> bool {
    match locator.split_once("://") {
        Some((scheme, _)) => !scheme.is_empty() && !scheme.eq_ignore_ascii_case("file"),
        None => false,
    }
}

/// Maps a capture device locator (`/dev/video2` or a bare `2`) to its device path.
pub fn device_path(locator: &str) -> Option<String> {
    if locator.starts_with("/dev/video") {
        return Some(locator.to_string());
    }
    locator
        .parse::<u32>()
        .ok()
        .map(|index| format!("/dev/video{}", index))
}

pub const FALLBACK_WIDTH: u32 = 640;
pub const FALLBACK_HEIGHT: u32 = 480;

/// What a source reports once opened. Dimensions may be fallbacks, the
/// encoder is configured from them before the first frame arrives.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamInfo {
    pub geometry: Geometry,
    pub fps: u32,
    pub kind: SourceKind,
}

impl StreamInfo {
    pub fn new(geometry: Geometry, fps: u32, kind: SourceKind) -> Self {
        Self {
            geometry,
            fps: fps.max(1),
            kind,
        }
    }

    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.geometry.height
    }
}

impl Display for StreamInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{} @ {}fps ({:?})", self.geometry, self.fps, self.kind)
    }
}
