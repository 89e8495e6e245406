use std::{
    ffi::CString,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use ffmpeg_next::{Dictionary, Packet, codec, format, frame::Video, media};

use crate::{
    frame::{
        FALLBACK_HEIGHT, FALLBACK_WIDTH, Frame, Geometry, SourceKind, StreamInfo, device_path,
        is_network_locator,
    },
    scaler::Scaler,
    source::{FrameSource, SourceError, SourceOptions},
};

struct OpenedInput {
    input: format::context::Input,
    decoder: codec::decoder::Video,
    stream_index: usize,
    scaler: Scaler,
    info: StreamInfo,
    eof_sent: bool,
}

// The demuxer, decoder and scaler are only ever touched by the thread that
// currently owns the source.
unsafe impl Send for OpenedInput {}

/// FrameSource decoding any FFmpeg-readable locator into packed frames.
pub struct FfmpegSource {
    options: SourceOptions,
    opened: Option<OpenedInput>,
    next_seq: u64,
}

impl FfmpegSource {
    pub fn new(options: SourceOptions) -> Self {
        Self {
            options,
            opened: None,
            next_seq: 0,
        }
    }

    /// Resolve input format by name (e.g. "v4l2") via FFmpeg's av_find_input_format.
    fn find_input_format(name: &str) -> anyhow::Result<format::format::Input> {
        let cname = CString::new(name)
            .map_err(|e| anyhow::anyhow!("invalid format name {:?}: {}", name, e))?;
        let ptr = unsafe { ffmpeg_next::ffi::av_find_input_format(cname.as_ptr()) };
        if ptr.is_null() {
            return Err(anyhow::anyhow!("input format not found: {}", name));
        }
        Ok(unsafe { format::format::Input::wrap(ptr as *mut _) })
    }

    fn open_input(
        &self,
        locator: &str,
        kind: SourceKind,
    ) -> anyhow::Result<format::context::Input> {
        let mut options = Dictionary::new();
        // finite http(s) sources stall just like cameras do
        if kind == SourceKind::Live || is_network_locator(locator) {
            let micros = self.options.read_timeout.as_micros().to_string();
            options.set("rw_timeout", &micros);
        }
        let lower = locator.to_ascii_lowercase();
        if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            options.set("rtsp_transport", "tcp");
        }

        if let Some(device) = device_path(locator) {
            let fmt = Self::find_input_format("v4l2")?;
            let ctx = format::open_with(Path::new(&device), &format::Format::Input(fmt), options)?;
            return Ok(ctx.input());
        }

        Ok(format::input_with_dictionary(Path::new(locator), options)?)
    }

    fn resolve_info(
        &self,
        decoder: &codec::decoder::Video,
        rate: ffmpeg_next::Rational,
        kind: SourceKind,
    ) -> StreamInfo {
        let width = self
            .options
            .width
            .or_else(|| non_zero(decoder.width()))
            .unwrap_or(FALLBACK_WIDTH);
        let height = self
            .options
            .height
            .or_else(|| non_zero(decoder.height()))
            .unwrap_or(FALLBACK_HEIGHT);
        let fps = self
            .options
            .fps
            .or_else(|| {
                if rate.numerator() > 0 && rate.denominator() > 0 {
                    non_zero((rate.numerator() as f64 / rate.denominator() as f64).round() as u32)
                } else {
                    None
                }
            })
            .unwrap_or_else(|| kind.fallback_fps());

        // yuv420p output needs even dimensions
        let geometry = Geometry::new(even(width), even(height), self.options.layout);
        StreamInfo::new(geometry, fps, kind)
    }
}

impl FrameSource for FfmpegSource {
    fn open(&mut self, locator: &str) -> Result<StreamInfo, SourceError> {
        self.close();
        let kind = SourceKind::from_locator(locator);
        let open_error = |reason: String| SourceError::Open {
            locator: locator.to_string(),
            reason,
        };

        let input = self
            .open_input(locator, kind)
            .map_err(|e| open_error(format!("{:#}", e)))?;

        let (stream_index, rate, parameters) = {
            let stream = input
                .streams()
                .best(media::Type::Video)
                .ok_or_else(|| open_error("no video stream".to_string()))?;
            (stream.index(), stream.avg_frame_rate(), stream.parameters())
        };

        let decoder = codec::context::Context::from_parameters(parameters)
            .and_then(|ctx| ctx.decoder().video())
            .map_err(|e| open_error(e.to_string()))?;

        let info = self.resolve_info(&decoder, rate, kind);
        log::info!("source: opened {} as {}", locator, info);

        self.opened = Some(OpenedInput {
            input,
            decoder,
            stream_index,
            scaler: Scaler::new(info.geometry),
            info,
            eof_sent: false,
        });
        Ok(info)
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let opened = self.opened.as_mut().ok_or(SourceError::NotOpen)?;
        let kind = opened.info.kind;

        loop {
            let mut decoded = Video::empty();
            match opened.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    let data = opened
                        .scaler
                        .to_packed(&decoded)
                        .map_err(|e| SourceError::Read(format!("{:#}", e)))?;
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    return Frame::new(data, opened.info.geometry, seq, now_ms())
                        .map_err(|e| SourceError::Read(e.to_string()));
                }
                Err(ffmpeg_next::Error::Eof) => return Err(end_of(kind)),
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN => {}
                Err(e) => return Err(SourceError::Read(e.to_string())),
            }

            if opened.eof_sent {
                return Err(end_of(kind));
            }

            let mut packet = Packet::empty();
            match packet.read(&mut opened.input) {
                Ok(()) => {
                    if packet.stream() != opened.stream_index {
                        continue;
                    }
                    if let Err(e) = opened.decoder.send_packet(&packet) {
                        log::debug!("source: decoder rejected packet: {}", e);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => {
                    if let Err(e) = opened.decoder.send_eof() {
                        log::debug!("source: decoder send eof error: {}", e);
                    }
                    opened.eof_sent = true;
                }
                Err(e) => return Err(SourceError::Read(e.to_string())),
            }
        }
    }

    fn close(&mut self) {
        if self.opened.take().is_some() {
            log::info!("source: closed");
        }
    }
}

/// A live origin never ends on its own, running dry means the connection dropped.
fn end_of(kind: SourceKind) -> SourceError {
    match kind {
        SourceKind::Finite => SourceError::EndOfStream,
        SourceKind::Live => SourceError::Read("connection closed".to_string()),
    }
}

fn non_zero(value: u32) -> Option<u32> {
    (value > 0).then_some(value)
}

fn even(value: u32) -> u32 {
    (value & !1).max(2)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    /// Path to scripts/test.mp4 relative to the workspace root.
    fn test_mp4_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .unwrap()
            .join("scripts")
            .join("test.mp4")
    }

    #[test]
    fn test_read_before_open() {
        let mut source = FfmpegSource::new(SourceOptions::default());
        assert!(matches!(source.read_frame(), Err(SourceError::NotOpen)));
    }

    #[test]
    fn test_open_missing_file() {
        crate::init().unwrap();
        let mut source = FfmpegSource::new(SourceOptions::default());
        let err = source.open("/nonexistent/clip.mp4").unwrap_err();
        assert!(matches!(err, SourceError::Open { .. }));
    }

    #[test]
    fn test_even_dimensions() {
        assert_eq!(even(641), 640);
        assert_eq!(even(480), 480);
        assert_eq!(even(1), 2);
    }

    #[test]
    fn test_end_of_depends_on_kind() {
        assert!(matches!(end_of(SourceKind::Finite), SourceError::EndOfStream));
        assert!(matches!(end_of(SourceKind::Live), SourceError::Read(_)));
    }

    /// Requires scripts/test.mp4.
    #[test]
    fn test_decode_file_frames() {
        let input_path = test_mp4_path();
        if !input_path.exists() {
            eprintln!("skip: {} not found", input_path.display());
            return;
        }
        crate::init().unwrap();

        let mut source = FfmpegSource::new(SourceOptions {
            width: Some(320),
            height: Some(240),
            ..Default::default()
        });
        let info = source.open(&input_path.to_string_lossy()).unwrap();
        assert_eq!(info.kind, SourceKind::Finite);
        assert_eq!((info.width(), info.height()), (320, 240));

        for expected in 0..5 {
            let frame = source.read_frame().unwrap();
            assert_eq!(frame.seq(), expected);
            assert_eq!(frame.geometry(), info.geometry);
        }

        // sequence continues after reopening
        source.close();
        source.open(&input_path.to_string_lossy()).unwrap();
        assert_eq!(source.read_frame().unwrap().seq(), 5);
    }
}
