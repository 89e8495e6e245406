/// Registers FFmpeg components (formats, devices). Call once at startup
/// before opening capture devices such as v4l2.
#[cfg(feature = "ffmpeg")]
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

#[cfg(not(feature = "ffmpeg"))]
pub fn init() -> anyhow::Result<()> {
    Ok(())
}

pub mod buffer;
pub mod encoder;
pub mod frame;
#[cfg(feature = "ffmpeg")]
pub mod input;
pub mod output;
pub mod process;
#[cfg(feature = "ffmpeg")]
pub mod scaler;
pub mod source;
