use std::{io, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::AsyncWriteExt as _,
    process::{Child, ChildStdin, Command},
};

use crate::{
    encoder::{EncoderLauncher, EncoderProcess},
    frame::{Frame, StreamInfo},
    output::Destination,
};

#[derive(Clone, Debug)]
pub struct EncoderSettings {
    /// Executable to spawn, resolved through PATH.
    pub program: String,
    pub codec: String,
    pub preset: String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
        }
    }
}

/// Command line for an encoder reading raw frames from stdin.
pub fn encoder_args(
    info: &StreamInfo,
    destination: &Destination,
    settings: &EncoderSettings,
) -> Vec<String> {
    let fps = info.fps.to_string();
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-y",
        "-f",
        "rawvideo",
        "-pix_fmt",
        info.geometry.layout.ffmpeg_name(),
        "-s",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("{}x{}", info.width(), info.height()));
    args.extend(["-r".to_string(), fps.clone(), "-i".to_string(), "-".to_string()]);

    args.extend(
        [
            "-c:v",
            settings.codec.as_str(),
            "-preset",
            settings.preset.as_str(),
            "-tune",
            "zerolatency",
            "-g",
            fps.as_str(),
            "-fflags",
            "nobuffer",
            "-flags",
            "low_delay",
            "-pix_fmt",
            "yuv420p",
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    match destination {
        Destination::Segmented(out) => {
            args.extend([
                "-f".to_string(),
                "hls".to_string(),
                "-hls_time".to_string(),
                out.segment_secs.to_string(),
                "-hls_list_size".to_string(),
                out.segment_count.to_string(),
                "-hls_flags".to_string(),
                "delete_segments+append_list+temp_file".to_string(),
                out.manifest_path().to_string_lossy().into_owned(),
            ]);
        }
        Destination::Push(out) => {
            let format = out.format();
            args.extend(["-f".to_string(), format.to_string()]);
            if format == "rtsp" {
                args.extend(["-rtsp_transport".to_string(), "tcp".to_string()]);
            }
            args.push(out.url.clone());
        }
    }
    args
}

/// Launches the encoder program as a child process.
pub struct FfmpegEncoder {
    settings: EncoderSettings,
}

impl FfmpegEncoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self { settings }
    }
}

impl EncoderLauncher for FfmpegEncoder {
    fn launch(
        &self,
        info: &StreamInfo,
        destination: &Destination,
    ) -> anyhow::Result<Box<dyn EncoderProcess>> {
        let args = encoder_args(info, destination, &self.settings);
        log::debug!("encoder: {} {}", self.settings.program, args.join(" "));

        let mut child = Command::new(&self.settings.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("spawn {}: {}", self.settings.program, e))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to capture encoder stdin"))?;

        Ok(Box::new(FfmpegProcess {
            child,
            stdin: Some(stdin),
        }))
    }
}

struct FfmpegProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl EncoderProcess for FfmpegProcess {
    async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "encoder stdin closed"))?;
        stdin.write_all(frame.data()).await
    }

    fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(e.to_string()),
        }
    }

    async fn shutdown(&mut self, grace: Duration) -> anyhow::Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            // EOF lets the encoder flush the last segment and exit
            let _ = tokio::time::timeout(grace, stdin.shutdown()).await;
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                log::debug!("encoder: exited with {}", status);
            }
            Err(_) => {
                log::warn!("encoder: no exit within {:?}, killing", grace);
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}
