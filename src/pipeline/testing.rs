//! In-process doubles for the source, the encoder and the backend.

use std::{
    collections::VecDeque,
    io,
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use frame_bus::{
    encoder::{EncoderLauncher, EncoderProcess},
    frame::{Frame, Geometry, PixelLayout, SourceKind, StreamInfo},
    output::Destination,
    source::{FrameSource, SourceError},
};

use super::{
    Backend,
    controller::ConfigLoader,
    detector::{Detector, PassthroughDetector},
};
use crate::config::{OutputMode, PipelineConfig, Settings};

pub fn geometry() -> Geometry {
    Geometry::new(4, 2, PixelLayout::Rgb24)
}

#[derive(Clone, Copy, Debug)]
pub enum Step {
    Frames(u32),
    EndOfStream,
    ReadError,
}

#[derive(Default)]
struct SourceLog {
    opens: u32,
    failed_opens: u32,
    closes: u32,
    produced: Vec<u64>,
}

/// Plays `steps` in order, then produces frames forever with a short delay.
#[derive(Clone)]
pub struct ScriptedSource {
    steps: Arc<Mutex<VecDeque<Step>>>,
    log: Arc<Mutex<SourceLog>>,
    open_failures: u32,
    kind: SourceKind,
    reported: Geometry,
    actual: Geometry,
    next_seq: u64,
    opened: bool,
}

impl ScriptedSource {
    pub fn live(steps: &[Step]) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.iter().copied().collect())),
            log: Arc::default(),
            open_failures: 0,
            kind: SourceKind::Live,
            reported: geometry(),
            actual: geometry(),
            next_seq: 0,
            opened: false,
        }
    }

    pub fn finite(steps: &[Step]) -> Self {
        Self {
            kind: SourceKind::Finite,
            ..Self::live(steps)
        }
    }

    pub fn failing_opens(mut self, count: u32) -> Self {
        self.open_failures = count;
        self
    }

    /// Frames come out with `actual` geometry while `open` reports another.
    pub fn with_actual_geometry(mut self, actual: Geometry) -> Self {
        self.actual = actual;
        self
    }

    pub fn opens(&self) -> u32 {
        self.log.lock().unwrap().opens
    }

    pub fn failed_opens(&self) -> u32 {
        self.log.lock().unwrap().failed_opens
    }

    pub fn closes(&self) -> u32 {
        self.log.lock().unwrap().closes
    }

    pub fn produced(&self) -> Vec<u64> {
        self.log.lock().unwrap().produced.clone()
    }

    fn frame(&mut self) -> Frame {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.log.lock().unwrap().produced.push(seq);
        Frame::new(vec![0u8; self.actual.frame_len()], self.actual, seq, 0).unwrap()
    }
}

impl FrameSource for ScriptedSource {
    fn open(&mut self, locator: &str) -> Result<StreamInfo, SourceError> {
        let mut log = self.log.lock().unwrap();
        if log.failed_opens < self.open_failures {
            log.failed_opens += 1;
            return Err(SourceError::Open {
                locator: locator.to_string(),
                reason: "not reachable yet".to_string(),
            });
        }
        log.opens += 1;
        self.opened = true;
        Ok(StreamInfo::new(self.reported, 200, self.kind))
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        if !self.opened {
            return Err(SourceError::NotOpen);
        }
        let step = {
            let mut steps = self.steps.lock().unwrap();
            let step = steps.pop_front();
            if let Some(Step::Frames(n)) = step {
                if n > 1 {
                    steps.push_front(Step::Frames(n - 1));
                }
            }
            step
        };
        match step {
            Some(Step::Frames(_)) => Ok(self.frame()),
            Some(Step::EndOfStream) => Err(SourceError::EndOfStream),
            Some(Step::ReadError) => Err(SourceError::Read("connection reset".to_string())),
            None => {
                std::thread::sleep(Duration::from_millis(2));
                Ok(self.frame())
            }
        }
    }

    fn close(&mut self) {
        if self.opened {
            self.opened = false;
            self.log.lock().unwrap().closes += 1;
        }
    }
}

#[derive(Default)]
struct LaunchLog {
    /// Frames written, one entry per launched process.
    processes: Vec<Vec<u64>>,
    launched_at: Vec<Instant>,
    shutdowns: usize,
}

/// Records every launched process. The n-th process accepts `limits[n]`
/// frames before its input breaks; processes past the list accept everything.
#[derive(Clone, Default)]
pub struct RecordingLauncher {
    log: Arc<Mutex<LaunchLog>>,
    limits: Vec<usize>,
    fail: bool,
    stall: bool,
}

impl RecordingLauncher {
    pub fn with_limits(limits: &[usize]) -> Self {
        Self {
            limits: limits.to_vec(),
            ..Default::default()
        }
    }

    /// The first process accepts `frames` frames, then never completes a
    /// write again, like an encoder whose destination stopped reading.
    pub fn stalling_after(frames: usize) -> Self {
        Self {
            limits: vec![frames],
            stall: true,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn launches(&self) -> usize {
        self.log.lock().unwrap().processes.len()
    }

    /// Launched processes that were not shut down.
    pub fn running(&self) -> usize {
        let log = self.log.lock().unwrap();
        log.processes.len() - log.shutdowns
    }

    pub fn launch_times(&self) -> Vec<Instant> {
        self.log.lock().unwrap().launched_at.clone()
    }

    pub fn frames(&self) -> Vec<Vec<u64>> {
        self.log.lock().unwrap().processes.clone()
    }

    pub fn total_frames(&self) -> usize {
        self.log.lock().unwrap().processes.iter().map(Vec::len).sum()
    }
}

struct RecordingProcess {
    log: Arc<Mutex<LaunchLog>>,
    index: usize,
    limit: usize,
    stall: bool,
}

#[async_trait]
impl EncoderProcess for RecordingProcess {
    async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let accepted = {
            let mut log = self.log.lock().unwrap();
            let written = &mut log.processes[self.index];
            if written.len() < self.limit {
                written.push(frame.seq());
                true
            } else {
                false
            }
        };
        if accepted {
            return Ok(());
        }
        if self.stall {
            std::future::pending::<()>().await;
        }
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
    }

    fn exit_status(&mut self) -> Option<String> {
        None
    }

    async fn shutdown(&mut self, _grace: Duration) -> anyhow::Result<()> {
        self.log.lock().unwrap().shutdowns += 1;
        Ok(())
    }
}

impl EncoderLauncher for RecordingLauncher {
    fn launch(
        &self,
        _info: &StreamInfo,
        _destination: &Destination,
    ) -> anyhow::Result<Box<dyn EncoderProcess>> {
        if self.fail {
            return Err(anyhow::anyhow!("encoder program not found"));
        }
        let mut log = self.log.lock().unwrap();
        let index = log.processes.len();
        log.processes.push(Vec::new());
        log.launched_at.push(Instant::now());
        Ok(Box::new(RecordingProcess {
            log: self.log.clone(),
            index,
            limit: self.limits.get(index).copied().unwrap_or(usize::MAX),
            stall: self.stall,
        }))
    }
}

pub struct TestBackend {
    pub source: ScriptedSource,
    pub launcher: RecordingLauncher,
}

impl Backend for TestBackend {
    fn source(&self, _config: &PipelineConfig) -> Box<dyn FrameSource> {
        Box::new(self.source.clone())
    }

    fn launcher(&self, _config: &PipelineConfig) -> Arc<dyn EncoderLauncher> {
        Arc::new(self.launcher.clone())
    }

    fn detector(&self, _config: &PipelineConfig) -> anyhow::Result<Arc<dyn Detector>> {
        Ok(Arc::new(PassthroughDetector))
    }
}

/// Settings with every delay scaled down to milliseconds.
pub fn fast_settings() -> Settings {
    Settings {
        source: "scripted://camera".to_string(),
        reconnect_delay_secs: 0.05,
        open_poll_secs: 0.01,
        probe_timeout_secs: 0.2,
        probe_interval_secs: 0.02,
        buffer_timeout_secs: 0.02,
        encoder_grace_secs: 0.1,
        ..Default::default()
    }
}

pub fn segmented_settings(dir: &Path) -> Settings {
    Settings {
        output: OutputMode::Hls,
        hls_dir: dir.to_path_buf(),
        ..fast_settings()
    }
}

pub fn push_settings(addr: &str) -> Settings {
    Settings {
        output: OutputMode::Push,
        push_url: format!("rtmp://{}/live/test", addr),
        ..fast_settings()
    }
}

pub fn loader(settings: Settings) -> ConfigLoader {
    Arc::new(move || settings.resolve())
}
