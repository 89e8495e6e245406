use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context as _;
use frame_bus::{
    output::{Destination, PushOutput, SegmentedOutput},
    process::EncoderSettings,
    source::SourceOptions,
};
use serde::Deserialize;

pub const ENV_PREFIX: &str = "DETECT_STREAM_";
pub const CONFIG_FILE_ENV: &str = "DETECT_STREAM_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "detect-stream.json";
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
pub const DEFAULT_SOURCE: &str =
    "https://ai-search-video.s3.us-east-1.amazonaws.com/ai_search_videos/Vid.mp4";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Hls,
    Push,
}

impl FromStr for OutputMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hls" | "segmented" => Ok(OutputMode::Hls),
            "push" | "rtmp" => Ok(OutputMode::Push),
            other => Err(anyhow::anyhow!("unknown output mode {:?}", other)),
        }
    }
}

/// Flat key/value settings as they appear in the JSON file. Durations are
/// seconds and may be fractional.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub source: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub output: OutputMode,
    pub hls_dir: PathBuf,
    pub hls_manifest: String,
    pub hls_segments: u32,
    pub hls_segment_secs: u32,
    pub push_url: String,
    pub push_host: Option<String>,
    pub push_port: Option<u16>,
    pub reconnect_delay_secs: f64,
    pub open_poll_secs: f64,
    pub probe_timeout_secs: f64,
    pub probe_interval_secs: f64,
    pub buffer_capacity: usize,
    pub buffer_timeout_secs: f64,
    pub encoder: String,
    pub encoder_preset: String,
    pub encoder_grace_secs: f64,
    pub detector_url: Option<String>,
    pub listen: String,
}

impl Default for Settings {
    fn default() -> Self {
        let segmented = SegmentedOutput::default();
        let encoder = EncoderSettings::default();
        Self {
            source: DEFAULT_SOURCE.to_string(),
            width: None,
            height: None,
            fps: None,
            output: OutputMode::Hls,
            hls_dir: segmented.dir,
            hls_manifest: segmented.manifest,
            hls_segments: segmented.segment_count,
            hls_segment_secs: segmented.segment_secs,
            push_url: "rtmp://127.0.0.1:1935/live/stream".to_string(),
            push_host: None,
            push_port: None,
            reconnect_delay_secs: 3.0,
            open_poll_secs: 1.0,
            probe_timeout_secs: 30.0,
            probe_interval_secs: 1.0,
            buffer_capacity: frame_bus::buffer::DEFAULT_CAPACITY,
            buffer_timeout_secs: 1.0,
            encoder: encoder.program,
            encoder_preset: encoder.preset,
            encoder_grace_secs: 5.0,
            detector_url: None,
            listen: DEFAULT_LISTEN.to_string(),
        }
    }
}

impl Settings {
    /// Applies `DETECT_STREAM_*` overrides found through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, key))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("SOURCE") {
            self.source = v;
        }
        parse_into(get("WIDTH"), "WIDTH", |v| self.width = Some(v))?;
        parse_into(get("HEIGHT"), "HEIGHT", |v| self.height = Some(v))?;
        parse_into(get("FPS"), "FPS", |v| self.fps = Some(v))?;
        parse_into(get("OUTPUT"), "OUTPUT", |v| self.output = v)?;
        if let Some(v) = get("HLS_DIR") {
            self.hls_dir = PathBuf::from(v);
        }
        if let Some(v) = get("HLS_MANIFEST") {
            self.hls_manifest = v;
        }
        parse_into(get("HLS_SEGMENTS"), "HLS_SEGMENTS", |v| self.hls_segments = v)?;
        parse_into(get("HLS_SEGMENT_SECS"), "HLS_SEGMENT_SECS", |v| {
            self.hls_segment_secs = v
        })?;
        if let Some(v) = get("PUSH_URL") {
            self.push_url = v;
        }
        if let Some(v) = get("PUSH_HOST") {
            self.push_host = Some(v);
        }
        parse_into(get("PUSH_PORT"), "PUSH_PORT", |v| self.push_port = Some(v))?;
        parse_into(get("RECONNECT_DELAY_SECS"), "RECONNECT_DELAY_SECS", |v| {
            self.reconnect_delay_secs = v
        })?;
        parse_into(get("OPEN_POLL_SECS"), "OPEN_POLL_SECS", |v| {
            self.open_poll_secs = v
        })?;
        parse_into(get("PROBE_TIMEOUT_SECS"), "PROBE_TIMEOUT_SECS", |v| {
            self.probe_timeout_secs = v
        })?;
        parse_into(get("PROBE_INTERVAL_SECS"), "PROBE_INTERVAL_SECS", |v| {
            self.probe_interval_secs = v
        })?;
        parse_into(get("BUFFER_CAPACITY"), "BUFFER_CAPACITY", |v| {
            self.buffer_capacity = v
        })?;
        parse_into(get("BUFFER_TIMEOUT_SECS"), "BUFFER_TIMEOUT_SECS", |v| {
            self.buffer_timeout_secs = v
        })?;
        if let Some(v) = get("ENCODER") {
            self.encoder = v;
        }
        if let Some(v) = get("ENCODER_PRESET") {
            self.encoder_preset = v;
        }
        parse_into(get("ENCODER_GRACE_SECS"), "ENCODER_GRACE_SECS", |v| {
            self.encoder_grace_secs = v
        })?;
        if let Some(v) = get("DETECTOR_URL") {
            self.detector_url = Some(v);
        }
        if let Some(v) = get("LISTEN") {
            self.listen = v;
        }
        Ok(())
    }

    pub fn resolve(&self) -> anyhow::Result<PipelineConfig> {
        if self.source.trim().is_empty() {
            return Err(anyhow::anyhow!("source must not be empty"));
        }
        let destination = match self.output {
            OutputMode::Hls => {
                if self.hls_manifest.is_empty() || self.hls_segments == 0 || self.hls_segment_secs == 0
                {
                    return Err(anyhow::anyhow!(
                        "hls output needs a manifest name, a segment count and a segment duration"
                    ));
                }
                Destination::Segmented(SegmentedOutput {
                    dir: self.hls_dir.clone(),
                    manifest: self.hls_manifest.clone(),
                    segment_count: self.hls_segments,
                    segment_secs: self.hls_segment_secs,
                })
            }
            OutputMode::Push => {
                let mut push = PushOutput::from_url(&self.push_url)?;
                if let Some(host) = &self.push_host {
                    push.probe_host = host.clone();
                }
                if let Some(port) = self.push_port {
                    push.probe_port = port;
                }
                Destination::Push(push)
            }
        };
        if self.buffer_capacity == 0 {
            return Err(anyhow::anyhow!("buffer_capacity must be at least 1"));
        }

        let probe_interval = seconds("probe_interval_secs", self.probe_interval_secs)?;
        let open_poll = seconds("open_poll_secs", self.open_poll_secs)?;
        if probe_interval.is_zero() || open_poll.is_zero() {
            return Err(anyhow::anyhow!("poll intervals must be positive"));
        }

        Ok(PipelineConfig {
            source: self.source.clone(),
            source_options: SourceOptions {
                width: self.width,
                height: self.height,
                fps: self.fps,
                ..Default::default()
            },
            destination,
            hls_dir: self.hls_dir.clone(),
            reconnect_delay: seconds("reconnect_delay_secs", self.reconnect_delay_secs)?,
            open_poll,
            probe_timeout: seconds("probe_timeout_secs", self.probe_timeout_secs)?,
            probe_interval,
            buffer_capacity: self.buffer_capacity,
            buffer_timeout: seconds("buffer_timeout_secs", self.buffer_timeout_secs)?,
            encoder: EncoderSettings {
                program: self.encoder.clone(),
                preset: self.encoder_preset.clone(),
                ..Default::default()
            },
            encoder_grace: seconds("encoder_grace_secs", self.encoder_grace_secs)?,
            detector_url: self.detector_url.clone(),
            listen: self.listen.clone(),
        })
    }
}

/// Everything one streaming session needs, fixed for the session's lifetime.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub source: String,
    pub source_options: SourceOptions,
    pub destination: Destination,
    /// Directory served under `/hls`, whatever the output mode.
    pub hls_dir: PathBuf,
    pub reconnect_delay: Duration,
    pub open_poll: Duration,
    pub probe_timeout: Duration,
    pub probe_interval: Duration,
    pub buffer_capacity: usize,
    pub buffer_timeout: Duration,
    pub encoder: EncoderSettings,
    pub encoder_grace: Duration,
    pub detector_url: Option<String>,
    pub listen: String,
}

/// Reads the configuration from the optional JSON file and the process
/// environment. Called on every start.
pub fn load() -> anyhow::Result<PipelineConfig> {
    from_lookup(|key| std::env::var(key).ok())
}

pub fn from_lookup<F>(lookup: F) -> anyhow::Result<PipelineConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut settings = match lookup(CONFIG_FILE_ENV) {
        Some(path) => read_file(Path::new(&path))?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            read_file(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => Settings::default(),
    };
    settings.apply_env(lookup)?;
    settings.resolve()
}

pub fn read_file(path: &Path) -> anyhow::Result<Settings> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid config file {}", path.display()))
}

fn parse_into<T, F>(value: Option<String>, key: &str, mut set: F) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(T),
{
    if let Some(value) = value {
        let parsed = value
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {}{}={:?}: {}", ENV_PREFIX, key, value, e))?;
        set(parsed);
    }
    Ok(())
}

fn seconds(key: &str, value: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| anyhow::anyhow!("{} must be a non-negative number, got {}", key, value))
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
