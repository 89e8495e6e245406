use std::{sync::Arc, time::Duration};

use frame_bus::{
    encoder::EncoderLauncher, input::FfmpegSource, process::FfmpegEncoder, source::FrameSource,
};

use crate::config::PipelineConfig;

pub mod annotate;
pub mod controller;
pub mod detector;
pub mod retry;
mod session;
pub mod state;
pub mod stats;
#[cfg(test)]
pub(crate) mod testing;

pub use controller::{PipelineController, StartOutcome};
pub use state::PipelineState;

use detector::{Detector, HttpDetector, PassthroughDetector};

const DETECTOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the collaborators of one session from its configuration.
pub trait Backend: Send + Sync {
    fn source(&self, config: &PipelineConfig) -> Box<dyn FrameSource>;

    fn launcher(&self, config: &PipelineConfig) -> Arc<dyn EncoderLauncher>;

    fn detector(&self, config: &PipelineConfig) -> anyhow::Result<Arc<dyn Detector>>;
}

/// FFmpeg decoding, an external encoder process and the configured detector.
pub struct FfmpegBackend;

impl Backend for FfmpegBackend {
    fn source(&self, config: &PipelineConfig) -> Box<dyn FrameSource> {
        Box::new(FfmpegSource::new(config.source_options.clone()))
    }

    fn launcher(&self, config: &PipelineConfig) -> Arc<dyn EncoderLauncher> {
        Arc::new(FfmpegEncoder::new(config.encoder.clone()))
    }

    fn detector(&self, config: &PipelineConfig) -> anyhow::Result<Arc<dyn Detector>> {
        match &config.detector_url {
            Some(url) => Ok(Arc::new(HttpDetector::new(url, DETECTOR_TIMEOUT)?)),
            None => Ok(Arc::new(PassthroughDetector)),
        }
    }
}
