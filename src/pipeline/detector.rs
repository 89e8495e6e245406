use std::time::Duration;

use async_trait::async_trait;
use frame_bus::frame::{Frame, PixelLayout};
use jpeg_encoder::{ColorType, Encoder};
use serde::{Deserialize, Serialize};

/// One detected object. `bbox` is `[x1, y1, x2, y2]` in frame pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    pub bbox: [f32; 4],
}

/// The object-detection capability, one image in, detections out.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, frame: &Frame) -> anyhow::Result<Vec<Detection>>;
}

/// Used when no detector is configured: frames pass through untouched.
pub struct PassthroughDetector;

#[async_trait]
impl Detector for PassthroughDetector {
    async fn detect(&self, _frame: &Frame) -> anyhow::Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

/// Posts each frame as a JPEG to a detection service answering
/// `{"detections": [{"label", "score", "bbox"}]}`.
pub struct HttpDetector {
    client: reqwest::Client,
    url: String,
    quality: u8,
}

impl HttpDetector {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            quality: 85,
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, frame: &Frame) -> anyhow::Result<Vec<Detection>> {
        let quality = self.quality;
        let owned = frame.clone();
        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&owned, quality)).await??;

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()
            .await?
            .error_for_status()?
            .json::<DetectResponse>()
            .await?;
        Ok(response.detections)
    }
}

pub fn encode_jpeg(frame: &Frame, quality: u8) -> anyhow::Result<Vec<u8>> {
    let width = u16::try_from(frame.width())
        .map_err(|_| anyhow::anyhow!("frame too wide for jpeg: {}", frame.width()))?;
    let height = u16::try_from(frame.height())
        .map_err(|_| anyhow::anyhow!("frame too tall for jpeg: {}", frame.height()))?;
    let color = match frame.layout() {
        PixelLayout::Rgb24 => ColorType::Rgb,
        PixelLayout::Bgr24 => ColorType::Bgr,
    };

    let mut jpeg = Vec::new();
    Encoder::new(&mut jpeg, quality)
        .encode(frame.data(), width, height, color)
        .map_err(|e| anyhow::anyhow!("jpeg encode failed: {}", e))?;
    Ok(jpeg)
}
