use std::sync::Arc;

use frame_bus::frame::{Frame, FrameError, PixelLayout};

use super::{
    detector::{Detection, Detector},
    stats::PipelineStats,
};

const LINE_WIDTH: i64 = 2;

const PALETTE: [[u8; 3]; 6] = [
    [0, 255, 0],
    [255, 64, 64],
    [64, 160, 255],
    [255, 200, 0],
    [255, 0, 255],
    [0, 255, 255],
];

/// Hands each frame to the detector and renders the boxes it returns.
///
/// A failed detection never stops the stream: the frame is passed on
/// unannotated and the failure is counted.
pub struct AnnotationStage {
    detector: Arc<dyn Detector>,
    stats: Arc<PipelineStats>,
}

impl AnnotationStage {
    pub fn new(detector: Arc<dyn Detector>, stats: Arc<PipelineStats>) -> Self {
        Self { detector, stats }
    }

    pub async fn annotate(&self, frame: Frame) -> Frame {
        let detections = match self.detector.detect(&frame).await {
            Ok(detections) => detections,
            Err(e) => {
                self.failed(frame.seq(), &format!("{:#}", e));
                return frame;
            }
        };
        if detections.is_empty() {
            return frame;
        }

        let source = frame.clone();
        match tokio::task::spawn_blocking(move || render(&source, &detections)).await {
            Ok(Ok(annotated)) => annotated,
            Ok(Err(e)) => {
                self.failed(frame.seq(), &e.to_string());
                frame
            }
            Err(e) => {
                self.failed(frame.seq(), &e.to_string());
                frame
            }
        }
    }

    fn failed(&self, seq: u64, reason: &str) {
        self.stats.annotation_failed();
        log::warn!("annotate: frame {} passed through: {}", seq, reason);
    }
}

/// Returns a copy of `frame` with one rectangle outline per detection.
pub fn render(frame: &Frame, detections: &[Detection]) -> Result<Frame, FrameError> {
    let mut pixels = frame.data().to_vec();
    let width = frame.width() as i64;
    let height = frame.height() as i64;

    for detection in detections {
        let [x1, y1, x2, y2] = detection.bbox;
        if !(x1.is_finite() && y1.is_finite() && x2.is_finite() && y2.is_finite()) {
            continue;
        }
        let clamp_x = |v: f32| (v.round() as i64).clamp(0, width - 1);
        let clamp_y = |v: f32| (v.round() as i64).clamp(0, height - 1);
        let (left, right) = (clamp_x(x1.min(x2)), clamp_x(x1.max(x2)));
        let (top, bottom) = (clamp_y(y1.min(y2)), clamp_y(y1.max(y2)));

        let color = channel_order(color_for(&detection.label), frame.layout());
        let mut paint = |from_x: i64, from_y: i64, to_x: i64, to_y: i64| {
            for y in from_y.max(0)..=to_y.min(height - 1) {
                for x in from_x.max(0)..=to_x.min(width - 1) {
                    let offset = ((y * width + x) * 3) as usize;
                    pixels[offset..offset + 3].copy_from_slice(&color);
                }
            }
        };
        let t = LINE_WIDTH - 1;
        paint(left, top, right, top + t);
        paint(left, bottom - t, right, bottom);
        paint(left, top, left + t, bottom);
        paint(right - t, top, right, bottom);
    }

    frame.with_data(pixels)
}

fn color_for(label: &str) -> [u8; 3] {
    let hash = label
        .bytes()
        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    PALETTE[hash % PALETTE.len()]
}

fn channel_order(rgb: [u8; 3], layout: PixelLayout) -> [u8; 3] {
    match layout {
        PixelLayout::Rgb24 => rgb,
        PixelLayout::Bgr24 => [rgb[2], rgb[1], rgb[0]],
    }
}

#[cfg(test)]
#[path = "annotate_test.rs"]
mod annotate_test;
