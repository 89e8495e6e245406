use ffmpeg_next::{
    format::Pixel,
    frame::Video,
    software::scaling::{Context, Flags},
};

use crate::frame::{Geometry, PixelLayout};

/// Converts decoded frames of any format/size into packed pixels of one
/// fixed output geometry. The software context is rebuilt if the decoded
/// stream changes size or format mid-stream.
pub struct Scaler {
    context: Option<Context>,
    input: Option<(Pixel, u32, u32)>,
    output: Geometry,
}

impl Scaler {
    pub fn new(output: Geometry) -> Self {
        Self {
            context: None,
            input: None,
            output,
        }
    }

    pub fn output(&self) -> Geometry {
        self.output
    }

    /// Scales `frame` and returns exactly `output.frame_len()` bytes.
    pub fn to_packed(&mut self, frame: &Video) -> anyhow::Result<Vec<u8>> {
        let input = (frame.format(), frame.width(), frame.height());
        if self.input != Some(input) || self.context.is_none() {
            let context = Context::get(
                input.0,
                input.1,
                input.2,
                layout_pixel(self.output.layout),
                self.output.width,
                self.output.height,
                Flags::BILINEAR,
            )?;
            self.context = Some(context);
            self.input = Some(input);
        }
        let context = self
            .context
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("scaler context missing"))?;

        let mut scaled = Video::empty();
        context.run(frame, &mut scaled)?;

        let row_len = self.output.width as usize * self.output.layout.bytes_per_pixel();
        let stride = scaled.stride(0);
        let plane = scaled.data(0);
        let mut packed = Vec::with_capacity(self.output.frame_len());
        for row in 0..self.output.height as usize {
            let start = row * stride;
            packed.extend_from_slice(&plane[start..start + row_len]);
        }
        Ok(packed)
    }
}

fn layout_pixel(layout: PixelLayout) -> Pixel {
    match layout {
        PixelLayout::Rgb24 => Pixel::RGB24,
        PixelLayout::Bgr24 => Pixel::BGR24,
    }
}

unsafe impl Send for Scaler {}
