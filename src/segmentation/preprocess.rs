use anyhow::Result;
use image::{imageops, RgbImage};
use ndarray::Array4;

use crate::frame::SegmentationMask;

/// Converts RGB frames to model input tensors and mattes back to
/// frame-sized binary masks.
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
        }
    }

    /// Resize to the model resolution, normalize to [0, 1] and lay out as
    /// NCHW. Returns shape [1, 3, height, width].
    pub fn preprocess(&self, image: &RgbImage) -> Result<Array4<f32>> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized;
        let source = if image.dimensions() == (self.target_width, self.target_height) {
            image
        } else {
            // Triangle is cheap and good enough for a model input.
            resized = imageops::resize(
                image,
                self.target_width,
                self.target_height,
                imageops::FilterType::Triangle,
            );
            &resized
        };

        let (width, height) = source.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        for (x, y, pixel) in source.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }

        Ok(tensor)
    }

    /// Resize a matte to frame dimensions and binarize it at `cutoff`
    /// into a per-pixel foreground mask.
    pub fn matte_to_mask(
        matte: &[f32],
        matte_width: u32,
        matte_height: u32,
        frame_width: u32,
        frame_height: u32,
        cutoff: f32,
    ) -> Result<SegmentationMask> {
        let _span = tracing::debug_span!("matte_to_mask").entered();

        if matte_width == frame_width && matte_height == frame_height {
            let data = matte.iter().map(|&v| (v > cutoff) as u8).collect();
            return Ok(SegmentationMask::new(data, frame_width, frame_height));
        }

        let gray = image::GrayImage::from_fn(matte_width, matte_height, |x, y| {
            let idx = (y * matte_width + x) as usize;
            image::Luma([(matte[idx] * 255.0).clamp(0.0, 255.0) as u8])
        });

        let resized = imageops::resize(
            &gray,
            frame_width,
            frame_height,
            imageops::FilterType::Triangle,
        );

        let cutoff_byte = (cutoff * 255.0).clamp(0.0, 255.0) as u8;
        let data = resized.pixels().map(|p| (p[0] > cutoff_byte) as u8).collect();

        Ok(SegmentationMask::new(data, frame_width, frame_height))
    }
}
