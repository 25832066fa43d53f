use anyhow::Result;
use image::RgbImage;

/// Alpha matte: grayscale values where 0.0 = background, 1.0 = foreground.
/// Flattened row-major at model resolution.
pub type Matte = Vec<f32>;

/// Trait for segmentation models, so backends can be swapped (and faked
/// in tests).
pub trait SegmentationModel: Send {
    /// Process a frame and return an alpha matte at model resolution.
    fn segment(&mut self, frame: &RgbImage) -> Result<Matte>;

    /// The model's input (and matte) dimensions as (width, height).
    fn input_size(&self) -> (u32, u32);
}
