use super::preprocess::Preprocessor;
use super::types::{Matte, SegmentationModel};
use anyhow::{Context, Result};
use image::RgbImage;
use ort::{GraphOptimizationLevel, Session};
use std::path::Path;

/// Portrait segmentation model (single-frame selfie matting).
///
/// Expects an ONNX graph taking one [1, 3, H, W] RGB tensor in [0, 1] and
/// producing a [1, 1, H, W] alpha matte.
pub struct PortraitMatting {
    session: Session,
    preprocessor: Preprocessor,
    width: u32,
    height: u32,
}

impl PortraitMatting {
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading portrait model from {}", path.display());

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        tracing::info!("Portrait model loaded ({}x{} input)", width, height);

        Ok(Self {
            session,
            preprocessor: Preprocessor::new(width, height),
            width,
            height,
        })
    }
}

impl SegmentationModel for PortraitMatting {
    fn segment(&mut self, frame: &RgbImage) -> Result<Matte> {
        let _span = tracing::debug_span!("portrait_segment").entered();

        let input = self.preprocessor.preprocess(frame)?;

        let outputs = self
            .session
            .run(ort::inputs![input.view()]?)
            .context("Failed to run inference")?;

        let matte = outputs[0].try_extract_tensor::<f32>()?;
        Ok(matte.iter().copied().collect())
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
