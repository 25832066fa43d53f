mod engine;
mod portrait;
mod preprocess;
pub mod types;

pub use engine::SegmentationEngine;
pub use portrait::PortraitMatting;
pub use types::SegmentationModel;

use anyhow::Result;

use crate::config::PipelineConfig;

/// Create the default local segmentation model.
pub fn create_default_model(
    model_path: &str,
    config: &PipelineConfig,
) -> Result<Box<dyn SegmentationModel>> {
    let (width, height) = config.model_input;
    let model = PortraitMatting::new(model_path, width, height)?;
    Ok(Box::new(model))
}
