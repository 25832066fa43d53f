use super::{acquire_with_retry, CaptureSource};
use anyhow::{Context, Result};
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;

use crate::config::PipelineConfig;
use crate::error::CaptureError;

/// Constraint-degradation ladder: preferred resolution first, then the
/// device's best native format, then anything nokhwa can decode.
fn constraint_ladder(width: u32, height: u32) -> [RequestedFormat<'static>; 3] {
    [
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(CameraFormat::new(
            Resolution::new(width, height),
            FrameFormat::MJPEG,
            30,
        ))),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestResolution),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
    ]
}

pub struct WebcamCapture {
    camera: Camera,
    width: u32,
    height: u32,
    stopped: bool,
}

impl WebcamCapture {
    /// Acquire the camera with the bounded retry ladder. Each attempt
    /// walks every rung; exhaustion is a terminal `CaptureError`.
    pub fn acquire(
        device_index: u32,
        width: u32,
        height: u32,
        config: &PipelineConfig,
    ) -> Result<Self, CaptureError> {
        tracing::info!(
            "Acquiring webcam {} (preferred {}x{})",
            device_index,
            width,
            height
        );

        let capture = acquire_with_retry(
            config.capture_attempts,
            config.capture_retry_delay,
            |attempt| {
                tracing::debug!("camera attempt {}", attempt);
                Self::open_any(device_index, width, height).map_err(|e| e.to_string())
            },
        )?;

        // Ready signal: the stream must report usable dimensions.
        let (w, h) = capture.resolution();
        if w == 0 || h == 0 {
            return Err(CaptureError::BadDimensions {
                width: w,
                height: h,
            });
        }

        tracing::info!("Webcam ready at {}x{}", w, h);
        Ok(capture)
    }

    /// Walk the constraint ladder once, keeping the first rung that both
    /// opens and starts streaming.
    fn open_any(device_index: u32, width: u32, height: u32) -> Result<Self> {
        let index = CameraIndex::Index(device_index);
        let mut last_err = None;

        for requested in constraint_ladder(width, height) {
            match Camera::new(index.clone(), requested) {
                Ok(mut camera) => match camera.open_stream() {
                    Ok(()) => {
                        let resolution = camera.resolution();
                        return Ok(Self {
                            camera,
                            width: resolution.width(),
                            height: resolution.height(),
                            stopped: false,
                        });
                    }
                    Err(err) => last_err = Some(err),
                },
                Err(err) => last_err = Some(err),
            }
        }

        let err = last_err
            .map(anyhow::Error::new)
            .unwrap_or_else(|| anyhow::anyhow!("constraint ladder produced no attempts"));
        Err(err.context("every rung of the constraint ladder failed"))
    }
}

impl CaptureSource for WebcamCapture {
    fn capture_frame(&mut self) -> Result<RgbImage> {
        let frame = self.camera.frame().context("Failed to capture frame")?;

        let decoded = frame
            .decode_image::<RgbFormat>()
            .context("Failed to decode frame")?;

        Ok(decoded)
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Err(err) = self.camera.stop_stream() {
            tracing::warn!("failed to stop camera stream: {err}");
        } else {
            tracing::info!("camera stream stopped");
        }
    }
}

impl Drop for WebcamCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
