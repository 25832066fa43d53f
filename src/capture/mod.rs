mod webcam;

pub use webcam::WebcamCapture;

use std::thread;
use std::time::Duration;

use anyhow::Result;
use image::RgbImage;

use crate::error::CaptureError;

/// Trait for camera capture sources
pub trait CaptureSource {
    /// Capture a single frame
    fn capture_frame(&mut self) -> Result<RgbImage>;

    /// Get the resolution of captured frames
    fn resolution(&self) -> (u32, u32);

    /// Stop the underlying stream. Must be idempotent: stopping an
    /// already-stopped source is a no-op.
    fn stop(&mut self);
}

/// Run an acquisition attempt up to `attempts` times with a fixed delay
/// between attempts. Exhaustion is terminal: the caller has to re-invoke
/// explicitly, there is no background retry.
pub fn acquire_with_retry<T, F>(
    attempts: u32,
    delay: Duration,
    mut acquire: F,
) -> Result<T, CaptureError>
where
    F: FnMut(u32) -> Result<T, String>,
{
    let mut last = String::from("no attempts made");
    for attempt in 1..=attempts {
        match acquire(attempt) {
            Ok(source) => return Ok(source),
            Err(reason) => {
                tracing::warn!(
                    "camera acquisition attempt {}/{} failed: {}",
                    attempt,
                    attempts,
                    reason
                );
                last = reason;
            }
        }
        if attempt < attempts {
            thread::sleep(delay);
        }
    }
    Err(CaptureError::Exhausted { attempts, last })
}
