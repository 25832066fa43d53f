use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use image::RgbImage;

use super::preprocess::Preprocessor;
use super::types::SegmentationModel;
use crate::error::SegmentationError;
use crate::frame::{BackgroundMode, DetectionResult, SegmentationMask};

struct Job {
    image: RgbImage,
    mode: BackgroundMode,
}

enum Outcome {
    Mask(SegmentationMask, DetectionResult),
    Skipped,
}

/// Owns the segmentation worker thread and enforces mutual exclusion:
/// a new segment call is never issued while one is outstanding. Callers
/// that find the engine busy keep serving the previous mask.
pub struct SegmentationEngine {
    job_tx: Option<Sender<Job>>,
    result_rx: Receiver<Outcome>,
    in_flight: bool,
    handle: Option<JoinHandle<()>>,
}

impl SegmentationEngine {
    pub fn start(
        mut model: Box<dyn SegmentationModel>,
        mask_cutoff: f32,
        detection_threshold: f64,
    ) -> Self {
        let (job_tx, job_rx) = bounded::<Job>(1);
        let (result_tx, result_rx) = bounded::<Outcome>(1);

        let handle = thread::spawn(move || {
            let (model_w, model_h) = model.input_size();
            while let Ok(job) = job_rx.recv() {
                let (frame_w, frame_h) = job.image.dimensions();
                let outcome = match model.segment(&job.image) {
                    Ok(matte) => match Preprocessor::matte_to_mask(
                        &matte,
                        model_w,
                        model_h,
                        frame_w,
                        frame_h,
                        mask_cutoff,
                    ) {
                        Ok(mask) => {
                            let detection =
                                DetectionResult::from_mask(&mask, detection_threshold, job.mode);
                            Outcome::Mask(mask, detection)
                        }
                        Err(err) => {
                            tracing::warn!("mask postprocessing failed: {err:#}");
                            Outcome::Skipped
                        }
                    },
                    Err(err) => {
                        // Engine failure skips the cycle; the previous
                        // mask is retained by the pipeline.
                        let err = SegmentationError::Inference(format!("{err:#}"));
                        tracing::warn!("{err}");
                        Outcome::Skipped
                    }
                };
                if result_tx.send(outcome).is_err() {
                    break;
                }
            }
        });

        Self {
            job_tx: Some(job_tx),
            result_rx,
            in_flight: false,
            handle: Some(handle),
        }
    }

    /// Hand a frame to the worker. Returns false (and drops the request)
    /// when a segmentation is already outstanding.
    pub fn submit(&mut self, image: &RgbImage, mode: BackgroundMode) -> bool {
        if self.in_flight {
            return false;
        }
        let Some(tx) = &self.job_tx else {
            return false;
        };
        let job = Job {
            image: image.clone(),
            mode,
        };
        if tx.try_send(job).is_ok() {
            self.in_flight = true;
            true
        } else {
            false
        }
    }

    /// Collect a finished segmentation, if any. A skipped cycle clears
    /// the in-flight guard but yields nothing.
    pub fn poll(&mut self) -> Option<(SegmentationMask, DetectionResult)> {
        match self.result_rx.try_recv() {
            Ok(Outcome::Mask(mask, detection)) => {
                self.in_flight = false;
                Some((mask, detection))
            }
            Ok(Outcome::Skipped) => {
                self.in_flight = false;
                None
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.in_flight = false;
                None
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
    }

    /// Stop the worker. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.job_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SegmentationEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
