use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use image::{RgbImage, RgbaImage};

use crate::error::AssetLoadError;
use crate::frame::BackgroundMode;

enum AssetState {
    Loading,
    Ready(RgbImage),
    Failed,
}

/// Cache lifecycle notifications for the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Ready(BackgroundMode),
    Failed(BackgroundMode),
}

struct LoadJob {
    generation: u64,
    mode: BackgroundMode,
    path: PathBuf,
}

struct LoadResult {
    generation: u64,
    mode: BackgroundMode,
    outcome: Result<RgbImage, AssetLoadError>,
}

/// Preloads and holds the decoded background image for the current mode.
///
/// Decoding happens on a loader thread. A result is installed only when it
/// still belongs to the most recently requested mode; superseded loads are
/// discarded silently (generation counter).
pub struct BackgroundAssetCache {
    dir: PathBuf,
    requested: BackgroundMode,
    generation: u64,
    state: Option<AssetState>,
    scaled: Option<(u32, u32, RgbaImage)>,
    job_tx: Option<Sender<LoadJob>>,
    result_rx: Receiver<LoadResult>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundAssetCache {
    pub fn new(dir: PathBuf) -> Self {
        let (job_tx, job_rx) = unbounded::<LoadJob>();
        let (result_tx, result_rx) = unbounded::<LoadResult>();

        let handle = thread::spawn(move || {
            while let Ok(job) = job_rx.recv() {
                let outcome = image::open(&job.path)
                    .map(|img| img.to_rgb8())
                    .map_err(|err| AssetLoadError::Decode {
                        path: job.path.display().to_string(),
                        reason: err.to_string(),
                    });
                let result = LoadResult {
                    generation: job.generation,
                    mode: job.mode,
                    outcome,
                };
                if result_tx.send(result).is_err() {
                    break;
                }
            }
        });

        Self {
            dir,
            requested: BackgroundMode::None,
            generation: 0,
            state: None,
            scaled: None,
            job_tx: Some(job_tx),
            result_rx,
            handle: Some(handle),
        }
    }

    /// Begin loading the asset for `mode`. Requesting the mode that is
    /// already active (or loading) is a no-op.
    pub fn request(&mut self, mode: BackgroundMode) {
        if mode == self.requested {
            return;
        }

        self.requested = mode;
        self.generation += 1;
        self.scaled = None;

        match mode.asset_file() {
            Some(file) => {
                self.state = Some(AssetState::Loading);
                let job = LoadJob {
                    generation: self.generation,
                    mode,
                    path: self.dir.join(file),
                };
                if let Some(tx) = &self.job_tx {
                    let _ = tx.send(job);
                }
            }
            None => {
                // none / blur need no decoded asset.
                self.state = None;
            }
        }
    }

    /// Drain loader results. Stale generations are dropped without effect;
    /// a failure for the current request surfaces as `Failed` so the
    /// caller can revert the active mode.
    pub fn poll(&mut self) -> Option<CacheEvent> {
        while let Ok(result) = self.result_rx.try_recv() {
            if result.generation != self.generation {
                tracing::debug!(
                    "discarding superseded background load for {}",
                    result.mode
                );
                continue;
            }
            match result.outcome {
                Ok(image) => {
                    tracing::info!("background asset ready for {}", result.mode);
                    self.state = Some(AssetState::Ready(image));
                    return Some(CacheEvent::Ready(result.mode));
                }
                Err(err) => {
                    tracing::warn!("{err}");
                    self.state = Some(AssetState::Failed);
                    return Some(CacheEvent::Failed(result.mode));
                }
            }
        }
        None
    }

    /// The decoded asset scaled to canvas size, or None when the current
    /// request is not an image mode or has not finished decoding.
    pub fn scaled(&mut self, width: u32, height: u32) -> Option<&RgbaImage> {
        let source = match &self.state {
            Some(AssetState::Ready(image)) => image,
            _ => return None,
        };

        let needs_rescale = !matches!(&self.scaled, Some((w, h, _)) if *w == width && *h == height);
        if needs_rescale {
            let scaled = image::imageops::resize(
                source,
                width,
                height,
                image::imageops::FilterType::Triangle,
            );
            let mut rgba = RgbaImage::new(width, height);
            for (out, px) in rgba.pixels_mut().zip(scaled.pixels()) {
                *out = image::Rgba([px[0], px[1], px[2], 255]);
            }
            self.scaled = Some((width, height, rgba));
        }

        self.scaled.as_ref().map(|(_, _, img)| img)
    }

    pub fn requested_mode(&self) -> BackgroundMode {
        self.requested
    }

    pub fn shutdown(&mut self) {
        self.job_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundAssetCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_asset(dir: &std::path::Path, name: &str, color: [u8; 3]) {
        let img = RgbImage::from_pixel(4, 4, image::Rgb(color));
        img.save(dir.join(name)).unwrap();
    }

    fn pump(cache: &mut BackgroundAssetCache) -> Option<CacheEvent> {
        for _ in 0..200 {
            if let Some(event) = cache.poll() {
                return Some(event);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn decodes_and_scales_the_requested_asset() {
        let dir = tempfile::tempdir().unwrap();
        write_asset(dir.path(), "office.jpg", [10, 200, 30]);

        let mut cache = BackgroundAssetCache::new(dir.path().to_path_buf());
        cache.request(BackgroundMode::Office);
        assert_eq!(pump(&mut cache), Some(CacheEvent::Ready(BackgroundMode::Office)));

        let scaled = cache.scaled(8, 6).expect("scaled asset");
        assert_eq!(scaled.dimensions(), (8, 6));
        assert!(scaled.pixels().all(|p| p[3] == 255));
    }

    #[test]
    fn requesting_the_active_mode_again_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        write_asset(dir.path(), "office.jpg", [0, 0, 0]);

        let mut cache = BackgroundAssetCache::new(dir.path().to_path_buf());
        cache.request(BackgroundMode::Office);
        let generation = cache.generation;
        cache.request(BackgroundMode::Office);
        assert_eq!(cache.generation, generation);
    }

    #[test]
    fn superseded_load_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        write_asset(dir.path(), "office.jpg", [255, 0, 0]);
        write_asset(dir.path(), "beach.jpg", [0, 0, 255]);

        let mut cache = BackgroundAssetCache::new(dir.path().to_path_buf());
        cache.request(BackgroundMode::Office);
        cache.request(BackgroundMode::Beach);

        // Only the beach result may land; the office result is stale.
        assert_eq!(pump(&mut cache), Some(CacheEvent::Ready(BackgroundMode::Beach)));
        assert_eq!(cache.requested_mode(), BackgroundMode::Beach);
        let px = *cache.scaled(2, 2).unwrap().get_pixel(0, 0);
        assert!(px[2] > px[0], "expected the beach (blue) asset, got {px:?}");
        assert!(cache.poll().is_none());
    }

    #[test]
    fn missing_file_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = BackgroundAssetCache::new(dir.path().to_path_buf());
        cache.request(BackgroundMode::Mountain);
        assert_eq!(
            pump(&mut cache),
            Some(CacheEvent::Failed(BackgroundMode::Mountain))
        );
        assert!(cache.scaled(4, 4).is_none());
    }

    #[test]
    fn non_image_modes_need_no_asset() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = BackgroundAssetCache::new(dir.path().to_path_buf());
        cache.request(BackgroundMode::Blur);
        assert!(cache.poll().is_none());
        assert!(cache.scaled(4, 4).is_none());
    }
}
