//! Local compositing: blends frame, mask and background asset into the
//! display surface.

use image::{imageops, Rgba, RgbaImage, RgbImage};

use crate::background::BackgroundAssetCache;
use crate::frame::{BackgroundMode, SegmentationMask};

/// Pixels handled per inner overwrite step.
const FOREGROUND_BLOCK: usize = 4;

/// Composite one frame. Rules in priority order:
/// 1. mode none, no mask yet, or mask/frame dimension mismatch: passthrough.
/// 2. blur: blurred frame as background, person cut over it.
/// 3. image mode with a ready asset: asset as background, person cut over it.
/// 4. image mode without a ready asset: passthrough, mode untouched.
///
/// The cut is hard: every mask==1 pixel is the original frame pixel at
/// full opacity, nothing at the boundary is blended.
pub fn composite(
    frame: &RgbImage,
    mask: Option<&SegmentationMask>,
    mode: BackgroundMode,
    cache: &mut BackgroundAssetCache,
    blur_sigma: f32,
) -> RgbaImage {
    let (width, height) = frame.dimensions();

    let mask = match mask {
        Some(m) if m.matches(width, height) => m,
        _ => return passthrough(frame),
    };
    if mode == BackgroundMode::None {
        return passthrough(frame);
    }

    let mut canvas = match mode {
        BackgroundMode::Blur => passthrough(&imageops::blur(frame, blur_sigma)),
        _ => match cache.scaled(width, height) {
            Some(asset) => asset.clone(),
            // Asset still loading or failed: keep showing the raw feed.
            None => return passthrough(frame),
        },
    };

    overwrite_foreground(&mut canvas, frame, mask);
    canvas
}

/// The raw frame at full opacity.
pub fn passthrough(frame: &RgbImage) -> RgbaImage {
    let (width, height) = frame.dimensions();
    let mut out = RgbaImage::new(width, height);
    for (dst, src) in out.pixels_mut().zip(frame.pixels()) {
        *dst = Rgba([src[0], src[1], src[2], 255]);
    }
    out
}

/// Dimmed passthrough with a reconnect indicator, shown while the offload
/// channel is waiting to retry so the surface never goes stale.
pub fn dimmed(frame: &RgbImage) -> RgbaImage {
    let (width, height) = frame.dimensions();
    let mut out = RgbaImage::new(width, height);
    for (dst, src) in out.pixels_mut().zip(frame.pixels()) {
        *dst = Rgba([
            (src[0] as u16 * 35 / 100) as u8,
            (src[1] as u16 * 35 / 100) as u8,
            (src[2] as u16 * 35 / 100) as u8,
            255,
        ]);
    }
    // Small red marker in the top-left corner.
    for y in 8..20u32 {
        for x in 8..20u32 {
            if x < width && y < height {
                out.put_pixel(x, y, Rgba([220, 40, 40, 255]));
            }
        }
    }
    out
}

/// Overwrite every mask==1 pixel with the original frame pixel, forced
/// fully opaque. Runs over fixed-size blocks for throughput; the written
/// set still matches the mask exactly.
fn overwrite_foreground(canvas: &mut RgbaImage, frame: &RgbImage, mask: &SegmentationMask) {
    let canvas_raw: &mut [u8] = &mut *canvas;
    let frame_raw: &[u8] = frame.as_raw();

    for (block_idx, block) in mask.data.chunks(FOREGROUND_BLOCK).enumerate() {
        let base = block_idx * FOREGROUND_BLOCK;
        for (offset, &value) in block.iter().enumerate() {
            if value != 1 {
                continue;
            }
            let px = base + offset;
            let src = px * 3;
            let dst = px * 4;
            canvas_raw[dst] = frame_raw[src];
            canvas_raw[dst + 1] = frame_raw[src + 1];
            canvas_raw[dst + 2] = frame_raw[src + 2];
            canvas_raw[dst + 3] = 255;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SegmentationMask;

    fn solid_frame(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, image::Rgb(color))
    }

    fn checker_mask(width: u32, height: u32) -> SegmentationMask {
        let data = (0..width * height).map(|i| (i % 2 == 0) as u8).collect();
        SegmentationMask::new(data, width, height)
    }

    fn empty_cache() -> BackgroundAssetCache {
        BackgroundAssetCache::new(std::path::PathBuf::from("/nonexistent"))
    }

    #[test]
    fn output_dimensions_match_the_frame() {
        let frame = solid_frame(6, 4, [9, 9, 9]);
        let mask = checker_mask(6, 4);
        let mut cache = empty_cache();
        for mode in [BackgroundMode::None, BackgroundMode::Blur, BackgroundMode::Office] {
            let out = composite(&frame, Some(&mask), mode, &mut cache, 2.0);
            assert_eq!(out.dimensions(), frame.dimensions());
        }
    }

    #[test]
    fn mode_none_is_passthrough() {
        let frame = solid_frame(4, 4, [1, 2, 3]);
        let mask = checker_mask(4, 4);
        let mut cache = empty_cache();
        let out = composite(&frame, Some(&mask), BackgroundMode::None, &mut cache, 2.0);
        assert!(out.pixels().all(|p| p.0 == [1, 2, 3, 255]));
    }

    #[test]
    fn missing_mask_is_passthrough_even_with_a_mode() {
        let frame = solid_frame(4, 4, [1, 2, 3]);
        let mut cache = empty_cache();
        let out = composite(&frame, None, BackgroundMode::Blur, &mut cache, 2.0);
        assert!(out.pixels().all(|p| p.0 == [1, 2, 3, 255]));
    }

    #[test]
    fn mismatched_mask_is_never_composited() {
        let frame = solid_frame(4, 4, [1, 2, 3]);
        let stale = checker_mask(8, 8);
        let mut cache = empty_cache();
        let out = composite(&frame, Some(&stale), BackgroundMode::Blur, &mut cache, 2.0);
        assert!(out.pixels().all(|p| p.0 == [1, 2, 3, 255]));
    }

    #[test]
    fn unready_image_asset_falls_back_to_passthrough() {
        let frame = solid_frame(4, 4, [7, 8, 9]);
        let mask = checker_mask(4, 4);
        let mut cache = empty_cache();
        cache.request(BackgroundMode::Office);
        let out = composite(&frame, Some(&mask), BackgroundMode::Office, &mut cache, 2.0);
        assert!(out.pixels().all(|p| p.0 == [7, 8, 9, 255]));
    }

    #[test]
    fn ready_asset_shows_background_where_mask_is_zero_and_person_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        // PNG bytes under the expected file name keep the color exact
        // (the loader sniffs content, not the extension).
        let png = RgbImage::from_pixel(4, 4, image::Rgb([0, 0, 200]));
        png.save_with_format(dir.path().join("office.jpg"), image::ImageFormat::Png)
            .unwrap();

        let mut cache = BackgroundAssetCache::new(dir.path().to_path_buf());
        cache.request(BackgroundMode::Office);
        for _ in 0..200 {
            if cache.poll().is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let frame = solid_frame(4, 4, [250, 10, 10]);
        let mask = checker_mask(4, 4);
        let out = composite(&frame, Some(&mask), BackgroundMode::Office, &mut cache, 2.0);

        for (i, px) in out.pixels().enumerate() {
            assert_eq!(px[3], 255, "pixel {i} must be fully opaque");
            if i % 2 == 0 {
                assert_eq!(px.0, [250, 10, 10, 255], "mask=1 keeps the person pixel");
            } else {
                assert_eq!(px.0, [0, 0, 200, 255], "mask=0 shows the background");
            }
        }
    }

    #[test]
    fn blur_keeps_foreground_pixels_untouched() {
        let mut frame = solid_frame(8, 8, [0, 0, 0]);
        frame.put_pixel(3, 3, image::Rgb([255, 255, 255]));
        let mask = SegmentationMask::new(vec![1; 64], 8, 8);
        let mut cache = empty_cache();

        let out = composite(&frame, Some(&mask), BackgroundMode::Blur, &mut cache, 3.0);
        // A full-foreground mask means the output equals the input frame.
        for (o, f) in out.pixels().zip(frame.pixels()) {
            assert_eq!([o[0], o[1], o[2]], [f[0], f[1], f[2]]);
            assert_eq!(o[3], 255);
        }
    }

    #[test]
    fn dimmed_output_is_darker_and_keeps_dimensions() {
        let frame = solid_frame(64, 48, [200, 100, 50]);
        let out = dimmed(&frame);
        assert_eq!(out.dimensions(), (64, 48));
        let corner = out.get_pixel(63, 47);
        assert_eq!(corner.0, [70, 35, 17, 255]);
    }
}
