use super::OutputSink;
use anyhow::{Context, Result};
use image::RgbaImage;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use v4l::video::Output;
use v4l::{Device, Format, FourCC};

pub struct V4L2Output {
    file: File,
    width: u32,
    height: u32,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{})",
            path.display(),
            width,
            height
        );

        // Tell the loopback device what we are about to feed it.
        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open v4l2 device at {}", path.display()))?;
        let format = Format::new(width, height, FourCC::new(b"YUYV"));
        Output::set_format(&device, &format)
            .context("Failed to set YUYV output format on loopback device")?;
        drop(device);

        // v4l2loopback accepts raw frame data written to the device file
        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;

        tracing::info!("v4l2loopback device opened successfully");

        Ok(Self {
            file,
            width,
            height,
        })
    }

    /// Convert a composited RGBA frame to packed YUYV, the format
    /// v4l2loopback typically expects. Alpha is discarded: the surface is
    /// opaque by the compositing rules.
    fn rgba_to_yuyv(frame: &RgbaImage) -> Vec<u8> {
        let (width, height) = frame.dimensions();
        let mut yuyv = Vec::with_capacity((width * height * 2) as usize);

        for y in 0..height {
            for x in (0..width).step_by(2) {
                let p1 = frame.get_pixel(x, y);
                let p2 = if x + 1 < width {
                    frame.get_pixel(x + 1, y)
                } else {
                    p1
                };

                let (y1, u1, v1) = rgb_to_yuv(p1[0], p1[1], p1[2]);
                let (y2, u2, v2) = rgb_to_yuv(p2[0], p2[1], p2[2]);

                // Average U and V over the pixel pair
                let u = ((u1 as u16 + u2 as u16) / 2) as u8;
                let v = ((v1 as u16 + v2 as u16) / 2) as u8;

                yuyv.push(y1);
                yuyv.push(u);
                yuyv.push(y2);
                yuyv.push(v);
            }
        }

        yuyv
    }
}

fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let r = r as f32;
    let g = g as f32;
    let b = b as f32;

    let y = (0.299 * r + 0.587 * g + 0.114 * b).clamp(0.0, 255.0) as u8;
    let u = ((-0.147 * r - 0.289 * g + 0.436 * b) + 128.0).clamp(0.0, 255.0) as u8;
    let v = ((0.615 * r - 0.515 * g - 0.100 * b) + 128.0).clamp(0.0, 255.0) as u8;

    (y, u, v)
}

impl OutputSink for V4L2Output {
    fn write_frame(&mut self, frame: &RgbaImage) -> Result<()> {
        let frame = if frame.dimensions() != (self.width, self.height) {
            image::imageops::resize(
                frame,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            )
        } else {
            frame.clone()
        };

        let yuyv_data = Self::rgba_to_yuyv(&frame);

        self.file
            .write_all(&yuyv_data)
            .context("Failed to write frame to v4l2loopback device")?;

        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_packs_two_pixels_into_four_bytes() {
        let frame = RgbaImage::from_pixel(4, 2, image::Rgba([255, 255, 255, 255]));
        let yuyv = V4L2Output::rgba_to_yuyv(&frame);
        assert_eq!(yuyv.len(), 4 * 2 * 2);
        // White: full luma, neutral chroma.
        assert_eq!(yuyv[0], 255);
        assert!((yuyv[1] as i16 - 128).abs() <= 1);
    }
}
