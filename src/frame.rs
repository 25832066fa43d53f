use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use image::RgbImage;
use serde::{Deserialize, Serialize};

/// A single captured camera frame. Transient: lives for one processing
/// cycle and is never retained past it.
pub struct VideoFrame {
    pub image: RgbImage,
    pub captured_at: Instant,
}

impl VideoFrame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Per-pixel foreground classification: 1 = person, 0 = background.
///
/// A mask may be reused across several render cycles until a newer one
/// replaces it, but is only ever composited against a frame of matching
/// dimensions.
pub struct SegmentationMask {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub produced_at: Instant,
}

impl SegmentationMask {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self {
            data,
            width,
            height,
            produced_at: Instant::now(),
        }
    }

    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    /// Fraction of pixels classified as foreground, in [0, 1].
    pub fn foreground_ratio(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let foreground = self.data.iter().filter(|&&p| p == 1).count();
        foreground as f64 / self.data.len() as f64
    }
}

/// The selectable virtual background. Exactly one mode is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundMode {
    None,
    #[serde(alias = "difuminado")]
    Blur,
    Office,
    Beach,
    Mountain,
}

impl BackgroundMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackgroundMode::None => "none",
            BackgroundMode::Blur => "blur",
            BackgroundMode::Office => "office",
            BackgroundMode::Beach => "beach",
            BackgroundMode::Mountain => "mountain",
        }
    }

    /// Modes backed by a still image that must be decoded before use.
    pub fn is_image(&self) -> bool {
        matches!(
            self,
            BackgroundMode::Office | BackgroundMode::Beach | BackgroundMode::Mountain
        )
    }

    /// File name of the backing image inside the backgrounds directory.
    pub fn asset_file(&self) -> Option<&'static str> {
        match self {
            BackgroundMode::Office => Some("office.jpg"),
            BackgroundMode::Beach => Some("beach.jpg"),
            BackgroundMode::Mountain => Some("mountain.jpg"),
            _ => None,
        }
    }
}

impl fmt::Display for BackgroundMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackgroundMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(BackgroundMode::None),
            "blur" | "difuminado" => Ok(BackgroundMode::Blur),
            "office" => Ok(BackgroundMode::Office),
            "beach" => Ok(BackgroundMode::Beach),
            "mountain" => Ok(BackgroundMode::Mountain),
            other => Err(format!("unknown background mode: {other}")),
        }
    }
}

/// Outcome of one segmentation cycle, local or remote.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionResult {
    pub is_person_detected: bool,
    pub percentage: f64,
    pub mode: BackgroundMode,
}

impl DetectionResult {
    /// Derive detection from a mask. Detection requires strictly more
    /// foreground than the threshold: an exact match is not detected.
    pub fn from_mask(mask: &SegmentationMask, threshold: f64, mode: BackgroundMode) -> Self {
        let percentage = mask.foreground_ratio();
        Self {
            is_person_detected: percentage > threshold,
            percentage,
            mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_with_foreground(total: usize, foreground: usize) -> SegmentationMask {
        let mut data = vec![0u8; total];
        for p in data.iter_mut().take(foreground) {
            *p = 1;
        }
        SegmentationMask::new(data, total as u32, 1)
    }

    #[test]
    fn foreground_ratio_counts_ones() {
        let mask = mask_with_foreground(100, 25);
        assert_eq!(mask.foreground_ratio(), 0.25);
    }

    #[test]
    fn detection_at_exact_threshold_is_negative() {
        // 5 of 100 pixels with threshold 0.05: boundary case stays false.
        let mask = mask_with_foreground(100, 5);
        let result = DetectionResult::from_mask(&mask, 0.05, BackgroundMode::None);
        assert!(!result.is_person_detected);
        assert_eq!(result.percentage, 0.05);
    }

    #[test]
    fn detection_above_threshold_is_positive() {
        let mask = mask_with_foreground(100, 6);
        let result = DetectionResult::from_mask(&mask, 0.05, BackgroundMode::None);
        assert!(result.is_person_detected);
    }

    #[test]
    fn mode_round_trips_through_str() {
        for mode in [
            BackgroundMode::None,
            BackgroundMode::Blur,
            BackgroundMode::Office,
            BackgroundMode::Beach,
            BackgroundMode::Mountain,
        ] {
            assert_eq!(mode.as_str().parse::<BackgroundMode>().unwrap(), mode);
        }
    }

    #[test]
    fn legacy_blur_spelling_is_accepted() {
        assert_eq!(
            "difuminado".parse::<BackgroundMode>().unwrap(),
            BackgroundMode::Blur
        );
    }
}
