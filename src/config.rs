use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the whole frame pipeline. Thresholds and cadences live
/// here rather than at call sites so tests can pin them down.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Foreground ratio a mask must exceed (strictly) to report a person.
    pub detection_threshold: f64,
    /// Matte value above which a pixel counts as foreground.
    pub mask_cutoff: f32,
    /// Target spacing between render cycles (~30 fps).
    pub render_interval: Duration,
    /// Spacing of the independent segmentation cadence.
    pub segment_interval: Duration,
    /// Model input resolution (width, height).
    pub model_input: (u32, u32),

    /// Total camera acquisition attempts before giving up.
    pub capture_attempts: u32,
    /// Fixed delay between acquisition attempts.
    pub capture_retry_delay: Duration,

    /// Fixed reconnect backoff for the offload channel. Constant by
    /// contract: consecutive failures never grow the delay.
    pub reconnect_delay: Duration,
    /// Data sends allowed without a processed frame coming back before
    /// further sends are skipped.
    pub max_outstanding_sends: u32,
    /// Width frames are downsampled to before being shipped out.
    pub send_width: u32,
    /// JPEG quality for outbound frames.
    pub jpeg_quality: u8,
    /// WebSocket endpoint of the segmentation worker.
    pub offload_url: String,
    /// Health endpoint used only to classify transport errors.
    pub health_url: String,

    /// Gaussian sigma for the blur background.
    pub blur_sigma: f32,
    /// Directory holding the still background images.
    pub backgrounds_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detection_threshold: 0.05,
            mask_cutoff: 0.5,
            render_interval: Duration::from_millis(33),
            segment_interval: Duration::from_millis(100),
            model_input: (256, 256),
            capture_attempts: 3,
            capture_retry_delay: Duration::from_millis(500),
            reconnect_delay: Duration::from_secs(2),
            max_outstanding_sends: 3,
            send_width: 640,
            jpeg_quality: 85,
            offload_url: "ws://localhost:3001/ws".to_string(),
            health_url: "http://localhost:3001/health".to_string(),
            blur_sigma: 8.0,
            backgrounds_dir: PathBuf::from("assets"),
        }
    }
}
