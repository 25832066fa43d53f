//! Error taxonomy for the frame pipeline.
//!
//! Only `CaptureError` is terminal: everything else is absorbed at the
//! component boundary and self-heals via retry or degradation.

use thiserror::Error;

/// Device access failed after the bounded retry ladder. Terminal for the
/// session; the caller must explicitly re-acquire.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera unavailable after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("camera stream reported unusable dimensions {width}x{height}")]
    BadDimensions { width: u32, height: u32 },
}

/// Connection error or unexpected close on the offload channel. Always
/// retried with fixed backoff, never fatal.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("websocket send failed: {0}")]
    Send(String),

    #[error("websocket receive failed: {0}")]
    Receive(String),

    #[error("invalid offload endpoint: {0}")]
    BadEndpoint(String),
}

/// Local segmentation engine failure: the cycle is skipped and the
/// previous mask keeps serving.
#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("inference failed: {0}")]
    Inference(String),
}

/// A background image failed to decode; the active mode reverts to none.
#[derive(Debug, Error)]
pub enum AssetLoadError {
    #[error("failed to load background image {path}: {reason}")]
    Decode { path: String, reason: String },
}

/// Malformed inbound offload message. Dropped and logged, no state change.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("binary frame too short: {len} bytes, need at least 4")]
    TooShort { len: usize },

    #[error("binary frame truncated: header claims {claimed} metadata bytes, {available} available")]
    Truncated { claimed: usize, available: usize },

    #[error("metadata is not valid JSON: {0}")]
    BadMetadata(#[from] serde_json::Error),

    #[error("metadata is not valid UTF-8")]
    BadEncoding(#[from] std::str::Utf8Error),
}
