//! Wire codec for the remote segmentation worker.
//!
//! Outbound messages are JSON text. Inbound messages are either JSON text
//! (acks) or a binary frame laid out as
//! `[u32 big-endian metadata length][metadata JSON][JPEG bytes]`.
//! Everything inbound is decoded once here into a closed set of variants;
//! malformed input is a `ProtocolError` the caller logs and drops.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::frame::BackgroundMode;

#[derive(Serialize)]
struct ModeChangeMsg {
    r#type: &'static str,
    mode: BackgroundMode,
}

#[derive(Serialize)]
struct FrameDataMsg<'a> {
    image: &'a str,
    mode: BackgroundMode,
}

/// Control message announcing a mode change.
pub fn encode_mode_change(mode: BackgroundMode) -> String {
    serde_json::to_string(&ModeChangeMsg {
        r#type: "mode_change",
        mode,
    })
    .expect("mode change message serializes")
}

/// Data message carrying one encoded frame and the mode it should be
/// processed under.
pub fn encode_frame_data(image_payload: &str, mode: BackgroundMode) -> String {
    serde_json::to_string(&FrameDataMsg {
        image: image_payload,
        mode,
    })
    .expect("frame data message serializes")
}

/// Downsample a frame to `send_width` and pack it as a base64 JPEG data
/// URL, the payload format the worker expects.
pub fn encode_frame_payload(frame: &RgbImage, send_width: u32, jpeg_quality: u8) -> Result<String> {
    let (width, height) = frame.dimensions();

    let resized;
    let source = if width > send_width {
        let send_height = (height as f32 * send_width as f32 / width as f32).max(1.0) as u32;
        resized = image::imageops::resize(
            frame,
            send_width,
            send_height,
            image::imageops::FilterType::Triangle,
        );
        &resized
    } else {
        frame
    };

    let mut jpeg = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, jpeg_quality);
    encoder
        .encode_image(source)
        .context("failed to JPEG-encode outbound frame")?;

    Ok(format!("data:image/jpeg;base64,{}", BASE64.encode(&jpeg)))
}

/// Metadata the worker attaches to every processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameMeta {
    #[serde(rename = "isPersonDetected")]
    pub is_person_detected: bool,
    pub percentage: f64,
    pub mode: BackgroundMode,
}

/// Inbound messages, decoded once at the boundary.
#[derive(Debug, PartialEq)]
pub enum InboundMessage {
    /// The worker confirmed a mode change.
    Ack { mode: BackgroundMode },
    /// A processed frame with its detection metadata.
    Frame { meta: FrameMeta, image: Vec<u8> },
}

#[derive(Deserialize)]
struct TextEnvelope {
    r#type: String,
    mode: Option<BackgroundMode>,
}

/// Decode a text message. `Ok(None)` means valid but irrelevant (server
/// chatter like pings); errors are malformed input.
pub fn decode_text(text: &str) -> Result<Option<InboundMessage>, ProtocolError> {
    let envelope: TextEnvelope = serde_json::from_str(text)?;
    match envelope.r#type.as_str() {
        "mode_change_ack" => {
            let mode = envelope.mode.unwrap_or(BackgroundMode::None);
            Ok(Some(InboundMessage::Ack { mode }))
        }
        _ => Ok(None),
    }
}

/// Decode a binary frame. Rejects buffers shorter than the 4-byte header
/// or shorter than the length the header claims.
pub fn decode_binary(buf: &[u8]) -> Result<InboundMessage, ProtocolError> {
    if buf.len() < 4 {
        return Err(ProtocolError::TooShort { len: buf.len() });
    }

    let meta_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let available = buf.len() - 4;
    if available < meta_len {
        return Err(ProtocolError::Truncated {
            claimed: meta_len,
            available,
        });
    }

    let meta_bytes = &buf[4..4 + meta_len];
    let meta: FrameMeta = serde_json::from_str(std::str::from_utf8(meta_bytes)?)?;
    let image = buf[4 + meta_len..].to_vec();

    Ok(InboundMessage::Frame { meta, image })
}
