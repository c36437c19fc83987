//! Video frame model shared by ingestion, pose estimation and preview

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single landmark or pose point: normalized `(x, y)` plus depth or `z`
pub type Point3 = [f32; 3];

/// Compressed video codecs a transport may deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Vp8,
    Vp9,
    H264,
}

impl VideoCodec {
    /// Map an RTP mime type (`video/VP8`, ...) to a codec
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        match mime.to_ascii_lowercase().as_str() {
            "video/vp8" => Some(VideoCodec::Vp8),
            "video/vp9" => Some(VideoCodec::Vp9),
            "video/h264" => Some(VideoCodec::H264),
            _ => None,
        }
    }

    /// RTP mime type for this codec
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::Vp8 => "video/VP8",
            VideoCodec::Vp9 => "video/VP9",
            VideoCodec::H264 => "video/H264",
        }
    }
}

/// Pixel layout of a frame payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Packed 8-bit RGB
    Rgb24,
    /// Packed 8-bit BGR (OpenCV order)
    Bgr24,
    /// 8-bit luma
    Gray8,
    /// JPEG still image
    Jpeg,
    /// Compressed bitstream as received from the transport
    Encoded(VideoCodec),
}

impl PixelFormat {
    /// Bytes per pixel for raw formats
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Jpeg | PixelFormat::Encoded(_) => None,
        }
    }
}

/// One video frame
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

impl VideoFrame {
    /// Create a frame, checking raw payload length against the dimensions
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Bytes) -> crate::Result<Self> {
        if let Some(bpp) = format.bytes_per_pixel() {
            let expected = width as usize * height as usize * bpp;
            if data.len() != expected {
                return Err(crate::Error::Encoding(format!(
                    "{:?} frame {}x{} needs {} bytes, got {}",
                    format,
                    width,
                    height,
                    expected,
                    data.len()
                )));
            }
        }

        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// All-black RGB frame
    pub fn black(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Rgb24,
            data: Bytes::from(vec![0u8; width as usize * height as usize * 3]),
        }
    }

    /// Whether the payload is an undecoded codec bitstream
    pub fn is_encoded(&self) -> bool {
        matches!(self.format, PixelFormat::Encoded(_))
    }
}

/// A frame tagged with its capture timestamp in seconds
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub timestamp: f64,
    pub frame: Arc<VideoFrame>,
}

impl FrameRecord {
    pub fn new(timestamp: f64, frame: Arc<VideoFrame>) -> Self {
        Self { timestamp, frame }
    }
}
