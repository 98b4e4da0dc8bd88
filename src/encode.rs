//! Frame encoders for the HTTP streams.

use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg;
use image::{ExtendedColorType, ImageEncoder};

use crate::frame::Frame;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Encoded still plus the MIME type it should be served as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedImage {
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

pub trait FrameEncoder: Send + Sync {
    fn content_type(&self) -> &'static str;
    fn encode(&self, frame: &Frame) -> Result<EncodedImage>;
}

#[derive(Clone, Copy, Debug)]
pub struct JpegEncoder {
    quality: u8,
}

impl JpegEncoder {
    pub fn new(quality: u8) -> Result<Self> {
        if !(1..=100).contains(&quality) {
            return Err(anyhow!("jpeg quality must be within 1..=100, got {}", quality));
        }
        Ok(Self { quality })
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegEncoder {
    fn default() -> Self {
        Self {
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl FrameEncoder for JpegEncoder {
    fn content_type(&self) -> &'static str {
        "image/jpeg"
    }

    fn encode(&self, frame: &Frame) -> Result<EncodedImage> {
        let mut buf = Cursor::new(Vec::new());
        jpeg::JpegEncoder::new_with_quality(&mut buf, self.quality)
            .write_image(
                frame.pixels(),
                frame.width(),
                frame.height(),
                ExtendedColorType::Rgb8,
            )
            .with_context(|| format!("encode {}x{} frame as jpeg", frame.width(), frame.height()))?;
        Ok(EncodedImage {
            content_type: self.content_type(),
            bytes: buf.into_inner(),
        })
    }
}
