//! Image payload decoding.
//!
//! Runs on fetch worker threads so the render thread only ever sees raw
//! pixel buffers. The declared content type is tried first; if that fails
//! the format is sniffed from the payload bytes.
//!
//! Dimensions are read from the header and bounded before any pixel buffer
//! is allocated, and the decoder itself runs under [`image::Limits`].

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, ImageReader, Limits};
use log::debug;
use thiserror::Error;

/// Largest edge accepted for an image.
pub const MAX_DIMENSION: u32 = 16_384;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("unrecognised image format")]
    UnknownFormat,
    #[error("image decode failed: {0}")]
    Image(String),
    #[error("image has {channels} channels after conversion")]
    Channels { channels: u8 },
    #[error("image {width}x{height} exceeds the {max}px limit")]
    TooLarge { width: u32, height: u32, max: u32 },
}

impl From<image::ImageError> for DecodeError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(_) => DecodeError::UnknownFormat,
            other => DecodeError::Image(other.to_string()),
        }
    }
}

/// How many channels a decoded buffer carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChannelPolicy {
    /// Keep the source layout: L→1, LA→2, RGB→3, RGBA→4.
    #[default]
    Native,
    /// Always expand to four channels.
    ForceRgba,
}

/// A raw, tightly packed 8-bit pixel buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub pixels: Vec<u8>,
}

impl DecodedImage {
    pub fn new(width: u32, height: u32, channels: u8, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            channels,
            pixels,
        }
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    /// Non-zero dimensions and a buffer that matches them exactly.
    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.channels > 0
            && self.pixels.len() == self.stride() * self.height as usize
    }
}

impl std::fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Decode `bytes` into a pixel buffer laid out according to `policy`.
///
/// `content_type` is only a hint. 16-bit and float sources are narrowed
/// to 8 bits per channel.
pub fn decode(
    bytes: &[u8],
    content_type: Option<&str>,
    policy: ChannelPolicy,
) -> Result<DecodedImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let image = load(bytes, content_type)?;
    let (width, height) = (image.width(), image.height());

    let channels = match policy {
        ChannelPolicy::ForceRgba => 4,
        ChannelPolicy::Native => image.color().channel_count(),
    };
    let pixels = match channels {
        1 => image.into_luma8().into_raw(),
        2 => image.into_luma_alpha8().into_raw(),
        3 => image.into_rgb8().into_raw(),
        4 => image.into_rgba8().into_raw(),
        other => return Err(DecodeError::Channels { channels: other }),
    };

    debug!("decoded {width}x{height} image with {channels} channels");
    Ok(DecodedImage::new(width, height, channels, pixels))
}

fn load(bytes: &[u8], content_type: Option<&str>) -> Result<DynamicImage, DecodeError> {
    let declared = content_type.and_then(format_from_content_type);
    if let Some(format) = declared {
        match read(bytes, format) {
            Ok(image) => return Ok(image),
            Err(err @ DecodeError::TooLarge { .. }) => return Err(err),
            Err(_) => {}
        }
    }

    let sniffed = image::guess_format(bytes).map_err(|_| DecodeError::UnknownFormat)?;
    read(bytes, sniffed)
}

fn read(bytes: &[u8], format: ImageFormat) -> Result<DynamicImage, DecodeError> {
    let (width, height) = ImageReader::with_format(Cursor::new(bytes), format).into_dimensions()?;
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(DecodeError::TooLarge {
            width,
            height,
            max: MAX_DIMENSION,
        });
    }

    let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
    reader.limits(decode_limits());
    Ok(reader.decode()?)
}

fn decode_limits() -> Limits {
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_DIMENSION);
    limits.max_image_height = Some(MAX_DIMENSION);
    limits
}

fn format_from_content_type(content_type: &str) -> Option<ImageFormat> {
    match lumen_fetch::gate::media_type(content_type).as_str() {
        "image/png" => Some(ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
        "image/bmp" => Some(ImageFormat::Bmp),
        "image/gif" => Some(ImageFormat::Gif),
        _ => None,
    }
}

// ===================================================================
// Tests
// ===================================================================
