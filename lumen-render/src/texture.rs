//! Texture upload seam.
//!
//! Slots talk to a [`TextureUploader`] rather than to wgpu directly, so the
//! state machine can be driven by a recording fake in tests.

use thiserror::Error;
use wgpu::{
    Extent3d, TextureDescriptor, TextureDimension, TextureFormat, TextureUsages, TextureView,
};

use crate::context::GpuContext;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("unsupported channel count {0}; only 3 (RGB) and 4 (RGBA) can be uploaded")]
    UnsupportedChannels(u8),
    #[error("decoded buffer is invalid: {0}")]
    InvalidBuffer(String),
    #[error("texture {width}x{height} exceeds device limit {limit}")]
    TooLarge { width: u32, height: u32, limit: u32 },
    #[error("GPU upload failed: {0}")]
    Gpu(String),
}

/// Pixel layouts the upload path understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb24,
    Rgba32,
}

impl PixelFormat {
    /// Map a channel count to a format. Anything but 3 or 4 is fatal.
    pub fn from_channels(channels: u8) -> Result<Self, UploadError> {
        match channels {
            3 => Ok(PixelFormat::Rgb24),
            4 => Ok(PixelFormat::Rgba32),
            other => Err(UploadError::UnsupportedChannels(other)),
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgba32 => 4,
        }
    }
}

/// What to create.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl TextureDesc<'_> {
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Creates GPU textures from tightly packed pixel data.
///
/// Implementations are only ever called from the thread that owns the GPU.
pub trait TextureUploader {
    type Texture;

    fn create_texture(
        &self,
        desc: &TextureDesc<'_>,
        pixels: &[u8],
    ) -> Result<Self::Texture, UploadError>;
}

/// A texture resident on the GPU.
pub struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: TextureView,
    pub width: u32,
    pub height: u32,
    /// Layout of the source buffer; the GPU side is always RGBA8.
    pub format: PixelFormat,
}

impl std::fmt::Debug for GpuTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuTexture")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

/// Uploads into `Rgba8UnormSrgb` textures on a [`GpuContext`].
///
/// wgpu has no 24-bit format, so RGB sources are widened with an opaque
/// alpha byte before the copy.
pub struct WgpuUploader<'a> {
    gpu: &'a GpuContext,
}

impl<'a> WgpuUploader<'a> {
    pub fn new(gpu: &'a GpuContext) -> Self {
        Self { gpu }
    }
}

impl TextureUploader for WgpuUploader<'_> {
    type Texture = GpuTexture;

    fn create_texture(
        &self,
        desc: &TextureDesc<'_>,
        pixels: &[u8],
    ) -> Result<GpuTexture, UploadError> {
        if desc.width == 0 || desc.height == 0 || pixels.len() != desc.byte_len() {
            return Err(UploadError::InvalidBuffer(format!(
                "{}x{} {:?} with {} bytes",
                desc.width,
                desc.height,
                desc.format,
                pixels.len()
            )));
        }
        let limit = self.gpu.max_texture_dimension();
        if desc.width > limit || desc.height > limit {
            return Err(UploadError::TooLarge {
                width: desc.width,
                height: desc.height,
                limit,
            });
        }

        let expanded;
        let data = match desc.format {
            PixelFormat::Rgba32 => pixels,
            PixelFormat::Rgb24 => {
                expanded = rgb_to_rgba(pixels);
                &expanded[..]
            }
        };

        let size = Extent3d {
            width: desc.width,
            height: desc.height,
            depth_or_array_layers: 1,
        };
        let texture = self.gpu.device.create_texture(&TextureDescriptor {
            label: Some(desc.label),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TextureFormat::Rgba8UnormSrgb,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        });

        self.gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(desc.width * 4),
                rows_per_image: Some(desc.height),
            },
            size,
        );

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(GpuTexture {
            texture,
            view,
            width: desc.width,
            height: desc.height,
            format: desc.format,
        })
    }
}

/// Widen packed RGB to RGBA with alpha 255.
pub fn rgb_to_rgba(pixels: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels.len() / 3 * 4);
    for px in pixels.chunks_exact(3) {
        out.extend_from_slice(&[px[0], px[1], px[2], 255]);
    }
    out
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_channels() {
        assert_eq!(PixelFormat::from_channels(3), Ok(PixelFormat::Rgb24));
        assert_eq!(PixelFormat::from_channels(4), Ok(PixelFormat::Rgba32));
        assert_eq!(
            PixelFormat::from_channels(2),
            Err(UploadError::UnsupportedChannels(2))
        );
        assert_eq!(
            PixelFormat::from_channels(1),
            Err(UploadError::UnsupportedChannels(1))
        );
    }

    #[test]
    fn test_unsupported_channels_message_names_count() {
        let msg = UploadError::UnsupportedChannels(2).to_string();
        assert!(msg.contains('2'));
    }

    #[test]
    fn test_rgb_to_rgba() {
        assert_eq!(rgb_to_rgba(&[1, 2, 3, 4, 5, 6]), vec![1, 2, 3, 255, 4, 5, 6, 255]);
        assert!(rgb_to_rgba(&[]).is_empty());
    }

    #[test]
    fn test_desc_byte_len() {
        let desc = TextureDesc {
            label: "t",
            width: 3,
            height: 2,
            format: PixelFormat::Rgb24,
        };
        assert_eq!(desc.byte_len(), 18);
    }

    #[test]
    fn test_wgpu_upload_headless() {
        // No adapter on CI runners without a GPU; nothing to check then.
        let Ok(gpu) = pollster::block_on(GpuContext::new_headless()) else {
            return;
        };
        let uploader = WgpuUploader::new(&gpu);
        let desc = TextureDesc {
            label: "test",
            width: 4,
            height: 2,
            format: PixelFormat::Rgb24,
        };
        let tex = uploader.create_texture(&desc, &[128; 24]).unwrap();
        assert_eq!((tex.width, tex.height), (4, 2));
        assert_eq!(tex.texture.format(), TextureFormat::Rgba8UnormSrgb);

        let bad = uploader.create_texture(&desc, &[0; 10]);
        assert!(matches!(bad, Err(UploadError::InvalidBuffer(_))));
    }
}
