//! Image decoding and WebP encoding.
//!
//! Formats are sniffed from magic bytes, never from the object key, so a
//! mislabelled `.jpg` that is really a PNG still decodes.

use image::{DynamicImage, ImageFormat};
use std::borrow::Cow;
use thiserror::Error;

pub const DEFAULT_WEBP_QUALITY: f32 = 65.0;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("image data is empty")]
    Empty,
    #[error("unsupported image format {0:?}")]
    Unsupported(ImageFormat),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("WebP encoder rejected image: {0}")]
    Encode(String),
}

/// Output settings for the WebP encoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WebpSettings {
    /// Lossy quality factor, 0 (smallest) to 100 (best).
    pub quality: f32,
    pub lossless: bool,
}

impl Default for WebpSettings {
    fn default() -> Self {
        Self {
            quality: DEFAULT_WEBP_QUALITY,
            lossless: false,
        }
    }
}

/// Stateless decoder/encoder pair; cheap to copy into blocking tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodec {
    settings: WebpSettings,
}

impl ImageCodec {
    pub fn new(settings: WebpSettings) -> Self {
        Self { settings }
    }

    /// Decode JPEG, PNG or GIF bytes. Any other sniffed format is rejected.
    pub fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::Empty);
        }

        let format = image::guess_format(bytes)?;
        match format {
            ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Gif => {}
            other => return Err(CodecError::Unsupported(other)),
        }

        Ok(image::load_from_memory_with_format(bytes, format)?)
    }

    /// Encode a decoded image as WebP using the configured settings.
    ///
    /// libwebp only takes 8-bit RGB/RGBA, so other layouts are converted first.
    pub fn encode_webp(&self, image: &DynamicImage) -> Result<Vec<u8>, CodecError> {
        let prepared: Cow<'_, DynamicImage> = match image {
            DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => Cow::Borrowed(image),
            other if other.color().has_alpha() => {
                Cow::Owned(DynamicImage::ImageRgba8(other.to_rgba8()))
            }
            other => Cow::Owned(DynamicImage::ImageRgb8(other.to_rgb8())),
        };

        let encoder = webp::Encoder::from_image(&prepared)
            .map_err(|reason| CodecError::Encode(reason.to_string()))?;
        let memory = encoder
            .encode_simple(self.settings.lossless, self.settings.quality)
            .map_err(|err| CodecError::Encode(format!("{:?}", err)))?;

        Ok(memory.to_vec())
    }
}
