//! Container decoding with channel normalisation.
//!
//! WebP is attempted first, then whatever `image` sniffs from the header.
//! Engines only accept 3 or 4 interleaved 8-bit channels, so:
//!
//! | source            | output |
//! |-------------------|--------|
//! | gray              | RGB    |
//! | gray + alpha      | RGBA   |
//! | RGB (any depth)   | RGB    |
//! | RGBA (any depth)  | RGBA   |

use std::io::Cursor;
use std::path::Path;

use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat};
use tracing::debug;

use upshot_core::codec_traits::{ImageDecoder, PixelBuffer};
use upshot_core::error::{EngineError, Result};

/// WebP / PNG / JPEG decoder.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContainerDecoder;

impl ContainerDecoder {
    pub fn new() -> Self {
        Self
    }

    fn load(bytes: &[u8]) -> Result<DynamicImage> {
        if bytes.is_empty() {
            return Err(EngineError::Decode("empty input".into()));
        }

        if let Ok(img) = image::load_from_memory_with_format(bytes, ImageFormat::WebP) {
            return Ok(img);
        }

        let format = image::guess_format(bytes)
            .map_err(|e| EngineError::Decode(format!("unrecognised container: {e}")))?;
        if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
            return Err(EngineError::Decode(format!(
                "unsupported container {format:?}; expected WebP, PNG or JPEG"
            )));
        }
        image::load_from_memory_with_format(bytes, format)
            .map_err(|e| EngineError::Decode(format!("{format:?} decode failed: {e}")))
    }
}

impl ImageDecoder for ContainerDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<PixelBuffer> {
        let img = Self::load(bytes)?;
        let source = img.color();
        let (width, height) = (img.width(), img.height());
        if width == 0 || height == 0 {
            return Err(EngineError::Decode("image has zero area".into()));
        }

        let buffer = if source.has_alpha() {
            PixelBuffer::new(width, height, 4, img.into_rgba8().into_raw())?
        } else {
            PixelBuffer::new(width, height, 3, img.into_rgb8().into_raw())?
        };
        debug!(
            width,
            height,
            source = ?source,
            channels = buffer.channels,
            "Decoded input image"
        );
        Ok(buffer)
    }
}

/// Encode raw engine output as PNG.
pub fn encode_png(buffer: &PixelBuffer) -> Result<Vec<u8>> {
    let color = match buffer.channels {
        3 => ExtendedColorType::Rgb8,
        4 => ExtendedColorType::Rgba8,
        n => {
            return Err(EngineError::Process(format!(
                "cannot encode {n}-channel output as PNG"
            )));
        }
    };
    let mut out = Cursor::new(Vec::new());
    PngEncoder::new(&mut out)
        .write_image(&buffer.data, buffer.width, buffer.height, color)
        .map_err(|e| EngineError::Process(format!("PNG encode failed: {e}")))?;
    Ok(out.into_inner())
}

/// Encode and write `buffer` to `path`.
pub fn write_png(path: &Path, buffer: &PixelBuffer) -> Result<()> {
    let bytes = encode_png(buffer)?;
    std::fs::write(path, bytes).map_err(|e| {
        EngineError::Process(format!("failed to write {}: {e}", path.display()))
    })
}
