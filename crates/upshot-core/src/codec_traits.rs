//! Image codec contract used across crate boundaries.
//!
//! Decoding is an external collaborator: the host service calls it, engines
//! consume its output, and neither cares which container the bytes came in.

use crate::error::{EngineError, Result};

/// Interleaved 8-bit pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    /// 3 (RGB) or 4 (RGBA) after decoder normalisation.
    pub channels: u32,
    pub data: Vec<u8>,
}

impl PixelBuffer {
    /// Wrap raw pixels, checking the buffer length against the geometry.
    pub fn new(width: u32, height: u32, channels: u32, data: Vec<u8>) -> Result<Self> {
        let need = width as usize * height as usize * channels as usize;
        if data.len() != need {
            return Err(EngineError::Decode(format!(
                "pixel buffer size mismatch: {width}x{height}x{channels} needs {need} bytes, have {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Zero-filled buffer.
    pub fn zeroed(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![0; width as usize * height as usize * channels as usize],
        }
    }

    #[inline]
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Decodes a compressed image container into [`PixelBuffer`].
pub trait ImageDecoder: Send + Sync {
    /// # Errors
    ///
    /// Returns [`EngineError::Decode`] if the bytes are not a supported
    /// container.
    fn decode(&self, bytes: &[u8]) -> Result<PixelBuffer>;
}
