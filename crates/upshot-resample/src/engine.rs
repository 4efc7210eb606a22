//! Tiled, pre-padded resampling engine.

use std::fs;
use std::path::Path;

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Pixel, RgbImage, RgbaImage};
use tracing::{debug, info};

use upshot_core::backend::{EngineFactory, UpscaleEngine};
use upshot_core::codec_traits::PixelBuffer;
use upshot_core::error::{EngineError, Result};
use upshot_core::types::{EngineParams, ModelAssets};

/// First line of every network description file.
pub const PARAM_MAGIC: &str = "7767517";

/// Blur sigma per denoise level.
const DENOISE_SIGMA_PER_LEVEL: f32 = 0.4;

type Plane<P> = ImageBuffer<P, Vec<u8>>;

/// Host-memory engine.  `syncgap` has no effect: tiles never exchange state.
pub struct ResampleEngine {
    params: EngineParams,
    weights_len: Option<usize>,
}

impl ResampleEngine {
    pub fn new(params: EngineParams) -> Self {
        Self {
            params,
            weights_len: None,
        }
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.weights_len.is_some()
    }

    fn read_asset(path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| EngineError::Load(format!("{}: {e}", path.display())))
    }

    fn run<P>(&self, src: Plane<P>) -> Plane<P>
    where
        P: Pixel<Subpixel = u8> + 'static,
    {
        let key = &self.params.key;
        let src = if key.noise() > 0 {
            imageops::blur(&src, key.noise() as f32 * DENOISE_SIGMA_PER_LEVEL)
        } else {
            src
        };

        let forward = self.upscale_tiled(&src);
        if !key.tta() {
            return forward;
        }

        // Test-time augmentation: average with the mirrored pass.
        let mirrored = imageops::flip_horizontal(&self.upscale_tiled(&imageops::flip_horizontal(&src)));
        let mut out = forward;
        for (dst, alt) in out.pixels_mut().zip(mirrored.pixels()) {
            for (a, b) in dst.channels_mut().iter_mut().zip(alt.channels()) {
                *a = ((u16::from(*a) + u16::from(*b) + 1) / 2) as u8;
            }
        }
        out
    }

    fn upscale_tiled<P>(&self, src: &Plane<P>) -> Plane<P>
    where
        P: Pixel<Subpixel = u8> + 'static,
    {
        let scale = self.params.key.scale();
        let tile = self.params.tile_size.max(1);
        let pad = self.params.prepadding;
        let (w, h) = src.dimensions();
        let mut out: Plane<P> = ImageBuffer::new(w * scale, h * scale);

        for ty in (0..h).step_by(tile as usize) {
            for tx in (0..w).step_by(tile as usize) {
                let tw = tile.min(w - tx);
                let th = tile.min(h - ty);

                let x0 = tx.saturating_sub(pad);
                let y0 = ty.saturating_sub(pad);
                let x1 = (tx + tw + pad).min(w);
                let y1 = (ty + th + pad).min(h);

                let padded = imageops::crop_imm(src, x0, y0, x1 - x0, y1 - y0).to_image();
                let scaled = imageops::resize(
                    &padded,
                    (x1 - x0) * scale,
                    (y1 - y0) * scale,
                    FilterType::CatmullRom,
                );
                let inner = imageops::crop_imm(
                    &scaled,
                    (tx - x0) * scale,
                    (ty - y0) * scale,
                    tw * scale,
                    th * scale,
                )
                .to_image();
                imageops::replace(&mut out, &inner, i64::from(tx * scale), i64::from(ty * scale));
            }
        }
        out
    }
}

impl UpscaleEngine for ResampleEngine {
    fn load(&mut self, assets: &ModelAssets) -> Result<()> {
        let param = Self::read_asset(&assets.param_path)?;
        let header = param
            .split(|&b| b == b'\n')
            .next()
            .map(|line| String::from_utf8_lossy(line).trim().to_string())
            .unwrap_or_default();
        if header != PARAM_MAGIC {
            return Err(EngineError::Load(format!(
                "{}: bad network header '{header}'",
                assets.param_path.display()
            )));
        }

        let weights = Self::read_asset(&assets.model_path)?;
        if weights.is_empty() {
            return Err(EngineError::Load(format!(
                "{}: empty weight file",
                assets.model_path.display()
            )));
        }

        info!(
            key = %self.params.key,
            tile_size = self.params.tile_size,
            prepadding = self.params.prepadding,
            weights_bytes = weights.len(),
            "Resample engine loaded"
        );
        self.weights_len = Some(weights.len());
        Ok(())
    }

    fn process(&mut self, input: &PixelBuffer) -> Result<PixelBuffer> {
        if !self.is_loaded() {
            return Err(EngineError::Process("engine has no weights loaded".into()));
        }
        if input.width == 0 || input.height == 0 {
            return Err(EngineError::Process("input has zero area".into()));
        }

        let (w, h) = (input.width, input.height);
        let shape_err = || EngineError::Process(format!("{w}x{h}x{} buffer has the wrong length", input.channels));
        let (data, channels) = match input.channels {
            3 => {
                let src = RgbImage::from_raw(w, h, input.data.clone()).ok_or_else(shape_err)?;
                (self.run(src).into_raw(), 3)
            }
            4 => {
                let src = RgbaImage::from_raw(w, h, input.data.clone()).ok_or_else(shape_err)?;
                (self.run(src).into_raw(), 4)
            }
            n => {
                return Err(EngineError::Process(format!(
                    "unsupported channel count {n}; expected 3 or 4"
                )));
            }
        };

        let scale = self.params.key.scale();
        debug!(width = w, height = h, channels, scale, "Resample pass complete");
        PixelBuffer::new(w * scale, h * scale, channels, data)
    }

    fn params(&self) -> &EngineParams {
        &self.params
    }
}

/// Builds [`ResampleEngine`]s for the registry's loader.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResampleFactory;

impl EngineFactory for ResampleFactory {
    fn create(&self, params: EngineParams) -> Result<Box<dyn UpscaleEngine>> {
        Ok(Box::new(ResampleEngine::new(params)))
    }
}
