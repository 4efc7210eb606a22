//! The initialize / process / release service.

use std::sync::Arc;

use tracing::{debug, info, warn};

use upshot_core::backend::{EngineFactory, UpscaleEngine};
use upshot_core::codec_traits::{ImageDecoder, PixelBuffer};
use upshot_core::context::{GpuContextManager, GpuRuntime};
use upshot_core::error::Result;
use upshot_core::registry::EngineRegistry;
use upshot_core::tiling::TileSizeAdvisor;
use upshot_core::types::{DeviceTarget, EngineParams, Handle, ModelAssets, ParameterKey};
use upshot_image::ContainerDecoder;
use upshot_resample::ResampleFactory;

use crate::config::{UpscaleConfig, ValidatedConfig};

/// Owns the engine registry and the collaborators needed to fill it.
///
/// Share it by `Arc`; every method takes `&self` and may be called from any
/// thread.
pub struct Upscaler {
    registry: EngineRegistry,
    factory: Arc<dyn EngineFactory>,
    decoder: Arc<dyn ImageDecoder>,
}

impl Upscaler {
    pub fn new(
        runtime: Arc<dyn GpuRuntime>,
        factory: Arc<dyn EngineFactory>,
        decoder: Arc<dyn ImageDecoder>,
    ) -> Self {
        Self {
            registry: EngineRegistry::new(GpuContextManager::new(runtime)),
            factory,
            decoder,
        }
    }

    /// Build-configured GPU runtime, the resample engine and the container
    /// decoder.
    pub fn with_defaults() -> Self {
        Self::new(
            upshot_cuda::default_runtime(),
            Arc::new(ResampleFactory),
            Arc::new(ContainerDecoder::new()),
        )
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<dyn GpuRuntime> {
        self.registry.gpu().runtime()
    }

    #[inline]
    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    #[inline]
    pub fn gpu(&self) -> &Arc<GpuContextManager> {
        self.registry.gpu()
    }

    /// Validate `config` without touching any state.
    pub fn resolve(&self, config: &UpscaleConfig) -> Result<ValidatedConfig> {
        config.validate(self.runtime().as_ref())
    }

    /// Return the handle of the engine for `config`, loading it on first use.
    ///
    /// Configuration and asset errors are reported before the registry or
    /// the GPU context is touched.
    pub fn initialize(&self, config: &UpscaleConfig) -> Result<Handle> {
        let ValidatedConfig { key, assets } = self.resolve(config)?;
        assets.ensure_present()?;
        self.registry
            .get_or_create(key, |key| self.load_engine(key, &assets))
    }

    fn load_engine(&self, key: &ParameterKey, assets: &ModelAssets) -> Result<Box<dyn UpscaleEngine>> {
        let budget = match key.device() {
            DeviceTarget::Gpu(ordinal) => match self.gpu().device_budget(ordinal) {
                Ok(budget) => Some(budget),
                Err(err) => {
                    warn!(ordinal, error = %err, "Device budget unavailable; using smallest tile");
                    None
                }
            },
            DeviceTarget::Cpu => None,
        };
        let tile_size = TileSizeAdvisor::recommend(key.device(), key.scale(), budget.as_ref());
        let params = EngineParams::new(key.clone(), tile_size);
        info!(
            key = %key,
            tile_size,
            prepadding = params.prepadding,
            heap_budget_mb = ?budget.and_then(|b| b.heap_budget_mb),
            "Loading engine"
        );

        let mut engine = self.factory.create(params)?;
        engine.load(assets)?;
        Ok(engine)
    }

    /// Decode `bytes` and run them through the engine behind `handle`.
    ///
    /// An unknown handle is reported as not-found before the bytes are
    /// looked at.
    pub fn process(&self, handle: Handle, bytes: &[u8]) -> Result<PixelBuffer> {
        let lease = self.registry.lookup(handle)?;
        let input = self.decoder.decode(bytes)?;
        debug!(
            handle = %handle,
            width = input.width,
            height = input.height,
            channels = input.channels,
            "Processing image"
        );
        lease.process(&input)
    }

    /// Dispose the engine behind `handle`.  Returns whether anything was
    /// removed; unknown handles are not an error.
    pub fn release(&self, handle: Handle) -> Result<bool> {
        self.registry.remove(handle)
    }
}
