//! Upscale engine contract, the opaque compute unit the registry owns.
//!
//! Every engine implementation must satisfy:
//!
//! 1. **Exclusive ownership**: an engine lives inside exactly one registry
//!    entry.  Callers only ever borrow it for the duration of one
//!    `process()` call.
//!
//! 2. **No reentrancy assumed**: `process()` takes `&mut self`; the registry
//!    serialises calls on the same instance.
//!
//! 3. **Deterministic cleanup**: dropping the engine releases every resource
//!    it holds.  The registry drops engines before decrementing the GPU
//!    context refcount, so device memory is gone before the context is.

use crate::codec_traits::PixelBuffer;
use crate::error::Result;
use crate::types::{EngineParams, ModelAssets};

/// A loaded super-resolution model bound to one configuration.
pub trait UpscaleEngine: Send {
    /// Read the `.param` / `.bin` pair and upload weights.
    ///
    /// Called exactly once, before the engine becomes visible to callers.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Load`](crate::error::EngineError::Load) if the
    /// assets are rejected.
    fn load(&mut self, assets: &ModelAssets) -> Result<()>;

    /// Upscale one decoded image.
    ///
    /// # Output contract
    ///
    /// - Dimensions are `(input.width × scale, input.height × scale)`.
    /// - Channel count equals the input's.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Process`](crate::error::EngineError::Process) on
    /// inference failure.  The engine must stay usable afterwards.
    fn process(&mut self, input: &PixelBuffer) -> Result<PixelBuffer>;

    /// Parameters the engine was constructed with.
    fn params(&self) -> &EngineParams;
}

/// Constructs unloaded engines for the registry's loader.
pub trait EngineFactory: Send + Sync {
    fn create(&self, params: EngineParams) -> Result<Box<dyn UpscaleEngine>>;
}
