//! Stub runtime for builds without the CUDA driver.

use upshot_core::context::{GpuInstance, GpuRuntime};
use upshot_core::error::{EngineError, Result};
use upshot_core::types::CPU_ONLY;

/// Reports zero devices; every instance request fails.
#[derive(Debug, Default)]
pub struct CudaRuntime;

impl CudaRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl GpuRuntime for CudaRuntime {
    fn device_count(&self) -> usize {
        0
    }

    fn default_device(&self) -> i32 {
        CPU_ONLY
    }

    fn create_instance(&self) -> Result<Box<dyn GpuInstance>> {
        Err(EngineError::Resource(
            "GPU runtime disabled: rebuild upshot-cuda with --features cuda-runtime".into(),
        ))
    }
}
