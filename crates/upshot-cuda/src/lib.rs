#![doc = include_str!("../README.md")]

use std::sync::Arc;

use upshot_core::context::GpuRuntime;

#[cfg(feature = "cuda-runtime")]
mod cuda;
#[cfg(not(feature = "cuda-runtime"))]
#[path = "cuda_stub.rs"]
mod cuda;

pub use cuda::CudaRuntime;

/// The runtime this build was compiled with.
pub fn default_runtime() -> Arc<dyn GpuRuntime> {
    Arc::new(CudaRuntime::new())
}

/// Whether this build talks to a real driver.
pub const fn runtime_enabled() -> bool {
    cfg!(feature = "cuda-runtime")
}
