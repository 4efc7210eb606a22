//! CUDA driver runtime.
//!
//! Enumeration goes through `cuDeviceGetCount` without creating a context.
//! The instance owns one primary context per device it has been asked about;
//! dropping the instance drops every `CudaDevice`, which releases them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use cudarc::driver::{CudaDevice, DriverError, result};
use tracing::{debug, info, warn};

use upshot_core::context::{DeviceBudget, GpuInstance, GpuRuntime, GpuVendor};
use upshot_core::error::{EngineError, Result};
use upshot_core::types::CPU_ONLY;

const MIB: usize = 1024 * 1024;

fn driver_err(what: &str, err: DriverError) -> EngineError {
    EngineError::Resource(format!("{what}: {err:?}"))
}

/// Runtime backed by the CUDA driver API.
#[derive(Debug, Default)]
pub struct CudaRuntime;

impl CudaRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl GpuRuntime for CudaRuntime {
    fn device_count(&self) -> usize {
        if let Err(err) = result::init() {
            debug!(error = ?err, "CUDA driver unavailable");
            return 0;
        }
        match CudaDevice::count() {
            Ok(count) => count.max(0) as usize,
            Err(err) => {
                warn!(error = ?err, "cuDeviceGetCount failed");
                0
            }
        }
    }

    fn default_device(&self) -> i32 {
        if self.device_count() > 0 { 0 } else { CPU_ONLY }
    }

    fn create_instance(&self) -> Result<Box<dyn GpuInstance>> {
        result::init().map_err(|e| driver_err("cuInit failed", e))?;
        let count = CudaDevice::count().map_err(|e| driver_err("cuDeviceGetCount failed", e))?;
        if count <= 0 {
            return Err(EngineError::Resource("no CUDA device visible".into()));
        }
        info!(devices = count, "CUDA driver initialized");
        Ok(Box::new(CudaInstance {
            devices: Mutex::new(HashMap::new()),
        }))
    }
}

struct CudaInstance {
    devices: Mutex<HashMap<u32, Arc<CudaDevice>>>,
}

impl CudaInstance {
    fn device(&self, ordinal: u32) -> Result<Arc<CudaDevice>> {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(dev) = devices.get(&ordinal) {
            return Ok(dev.clone());
        }
        let dev = CudaDevice::new(ordinal as usize)
            .map_err(|e| driver_err(&format!("opening CUDA device {ordinal} failed"), e))?;
        devices.insert(ordinal, dev.clone());
        Ok(dev)
    }
}

impl GpuInstance for CudaInstance {
    fn device_name(&self, ordinal: u32) -> Result<String> {
        self.device(ordinal)?
            .name()
            .map_err(|e| driver_err("cuDeviceGetName failed", e))
    }

    fn device_budget(&self, ordinal: u32) -> Result<DeviceBudget> {
        let dev = self.device(ordinal)?;
        dev.bind_to_thread()
            .map_err(|e| driver_err("binding CUDA context failed", e))?;
        let (free, total) =
            result::mem_get_info().map_err(|e| driver_err("cuMemGetInfo failed", e))?;
        let budget = DeviceBudget {
            vendor: GpuVendor::Nvidia,
            heap_budget_mb: u32::try_from(free / MIB).ok(),
            memory_budget_ext_mb: None,
            device_local_heap_mb: (total / MIB) as u64,
        };
        debug!(ordinal, free_mb = free / MIB, total_mb = total / MIB, "CUDA device budget");
        Ok(budget)
    }
}

impl Drop for CudaInstance {
    fn drop(&mut self) {
        let devices = self.devices.get_mut().unwrap_or_else(PoisonError::into_inner);
        debug!(devices = devices.len(), "Releasing CUDA device contexts");
        devices.clear();
    }
}
