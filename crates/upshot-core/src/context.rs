//! Process-wide GPU context, reference counted, lazily created and torn down
//! when the last GPU-backed engine goes away.
//!
//! # Refcount invariant
//!
//! `ref_count()` equals the number of live GPU-backed registry entries (plus
//! any entry currently being constructed).  The runtime's global instance is
//! created exactly on the 0→1 transition and dropped exactly on 1→0.  Both
//! transitions happen inside one mutex, so concurrent `acquire`/`release`
//! never double-initialise or leak the instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, info};

use crate::error::{EngineError, Result};

// ─── Device reporting ───────────────────────────────────────────────────────

/// GPU vendor, derived from the PCI vendor id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Arm,
    Qualcomm,
    Apple,
    Other(u32),
}

impl GpuVendor {
    pub fn from_pci_id(id: u32) -> Self {
        match id {
            0x10de => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x13b5 => Self::Arm,
            0x5143 => Self::Qualcomm,
            0x106b => Self::Apple,
            other => Self::Other(other),
        }
    }

    /// Vendors whose heap-budget query is unreliable; tile sizing derives an
    /// effective budget from the memory-budget extension or heap size instead.
    #[inline]
    pub fn uses_direct_budget(self) -> bool {
        matches!(self, Self::Qualcomm)
    }
}

/// Memory figures reported for one device, in MiB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceBudget {
    pub vendor: GpuVendor,
    /// Driver heap budget.  `None` when the query failed.
    pub heap_budget_mb: Option<u32>,
    /// Budget from a memory-budget extension, when the driver exposes one.
    pub memory_budget_ext_mb: Option<u32>,
    /// Total size of the device-local heap.
    pub device_local_heap_mb: u64,
}

// ─── Runtime contract ───────────────────────────────────────────────────────

/// A live, process-wide GPU instance.  Dropping it tears the instance down.
pub trait GpuInstance: Send {
    fn device_name(&self, ordinal: u32) -> Result<String>;
    fn device_budget(&self, ordinal: u32) -> Result<DeviceBudget>;
}

/// Creates the process-wide GPU instance and answers enumeration queries that
/// do not need one.
pub trait GpuRuntime: Send + Sync {
    fn device_count(&self) -> usize;

    /// Platform default device ordinal, or [`CPU_ONLY`](crate::types::CPU_ONLY)
    /// when no GPU is visible.
    fn default_device(&self) -> i32;

    /// Expensive, non-reentrant global initialisation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Resource`] when no compatible device or driver
    /// is available.
    fn create_instance(&self) -> Result<Box<dyn GpuInstance>>;
}

// ─── Context manager ────────────────────────────────────────────────────────

struct ContextState {
    refs: usize,
    instance: Option<Box<dyn GpuInstance>>,
}

/// Owner of the GPU instance.  Shared by `Arc` into the registry.
pub struct GpuContextManager {
    runtime: Arc<dyn GpuRuntime>,
    state: Mutex<ContextState>,
    /// Lifetime count of 0→1 transitions.
    inits: AtomicU64,
}

impl GpuContextManager {
    pub fn new(runtime: Arc<dyn GpuRuntime>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            state: Mutex::new(ContextState {
                refs: 0,
                instance: None,
            }),
            inits: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<dyn GpuRuntime> {
        &self.runtime
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take one reference, initialising the instance on 0→1.
    ///
    /// On failure the refcount is left unchanged.
    pub fn acquire(&self) -> Result<()> {
        let mut state = self.lock();
        if state.refs == 0 {
            let instance = self.runtime.create_instance()?;
            state.instance = Some(instance);
            let generation = self.inits.fetch_add(1, Ordering::Relaxed) + 1;
            info!(generation, "GPU context initialized");
        }
        state.refs += 1;
        Ok(())
    }

    /// Drop one reference, tearing the instance down on 1→0.
    ///
    /// # Errors
    ///
    /// Releasing with no outstanding reference is a caller bug and returns
    /// [`EngineError::InvariantViolation`] without touching the state.
    pub fn release(&self) -> Result<()> {
        let mut state = self.lock();
        if state.refs == 0 {
            error!("GPU context released with refcount already at zero");
            return Err(EngineError::InvariantViolation(
                "GPU context refcount underflow".into(),
            ));
        }
        state.refs -= 1;
        if state.refs == 0 {
            drop(state.instance.take());
            info!("GPU context torn down");
        }
        Ok(())
    }

    /// Diagnostic probe; never use it to decide whether to initialise.
    pub fn is_active(&self) -> bool {
        self.lock().refs > 0
    }

    pub fn ref_count(&self) -> usize {
        self.lock().refs
    }

    pub fn init_count(&self) -> u64 {
        self.inits.load(Ordering::Relaxed)
    }

    /// Query the budget of `ordinal` through the live instance.
    ///
    /// Only valid while at least one reference is held.
    pub fn device_budget(&self, ordinal: u32) -> Result<DeviceBudget> {
        let state = self.lock();
        let instance = state
            .instance
            .as_ref()
            .ok_or_else(|| EngineError::Resource("GPU context is not active".into()))?;
        instance.device_budget(ordinal)
    }

    pub fn device_name(&self, ordinal: u32) -> Result<String> {
        let state = self.lock();
        let instance = state
            .instance
            .as_ref()
            .ok_or_else(|| EngineError::Resource("GPU context is not active".into()))?;
        instance.device_name(ordinal)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
