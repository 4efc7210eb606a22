//! Engine registry: at most one live engine per [`ParameterKey`].
//!
//! # Locking
//!
//! One structural mutex guards both maps.  It is held only long enough to
//! check for an entry, claim the right to build a missing one, or commit /
//! detach an entry.  Engine loads run outside it, so a slow load for one key
//! never stalls lookups for another.  A second `get_or_create` for a key that
//! is still loading waits on that load's [`PendingLoad`] instead of building
//! again.
//!
//! GPU context `acquire` / `release` run after the structural lock is
//! dropped, so the two locks are never nested and a slow driver init only
//! holds up requests for its own key.  Each entry's engine sits behind its own mutex, which
//! serialises `process` calls on one engine and lets `remove` wait out an
//! in-flight call before disposing.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::backend::UpscaleEngine;
use crate::codec_traits::PixelBuffer;
use crate::context::GpuContextManager;
use crate::error::{EngineError, Result};
use crate::types::{Handle, ParameterKey};

// ─── Entries ────────────────────────────────────────────────────────────────

struct EngineEntry {
    handle: Handle,
    key: ParameterKey,
    /// `None` once the entry has been removed and its engine disposed.
    engine: Mutex<Option<Box<dyn UpscaleEngine>>>,
}

/// Outcome of one in-flight construction, shared with concurrent requesters.
struct PendingLoad {
    outcome: Mutex<Option<Result<Handle>>>,
    done: Condvar,
}

impl PendingLoad {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        })
    }

    fn complete(&self, outcome: Result<Handle>) {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> Result<Handle> {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = self.done.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

enum Slot {
    Loading(Arc<PendingLoad>),
    Ready(Arc<EngineEntry>),
}

#[derive(Default)]
struct RegistryState {
    by_key: HashMap<ParameterKey, Slot>,
    by_handle: HashMap<Handle, ParameterKey>,
}

// ─── Lease ──────────────────────────────────────────────────────────────────

/// Borrowed access to a live engine, valid for the calls made through it.
///
/// Do not hold a lease across requests: the registry may dispose the engine
/// at any time, after which the lease reports [`EngineError::NotFound`].
pub struct EngineLease {
    entry: Arc<EngineEntry>,
}

impl EngineLease {
    pub fn handle(&self) -> Handle {
        self.entry.handle
    }

    pub fn key(&self) -> &ParameterKey {
        &self.entry.key
    }

    /// Run the engine on `input`.
    ///
    /// Waits for any other call on the same engine to finish first.  A panic
    /// inside the engine is reported as [`EngineError::PanicRecovered`] and
    /// leaves the entry usable.
    pub fn process(&self, input: &PixelBuffer) -> Result<PixelBuffer> {
        let mut guard = self
            .entry
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let engine = guard
            .as_mut()
            .ok_or(EngineError::NotFound(self.entry.handle))?;
        catch_unwind(AssertUnwindSafe(|| engine.process(input)))
            .unwrap_or_else(|payload| Err(EngineError::from_panic("engine process", payload.as_ref())))
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Deduplicating cache of loaded engines.
pub struct EngineRegistry {
    gpu: Arc<GpuContextManager>,
    state: Mutex<RegistryState>,
    /// Next handle value.  Only advanced when an entry is committed.
    next_handle: AtomicU64,
}

impl EngineRegistry {
    pub fn new(gpu: Arc<GpuContextManager>) -> Self {
        Self {
            gpu,
            state: Mutex::new(RegistryState::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn gpu(&self) -> &Arc<GpuContextManager> {
        &self.gpu
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the handle of the engine for `key`, building it with `loader`
    /// on a miss.
    ///
    /// On a hit the loader is not invoked.  Concurrent callers for a key that
    /// is being built wait for that build and share its outcome.  A failed
    /// build leaves no entry behind and returns any GPU reference it took.
    pub fn get_or_create<F>(&self, key: ParameterKey, loader: F) -> Result<Handle>
    where
        F: FnOnce(&ParameterKey) -> Result<Box<dyn UpscaleEngine>>,
    {
        key.validate()?;

        let pending = {
            let mut state = self.lock();
            match state.by_key.get(&key) {
                Some(Slot::Ready(entry)) => {
                    debug!(handle = %entry.handle, key = %key, "Engine cache hit");
                    return Ok(entry.handle);
                }
                Some(Slot::Loading(pending)) => pending.clone(),
                None => {
                    if !state.by_key.is_empty() {
                        warn!(
                            live = state.by_key.len(),
                            key = %key,
                            "Loading another engine while others are live; \
multiple large models raise memory pressure"
                        );
                    }
                    let pending = PendingLoad::new();
                    state
                        .by_key
                        .insert(key.clone(), Slot::Loading(pending.clone()));
                    drop(state);
                    return self.build(key, pending, loader);
                }
            }
        };

        debug!(key = %key, "Waiting for in-flight engine load");
        pending.wait()
    }

    fn build<F>(&self, key: ParameterKey, pending: Arc<PendingLoad>, loader: F) -> Result<Handle>
    where
        F: FnOnce(&ParameterKey) -> Result<Box<dyn UpscaleEngine>>,
    {
        let constructed = self.construct(&key, loader);

        let outcome = {
            let mut state = self.lock();
            match constructed {
                Ok(engine) => {
                    let handle = Handle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
                    let entry = Arc::new(EngineEntry {
                        handle,
                        key: key.clone(),
                        engine: Mutex::new(Some(engine)),
                    });
                    state.by_handle.insert(handle, key.clone());
                    state.by_key.insert(key.clone(), Slot::Ready(entry));
                    info!(handle = %handle, key = %key, live = state.by_handle.len(), "Engine created");
                    Ok(handle)
                }
                Err(err) => {
                    state.by_key.remove(&key);
                    warn!(key = %key, error = %err, code = err.error_code(), "Engine load failed");
                    Err(err)
                }
            }
        };

        pending.complete(outcome.clone());
        outcome
    }

    /// Take a GPU reference if needed and run the loader, returning the
    /// reference on any failure.
    ///
    /// Must not unwind: the caller still has to resolve the `Loading` slot.
    fn construct<F>(&self, key: &ParameterKey, loader: F) -> Result<Box<dyn UpscaleEngine>>
    where
        F: FnOnce(&ParameterKey) -> Result<Box<dyn UpscaleEngine>>,
    {
        let gpu_backed = key.device().is_gpu();
        if gpu_backed {
            // A panicking driver init leaves the refcount untouched.
            catch_unwind(AssertUnwindSafe(|| self.gpu.acquire())).unwrap_or_else(|payload| {
                Err(EngineError::from_panic("GPU context init", payload.as_ref()))
            })?;
        }

        let loaded = catch_unwind(AssertUnwindSafe(|| loader(key)))
            .unwrap_or_else(|payload| Err(EngineError::from_panic("engine load", payload.as_ref())));

        if loaded.is_err() && gpu_backed {
            let rollback = catch_unwind(AssertUnwindSafe(|| self.gpu.release())).unwrap_or_else(
                |payload| Err(EngineError::from_panic("GPU context teardown", payload.as_ref())),
            );
            if let Err(err) = rollback {
                error!(error = %err, "Failed to roll back GPU reference after load failure");
            }
        }
        loaded
    }

    /// Borrow the engine behind `handle`.
    pub fn lookup(&self, handle: Handle) -> Result<EngineLease> {
        let state = self.lock();
        let key = state
            .by_handle
            .get(&handle)
            .ok_or(EngineError::NotFound(handle))?;
        match state.by_key.get(key) {
            Some(Slot::Ready(entry)) if entry.handle == handle => Ok(EngineLease {
                entry: entry.clone(),
            }),
            _ => Err(EngineError::NotFound(handle)),
        }
    }

    /// Detach and dispose the entry behind `handle`.
    ///
    /// Returns `Ok(false)` for unknown or already-removed handles.  When this
    /// returns, the engine has been dropped and any GPU reference returned.
    pub fn remove(&self, handle: Handle) -> Result<bool> {
        let entry = {
            let mut state = self.lock();
            let Some(key) = state.by_handle.remove(&handle) else {
                debug!(handle = %handle, "Remove of unknown handle ignored");
                return Ok(false);
            };
            match state.by_key.remove(&key) {
                Some(Slot::Ready(entry)) if entry.handle == handle => entry,
                other => {
                    if let Some(slot) = other {
                        state.by_key.insert(key.clone(), slot);
                    }
                    error!(handle = %handle, key = %key, "Handle index points at no ready entry");
                    return Err(EngineError::InvariantViolation(format!(
                        "handle {handle} indexed without a ready entry"
                    )));
                }
            }
        };

        let engine = entry
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(engine);
        info!(handle = %handle, key = %entry.key, "Engine disposed");

        if entry.key.device().is_gpu() {
            self.gpu.release()?;
        }
        Ok(true)
    }

    /// Remove every live entry.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for handle in self.handles() {
            if self.remove(handle)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.lock().by_handle.contains_key(&handle)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live handles in allocation order.
    pub fn handles(&self) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self.lock().by_handle.keys().copied().collect();
        handles.sort_unstable();
        handles
    }
}

impl Drop for EngineRegistry {
    fn drop(&mut self) {
        if let Err(err) = self.clear() {
            error!(error = %err, "Engine registry teardown failed");
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
