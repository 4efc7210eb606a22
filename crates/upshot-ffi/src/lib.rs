#![doc = include_str!("../README.md")]

use std::cell::{Cell, RefCell};
use std::ffi::{CStr, CString, c_char};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::OnceLock;

use tracing::warn;
use tracing_subscriber::EnvFilter;

use upshot_core::error::{EngineError, Result};
use upshot_core::types::Handle;
use upshot_runtime::{UpscaleConfig, Upscaler};

/// Sentinel for "argument not supplied".
pub const UPSHOT_ABSENT: i32 = i32::MIN;

static UPSCALER: OnceLock<Upscaler> = OnceLock::new();

thread_local! {
    static LAST_CODE: Cell<i32> = const { Cell::new(0) };
    static LAST_MESSAGE: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn upscaler() -> &'static Upscaler {
    UPSCALER.get_or_init(Upscaler::with_defaults)
}

fn clear_error() {
    LAST_CODE.with(|c| c.set(0));
    LAST_MESSAGE.with(|m| m.borrow_mut().take());
}

fn record_error(err: &EngineError) -> i32 {
    let code = err.error_code() as i32;
    LAST_CODE.with(|c| c.set(code));
    let message = CString::new(err.to_string().replace('\0', " ")).ok();
    LAST_MESSAGE.with(|m| *m.borrow_mut() = message);
    code
}

/// Run `f` with panics contained, recording any failure for the calling
/// thread.  Returns the error code on failure.
fn guarded<T>(stage: &'static str, f: impl FnOnce() -> Result<T>) -> std::result::Result<T, i32> {
    clear_error();
    let outcome = catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(EngineError::from_panic(stage, payload.as_ref())));
    outcome.map_err(|err| {
        if !err.is_recoverable() {
            warn!(stage, code = err.error_code(), error = %err, "FFI call failed");
        }
        record_error(&err)
    })
}

fn optional(value: i32) -> Option<i32> {
    (value != UPSHOT_ABSENT).then_some(value)
}

fn handle_from(raw: i64) -> Handle {
    Handle::from_raw(u64::try_from(raw).unwrap_or(0))
}

/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn read_str(ptr: *const c_char, what: &str) -> Result<Option<String>> {
    if ptr.is_null() {
        return Ok(None);
    }
    // SAFETY: non-null and NUL-terminated per the caller contract.
    let raw = unsafe { CStr::from_ptr(ptr) };
    raw.to_str()
        .map(|s| Some(s.to_string()))
        .map_err(|_| EngineError::Configuration(format!("{what} is not valid UTF-8")))
}

/// Install a stderr `tracing` subscriber filtered by `RUST_LOG`.
///
/// Returns 0, or 1 if a subscriber was already installed.
#[unsafe(no_mangle)]
pub extern "C" fn upshot_init_logging() -> i32 {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
    i32::from(installed.is_err())
}

/// Initialise (or reuse) an engine.  Returns a positive handle or a negated
/// error code.
///
/// # Safety
///
/// `model_root` must point to a NUL-terminated string.  `model_family` must
/// be null or point to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn upshot_initialize(
    model_root: *const c_char,
    noise: i32,
    scale: i32,
    syncgap: i32,
    model_family: *const c_char,
    tta: i32,
    gpu_device: i32,
) -> i64 {
    let outcome = guarded("initialize", || {
        // SAFETY: forwarded caller contract.
        let root = unsafe { read_str(model_root, "model_root") }?
            .ok_or_else(|| EngineError::Configuration("model_root is null".into()))?;
        // SAFETY: forwarded caller contract.
        let family = unsafe { read_str(model_family, "model_family") }?;
        let config = UpscaleConfig {
            noise: optional(noise),
            scale: optional(scale),
            syncgap: optional(syncgap),
            model_family: family,
            tta: (tta >= 0).then_some(tta != 0),
            gpu_device: optional(gpu_device),
            ..UpscaleConfig::new(root)
        };
        let handle = upscaler().initialize(&config)?;
        i64::try_from(handle.get())
            .map_err(|_| EngineError::InvariantViolation(format!("handle {handle} exceeds i64")))
    });
    outcome.unwrap_or_else(|code| -i64::from(code))
}

/// Decode `data` and upscale it with the engine behind `handle`.
///
/// On success returns a buffer of `*out_len` bytes holding
/// `*out_width × *out_height × *out_channels` interleaved pixels, to be freed
/// with [`upshot_buffer_free`].  On failure returns null.
///
/// # Safety
///
/// `data` must point to `len` readable bytes.  Each `out_*` pointer must be
/// null or valid for a write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn upshot_process(
    handle: i64,
    data: *const u8,
    len: usize,
    out_len: *mut usize,
    out_width: *mut u32,
    out_height: *mut u32,
    out_channels: *mut u32,
) -> *mut u8 {
    let outcome = guarded("process", || {
        let bytes: &[u8] = if data.is_null() || len == 0 {
            &[]
        } else {
            // SAFETY: `data` points to `len` readable bytes per the caller contract.
            unsafe { std::slice::from_raw_parts(data, len) }
        };
        upscaler().process(handle_from(handle), bytes)
    });
    let Ok(output) = outcome else {
        return ptr::null_mut();
    };

    // SAFETY: each pointer is null or valid for a write per the caller contract.
    unsafe {
        if !out_width.is_null() {
            *out_width = output.width;
        }
        if !out_height.is_null() {
            *out_height = output.height;
        }
        if !out_channels.is_null() {
            *out_channels = output.channels;
        }
    }
    let boxed = output.into_bytes().into_boxed_slice();
    // SAFETY: as above.
    unsafe {
        if !out_len.is_null() {
            *out_len = boxed.len();
        }
    }
    Box::into_raw(boxed).cast::<u8>()
}

/// Free a buffer returned by [`upshot_process`].
///
/// # Safety
///
/// `ptr` and `len` must come from one `upshot_process` call, and the buffer
/// must not be freed twice.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn upshot_buffer_free(ptr: *mut u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: reconstructs the boxed slice leaked by `upshot_process`.
    drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, len)) });
}

/// Release `handle`.  Returns 1 if an engine was disposed, 0 if the handle
/// was unknown or already released, or a negated error code.
#[unsafe(no_mangle)]
pub extern "C" fn upshot_release(handle: i64) -> i32 {
    match guarded("release", || upscaler().release(handle_from(handle))) {
        Ok(removed) => i32::from(removed),
        Err(code) => -code,
    }
}

/// Error code of the calling thread's last failed call, 0 if it succeeded.
#[unsafe(no_mangle)]
pub extern "C" fn upshot_last_error_code() -> i32 {
    LAST_CODE.with(Cell::get)
}

/// Message of the calling thread's last failure, or null.  Valid until the
/// next call on the same thread.
#[unsafe(no_mangle)]
pub extern "C" fn upshot_last_error_message() -> *const c_char {
    LAST_MESSAGE.with(|m| m.borrow().as_ref().map_or(ptr::null(), |s| s.as_ptr()))
}

/// Number of live engines.
#[unsafe(no_mangle)]
pub extern "C" fn upshot_live_engines() -> u64 {
    upscaler().registry().len() as u64
}
