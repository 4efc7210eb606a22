//! End-to-end initialize → process → release with the resample engine.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use upshot_core::backend::{EngineFactory, UpscaleEngine};
use upshot_core::codec_traits::PixelBuffer;
use upshot_core::context::{DeviceBudget, GpuInstance, GpuRuntime, GpuVendor};
use upshot_core::error::{EngineError, Result};
use upshot_core::types::{EngineParams, Handle};
use upshot_image::{ContainerDecoder, encode_png};
use upshot_resample::{PARAM_MAGIC, ResampleFactory};
use upshot_runtime::{UpscaleConfig, Upscaler};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}_{}_{nanos}", std::process::id()));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn write_model(root: &Path, family: &str, stem: &str) {
    let dir = root.join(family);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{stem}.param")), format!("{PARAM_MAGIC}\n1 1\n")).unwrap();
    fs::write(dir.join(format!("{stem}.bin")), [0u8; 64]).unwrap();
}

fn model_root() -> PathBuf {
    let root = unique_temp_dir("upshot_models");
    write_model(&root, "models-se", "up2x-conservative");
    write_model(&root, "models-se", "up3x-no-denoise");
    write_model(&root, "models-nose", "up2x-no-denoise");
    root
}

fn png(width: u32, height: u32, channels: u32) -> Vec<u8> {
    let data = (0..width * height * channels).map(|i| (i % 251) as u8).collect();
    encode_png(&PixelBuffer::new(width, height, channels, data).unwrap()).unwrap()
}

fn cpu(root: &Path) -> UpscaleConfig {
    UpscaleConfig {
        gpu_device: Some(-1),
        ..UpscaleConfig::new(root)
    }
}

// ── Fakes ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeGpu {
    inits: AtomicUsize,
    teardowns: Arc<AtomicUsize>,
    budget_mb: u32,
}

struct FakeInstance {
    teardowns: Arc<AtomicUsize>,
    budget_mb: u32,
}

impl Drop for FakeInstance {
    fn drop(&mut self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

impl GpuInstance for FakeInstance {
    fn device_name(&self, ordinal: u32) -> Result<String> {
        Ok(format!("fake-{ordinal}"))
    }

    fn device_budget(&self, _ordinal: u32) -> Result<DeviceBudget> {
        Ok(DeviceBudget {
            vendor: GpuVendor::Amd,
            heap_budget_mb: Some(self.budget_mb),
            memory_budget_ext_mb: None,
            device_local_heap_mb: 8192,
        })
    }
}

impl GpuRuntime for FakeGpu {
    fn device_count(&self) -> usize {
        1
    }

    fn default_device(&self) -> i32 {
        0
    }

    fn create_instance(&self) -> Result<Box<dyn GpuInstance>> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeInstance {
            teardowns: self.teardowns.clone(),
            budget_mb: self.budget_mb,
        }))
    }
}

/// Wraps the resample factory, recording every engine it builds.
#[derive(Default)]
struct CountingFactory {
    created: AtomicUsize,
    tiles: std::sync::Mutex<Vec<u32>>,
}

impl EngineFactory for CountingFactory {
    fn create(&self, params: EngineParams) -> Result<Box<dyn UpscaleEngine>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.tiles.lock().unwrap().push(params.tile_size);
        ResampleFactory.create(params)
    }
}

fn gpu_upscaler(budget_mb: u32) -> (Upscaler, Arc<FakeGpu>, Arc<CountingFactory>) {
    let gpu = Arc::new(FakeGpu {
        budget_mb,
        ..FakeGpu::default()
    });
    let factory = Arc::new(CountingFactory::default());
    let upscaler = Upscaler::new(gpu.clone(), factory.clone(), Arc::new(ContainerDecoder::new()));
    (upscaler, gpu, factory)
}

// ── CPU path ────────────────────────────────────────────────────────────────

#[test]
fn cpu_round_trip_produces_scaled_pixels() {
    let root = model_root();
    let up = Upscaler::with_defaults();
    let handle = up.initialize(&cpu(&root)).expect("initialize");

    let out = up.process(handle, &png(12, 7, 3)).expect("process");
    assert_eq!((out.width, out.height, out.channels), (24, 14, 3));
    assert_eq!(out.data.len(), 24 * 14 * 3);

    let rgba = up.process(handle, &png(5, 5, 4)).expect("rgba process");
    assert_eq!(rgba.channels, 4);

    assert!(up.release(handle).unwrap());
    assert!(!up.release(handle).unwrap());
    assert!(up.registry().is_empty());
    fs::remove_dir_all(root).ok();
}

#[test]
fn identical_configs_share_one_engine() {
    let root = model_root();
    let up = Upscaler::with_defaults();
    let a = up.initialize(&cpu(&root)).unwrap();
    let b = up.initialize(&cpu(&root)).unwrap();
    assert_eq!(a, b);

    let other = UpscaleConfig {
        scale: Some(3),
        noise: Some(0),
        ..cpu(&root)
    };
    let c = up.initialize(&other).unwrap();
    assert_ne!(a, c);
    assert_eq!(up.registry().len(), 2);

    up.release(a).unwrap();
    let out = up.process(c, &png(4, 4, 3)).expect("other handle unaffected");
    assert_eq!(out.width, 12);
    fs::remove_dir_all(root).ok();
}

#[test]
fn nose_family_forces_syncgap_and_rejects_scale_three() {
    let root = model_root();
    let up = Upscaler::with_defaults();
    let nose = UpscaleConfig {
        model_family: Some("models-nose".into()),
        noise: Some(0),
        syncgap: Some(2),
        ..cpu(&root)
    };
    let handle = up.initialize(&nose).expect("nose 2x");
    assert_eq!(up.resolve(&nose).unwrap().key.syncgap(), 0);
    up.release(handle).unwrap();

    let bad = UpscaleConfig {
        scale: Some(3),
        ..nose
    };
    let err = up.initialize(&bad).unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));
    assert!(up.registry().is_empty());
    fs::remove_dir_all(root).ok();
}

#[test]
fn missing_assets_fail_before_any_state_change() {
    let root = model_root();
    let (up, gpu, factory) = gpu_upscaler(1500);
    let cfg = UpscaleConfig {
        scale: Some(4),
        ..UpscaleConfig::new(&root)
    };
    let err = up.initialize(&cfg).unwrap_err();
    match &err {
        EngineError::AssetMissing { path } => assert!(path.ends_with("models-se/up4x-conservative.param")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.error_code(), 101);
    assert_eq!(gpu.inits.load(Ordering::SeqCst), 0);
    assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    assert!(up.registry().is_empty());
    fs::remove_dir_all(root).ok();
}

#[test]
fn unknown_handle_and_bad_bytes() {
    let root = model_root();
    let up = Upscaler::with_defaults();
    let err = up.process(Handle::from_raw(9_999), b"garbage").unwrap_err();
    assert!(err.is_not_found());

    let handle = up.initialize(&cpu(&root)).unwrap();
    let err = up.process(handle, b"garbage").unwrap_err();
    assert!(matches!(err, EngineError::Decode(_)));
    assert!(err.is_recoverable());
    up.process(handle, &png(3, 3, 3)).expect("handle survives a decode failure");
    up.release(handle).unwrap();
    assert!(up.process(handle, &png(3, 3, 3)).unwrap_err().is_not_found());
    fs::remove_dir_all(root).ok();
}

// ── GPU path (fake runtime) ─────────────────────────────────────────────────

#[test]
fn gpu_tile_follows_budget_and_context_follows_entries() {
    let root = model_root();
    let (up, gpu, factory) = gpu_upscaler(1500);

    let a = up.initialize(&UpscaleConfig::new(&root)).unwrap();
    let b = up
        .initialize(&UpscaleConfig {
            scale: Some(3),
            noise: Some(0),
            ..UpscaleConfig::new(&root)
        })
        .unwrap();
    let c = up.initialize(&cpu(&root)).unwrap();

    assert_eq!(*factory.tiles.lock().unwrap(), vec![400, 200, 400]);
    assert_eq!(up.gpu().ref_count(), 2);
    assert_eq!(gpu.inits.load(Ordering::SeqCst), 1);

    up.release(a).unwrap();
    up.release(c).unwrap();
    assert!(up.gpu().is_active());
    up.release(b).unwrap();
    assert!(!up.gpu().is_active());
    assert_eq!(gpu.teardowns.load(Ordering::SeqCst), 1);

    let again = up.initialize(&UpscaleConfig::new(&root)).unwrap();
    assert!(again > b, "handles are never reused");
    assert_eq!(gpu.inits.load(Ordering::SeqCst), 2);
    fs::remove_dir_all(root).ok();
}

#[test]
fn low_budget_selects_smallest_tile() {
    let root = model_root();
    let (up, _gpu, factory) = gpu_upscaler(150);
    up.initialize(&UpscaleConfig::new(&root)).unwrap();
    assert_eq!(*factory.tiles.lock().unwrap(), vec![32]);
    fs::remove_dir_all(root).ok();
}

#[test]
fn concurrent_initialize_builds_once() {
    let root = model_root();
    let (up, gpu, factory) = gpu_upscaler(1500);
    let up = Arc::new(up);
    let barrier = Arc::new(Barrier::new(6));

    let workers: Vec<_> = (0..6)
        .map(|_| {
            let up = up.clone();
            let barrier = barrier.clone();
            let cfg = UpscaleConfig::new(&root);
            thread::spawn(move || {
                barrier.wait();
                let handle = up.initialize(&cfg).unwrap();
                up.process(handle, &png(6, 6, 3)).unwrap();
                handle
            })
        })
        .collect();
    let handles: Vec<Handle> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert!(handles.iter().all(|h| *h == handles[0]));
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    assert_eq!(gpu.inits.load(Ordering::SeqCst), 1);
    assert_eq!(up.gpu().ref_count(), 1);
    fs::remove_dir_all(root).ok();
}
