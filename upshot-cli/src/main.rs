//! upshot CLI entrypoint.
//!
//! ```bash
//! upshot upscale -i photo.png -i scan.webp -o out/ --model-root models --scale 2 --noise 0
//! upshot upscale -i photo.png -o out/ --config upshot.json --json
//! upshot devices --json
//! upshot tile --budget 1500 --scale 2
//! ```

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use upshot_core::context::{DeviceBudget, GpuContextManager, GpuVendor};
use upshot_core::error::{EngineError, Result};
use upshot_core::tiling::{DIRECT_BUDGET_HEAP_DIVISOR, TileSizeAdvisor};
use upshot_core::types::{DeviceTarget, Handle, prepadding_for_scale};
use upshot_image::write_png;
use upshot_runtime::{UpscaleConfig, Upscaler};

#[derive(Parser, Debug)]
#[command(
    name = "upshot",
    version,
    about = "Deduplicating image upscaling engine host",
    arg_required_else_help = true,
    after_help = "Examples:\n  upshot upscale -i in.png -o out/ --model-root models --noise 0\n  upshot devices --json\n  upshot tile --budget 1500 --scale 2 --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upscale one or more images with a shared engine.
    Upscale(UpscaleArgs),
    /// List visible GPU devices, their memory budget and advised tiles.
    Devices(DevicesArgs),
    /// Print the tile size advised for a memory budget.
    Tile(TileArgs),
}

#[derive(Args, Debug, Clone)]
struct UpscaleArgs {
    /// Input image (WebP, PNG or JPEG).  Repeat for several.
    #[arg(short = 'i', long = "input", required = true)]
    inputs: Vec<PathBuf>,

    /// Output directory; files are written as `<stem>_x<scale>.png`.
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Directory holding the model family directories.
    #[arg(long = "model-root")]
    model_root: Option<PathBuf>,

    /// Model family: models-se, models-pro or models-nose.
    #[arg(long = "family")]
    family: Option<String>,

    #[arg(long = "scale")]
    scale: Option<i32>,

    /// -1 conservative, 0 none, 1..=3 denoise strength.
    #[arg(long = "noise", allow_negative_numbers = true)]
    noise: Option<i32>,

    #[arg(long = "syncgap")]
    syncgap: Option<i32>,

    /// Enable test-time augmentation.
    #[arg(long = "tta", default_value_t = false)]
    tta: bool,

    /// GPU ordinal, or -1 for CPU.
    #[arg(long = "gpu", allow_negative_numbers = true)]
    gpu: Option<i32>,

    /// JSON configuration file; flags given on the command line win.
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Emit a machine-readable summary on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct DevicesArgs {
    /// Emit machine-readable JSON on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct TileArgs {
    /// Memory budget in MiB.
    #[arg(long = "budget")]
    budget: u32,

    #[arg(long = "scale", value_parser = clap::value_parser!(u32).range(2..=4))]
    scale: u32,

    /// PCI vendor id, decimal or 0x-prefixed hex.
    #[arg(long = "vendor", value_parser = parse_pci_id)]
    vendor: Option<u32>,

    /// Advise for the CPU instead of a GPU.
    #[arg(long = "cpu", default_value_t = false)]
    cpu: bool,

    /// Emit machine-readable JSON on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

const JSON_SCHEMA_VERSION: u32 = 1;

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Upscale(args) if args.json => Some("upscale"),
        Commands::Devices(args) if args.json => Some("devices"),
        Commands::Tile(args) if args.json => Some("tile"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Upscale(args) => build_runtime().and_then(|rt| rt.block_on(run_upscale(args))),
        Commands::Devices(args) => run_devices(args),
        Commands::Tile(args) => run_tile(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "Command failed");
            }
            std::process::exit(i32::from(err.exit_code()));
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| EngineError::Resource(format!("Failed to build tokio runtime: {e}")))
}

fn parse_pci_id(raw: &str) -> std::result::Result<u32, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid PCI vendor id '{raw}': {e}"))
}

// ─── upscale ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ImageReport {
    input: PathBuf,
    output: PathBuf,
    width: u32,
    height: u32,
    channels: u32,
}

fn build_config(args: &UpscaleArgs) -> Result<UpscaleConfig> {
    let mut config = match &args.config {
        Some(path) => UpscaleConfig::from_json_file(path)?,
        None => UpscaleConfig::default(),
    };
    if let Some(root) = &args.model_root {
        config.model_root = root.clone();
    }
    if config.model_root.as_os_str().is_empty() {
        return Err(EngineError::Configuration(
            "--model-root is required (or model_root in --config)".into(),
        ));
    }
    config.noise = args.noise.or(config.noise);
    config.scale = args.scale.or(config.scale);
    config.syncgap = args.syncgap.or(config.syncgap);
    config.model_family = args.family.clone().or(config.model_family);
    config.gpu_device = args.gpu.or(config.gpu_device);
    if args.tta {
        config.tta = Some(true);
    }
    Ok(config)
}

fn output_path(dir: &Path, input: &Path, scale: u32) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    dir.join(format!("{stem}_x{scale}.png"))
}

fn upscale_one(
    upscaler: &Upscaler,
    handle: Handle,
    input: &Path,
    output: PathBuf,
) -> Result<ImageReport> {
    let bytes = std::fs::read(input).map_err(|e| {
        EngineError::Configuration(format!("Failed to read input {}: {e}", input.display()))
    })?;
    let pixels = upscaler.process(handle, &bytes)?;
    write_png(&output, &pixels)?;
    info!(
        input = %input.display(),
        output = %output.display(),
        width = pixels.width,
        height = pixels.height,
        "Image upscaled"
    );
    Ok(ImageReport {
        input: input.to_path_buf(),
        output,
        width: pixels.width,
        height: pixels.height,
        channels: pixels.channels,
    })
}

async fn run_upscale(args: UpscaleArgs) -> Result<()> {
    let config = build_config(&args)?;
    let upscaler = Arc::new(Upscaler::with_defaults());
    let resolved = upscaler.resolve(&config)?;
    std::fs::create_dir_all(&args.output).map_err(|e| {
        EngineError::Configuration(format!(
            "Failed to create output directory {}: {e}",
            args.output.display()
        ))
    })?;

    let started = Instant::now();
    let handle = upscaler.initialize(&config)?;
    let scale = resolved.key.scale();
    info!(handle = %handle, key = %resolved.key, images = args.inputs.len(), "Engine ready");

    let tasks: Vec<_> = args
        .inputs
        .iter()
        .map(|input| {
            let upscaler = upscaler.clone();
            let input = input.clone();
            let output = output_path(&args.output, &input, scale);
            tokio::task::spawn_blocking(move || upscale_one(&upscaler, handle, &input, output))
        })
        .collect();

    let mut reports = Vec::with_capacity(tasks.len());
    let mut first_error = None;
    for task in tasks {
        let outcome = task.await.unwrap_or_else(|join_err| {
            Err(EngineError::PanicRecovered {
                stage: "upscale task",
                message: join_err.to_string(),
            })
        });
        match outcome {
            Ok(report) => reports.push(report),
            Err(err) => {
                warn!(error = %err, "Image failed");
                first_error.get_or_insert(err);
            }
        }
    }

    upscaler.release(handle)?;
    if let Some(err) = first_error {
        return Err(err);
    }

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    if args.json {
        let value = json!({
            "schema_version": JSON_SCHEMA_VERSION,
            "command": "upscale",
            "ok": true,
            "handle": handle.get(),
            "key": resolved.key.to_string(),
            "scale": scale,
            "elapsed_ms": elapsed_ms,
            "images": reports,
        });
        println!("{value}");
    } else {
        for r in &reports {
            println!(
                "{} -> {} ({}x{}x{})",
                r.input.display(),
                r.output.display(),
                r.width,
                r.height,
                r.channels
            );
        }
        println!("upscaled {} image(s) in {elapsed_ms:.1} ms", reports.len());
    }
    Ok(())
}

// ─── devices ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct DeviceReport {
    device: u32,
    name: String,
    vendor: String,
    heap_budget_mb: Option<u32>,
    device_local_heap_mb: u64,
    tiles: [u32; 3],
}

fn run_devices(args: DevicesArgs) -> Result<()> {
    let runtime = upshot_cuda::default_runtime();
    let count = runtime.device_count();
    let mut devices = Vec::with_capacity(count);

    if count > 0 {
        let ctx = GpuContextManager::new(runtime.clone());
        ctx.acquire()?;
        let collected = (0..count as u32)
            .map(|ordinal| -> Result<DeviceReport> {
                let budget = ctx.device_budget(ordinal)?;
                let target = DeviceTarget::Gpu(ordinal);
                Ok(DeviceReport {
                    device: ordinal,
                    name: ctx.device_name(ordinal)?,
                    vendor: format!("{:?}", budget.vendor),
                    heap_budget_mb: budget.heap_budget_mb,
                    device_local_heap_mb: budget.device_local_heap_mb,
                    tiles: [2, 3, 4].map(|s| TileSizeAdvisor::recommend(target, s, Some(&budget))),
                })
            })
            .collect::<Result<Vec<_>>>();
        ctx.release()?;
        devices = collected?;
    }

    if args.json {
        let value = json!({
            "schema_version": JSON_SCHEMA_VERSION,
            "command": "devices",
            "ok": true,
            "runtime_enabled": upshot_cuda::runtime_enabled(),
            "default_device": runtime.default_device(),
            "devices": devices,
        });
        println!("{value}");
    } else {
        println!("devices: {}", devices.len());
        if !upshot_cuda::runtime_enabled() {
            println!("gpu runtime disabled in this build; CPU only");
        }
        for d in &devices {
            println!(
                "device={} name={} vendor={} heap_budget_mb={} total_mb={} tile_2x={} tile_3x={} tile_4x={}",
                d.device,
                d.name,
                d.vendor,
                d.heap_budget_mb
                    .map_or_else(|| "unknown".to_string(), |v| v.to_string()),
                d.device_local_heap_mb,
                d.tiles[0],
                d.tiles[1],
                d.tiles[2]
            );
        }
    }
    Ok(())
}

// ─── tile ───────────────────────────────────────────────────────────────────

fn run_tile(args: TileArgs) -> Result<()> {
    let target = if args.cpu {
        DeviceTarget::Cpu
    } else {
        DeviceTarget::Gpu(0)
    };
    let vendor = args.vendor.map_or(GpuVendor::Other(0), GpuVendor::from_pci_id);
    let budget = synthetic_budget(vendor, args.budget);
    let tile_size = TileSizeAdvisor::recommend(target, args.scale, Some(&budget));
    let prepadding = prepadding_for_scale(args.scale);

    if args.json {
        let value = json!({
            "schema_version": JSON_SCHEMA_VERSION,
            "command": "tile",
            "ok": true,
            "budget_mb": args.budget,
            "scale": args.scale,
            "vendor": format!("{vendor:?}"),
            "cpu": args.cpu,
            "tile_size": tile_size,
            "prepadding": prepadding,
        });
        println!("{value}");
    } else {
        println!("tile_size={tile_size}");
        println!("prepadding={prepadding}");
    }
    Ok(())
}

/// A report in which every budget source agrees on `budget_mb`.
fn synthetic_budget(vendor: GpuVendor, budget_mb: u32) -> DeviceBudget {
    DeviceBudget {
        vendor,
        heap_budget_mb: Some(budget_mb),
        memory_budget_ext_mb: Some(budget_mb),
        device_local_heap_mb: u64::from(budget_mb) * DIRECT_BUDGET_HEAP_DIVISOR,
    }
}

fn command_error_json(command: &str, err: &EngineError) -> String {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "code": err.error_code(),
        "error": err.to_string(),
    })
    .to_string()
}
