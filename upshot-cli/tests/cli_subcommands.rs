use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use upshot_core::codec_traits::{ImageDecoder, PixelBuffer};
use upshot_image::{ContainerDecoder, encode_png};

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir =
        std::env::temp_dir().join(format!("upshot_cli_{label}_{}_{}", std::process::id(), nanos));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn write_model(root: &Path, family: &str, stem: &str) {
    let dir = root.join(family);
    fs::create_dir_all(&dir).expect("create family dir");
    fs::write(dir.join(format!("{stem}.param")), b"7767517\n2 2\n").expect("write param");
    fs::write(dir.join(format!("{stem}.bin")), [7u8; 32]).expect("write bin");
}

fn write_png(path: &Path, width: u32, height: u32, channels: u32) {
    let data = vec![90u8; (width * height * channels) as usize];
    let pixels = PixelBuffer::new(width, height, channels, data).expect("pixel buffer");
    fs::write(path, encode_png(&pixels).expect("encode png")).expect("write png");
}

fn upshot(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_upshot"))
        .args(args)
        .env("NO_COLOR", "1")
        .output()
        .expect("run upshot")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).unwrap_or_else(|err| {
        panic!(
            "stdout is not JSON ({err}): {stdout}\nstderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

fn assert_schema_version(value: &serde_json::Value) {
    assert_eq!(
        value.get("schema_version").and_then(|v| v.as_u64()),
        Some(1),
        "missing schema_version=1 field"
    );
}

#[test]
fn help_lists_subcommands() {
    let output = upshot(&["help"]);
    assert!(
        output.status.success(),
        "upshot help failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("upscale"), "missing upscale in help output");
    assert!(stdout.contains("devices"), "missing devices in help output");
    assert!(stdout.contains("tile"), "missing tile in help output");
}

#[test]
fn upscale_help_lists_model_flags() {
    let output = upshot(&["upscale", "--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in ["--model-root", "--family", "--noise", "--syncgap", "--tta", "--gpu", "--config", "--json"] {
        assert!(stdout.contains(flag), "missing {flag} in upscale help");
    }
}

#[test]
fn tile_follows_budget_ladder() {
    let low = stdout_json(&upshot(&["tile", "--budget", "150", "--scale", "2", "--json"]));
    assert_schema_version(&low);
    assert_eq!(low["tile_size"], 32);
    assert_eq!(low["prepadding"], 18);

    let high = stdout_json(&upshot(&["tile", "--budget", "1500", "--scale", "2", "--json"]));
    assert_eq!(high["tile_size"], 400);

    let three = stdout_json(&upshot(&["tile", "--budget", "1500", "--scale", "3", "--json"]));
    assert_eq!(three["tile_size"], 200);
    assert_eq!(three["prepadding"], 14);
}

#[test]
fn tile_cpu_and_vendor_paths() {
    let cpu = stdout_json(&upshot(&["tile", "--budget", "10", "--scale", "4", "--cpu", "--json"]));
    assert_eq!(cpu["tile_size"], 400);

    let vendor = stdout_json(&upshot(&[
        "tile", "--budget", "1200", "--scale", "3", "--vendor", "0x5143", "--json",
    ]));
    assert_eq!(vendor["tile_size"], 400);
    assert_eq!(vendor["vendor"], "Qualcomm");
}

#[test]
fn tile_rejects_scale_out_of_range() {
    let output = upshot(&["tile", "--budget", "100", "--scale", "5"]);
    assert!(!output.status.success());
}

#[test]
fn devices_json_reports_a_list() {
    let output = upshot(&["devices", "--json"]);
    assert!(
        output.status.success(),
        "devices failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "devices");
    assert!(value["devices"].is_array());
}

#[test]
fn upscale_writes_scaled_pngs() {
    let dir = unique_temp_dir("upscale");
    let models = dir.join("models");
    write_model(&models, "models-se", "up2x-no-denoise");
    let a = dir.join("a.png");
    let b = dir.join("b.png");
    write_png(&a, 6, 4, 3);
    write_png(&b, 3, 3, 4);
    let out = dir.join("out");

    let output = upshot(&[
        "upscale",
        "-i",
        a.to_str().unwrap(),
        "-i",
        b.to_str().unwrap(),
        "-o",
        out.to_str().unwrap(),
        "--model-root",
        models.to_str().unwrap(),
        "--noise",
        "0",
        "--gpu=-1",
        "--json",
    ]);
    assert!(
        output.status.success(),
        "upscale failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["ok"], true);
    assert_eq!(value["images"].as_array().map(Vec::len), Some(2));

    let decoded = ContainerDecoder
        .decode(&fs::read(out.join("a_x2.png")).expect("a_x2.png written"))
        .expect("output decodes");
    assert_eq!((decoded.width, decoded.height, decoded.channels), (12, 8, 3));
    let decoded = ContainerDecoder
        .decode(&fs::read(out.join("b_x2.png")).expect("b_x2.png written"))
        .expect("output decodes");
    assert_eq!((decoded.width, decoded.height, decoded.channels), (6, 6, 4));

    fs::remove_dir_all(dir).ok();
}

#[test]
fn upscale_reads_config_file() {
    let dir = unique_temp_dir("config");
    let models = dir.join("models");
    write_model(&models, "models-pro", "up3x-denoise3x");
    let input = dir.join("in.png");
    write_png(&input, 4, 4, 3);
    let config = dir.join("upshot.json");
    fs::write(
        &config,
        format!(
            r#"{{"model_root":{},"model_family":"models-pro","scale":3,"noise":3,"gpu_device":-1}}"#,
            serde_json::to_string(models.to_str().unwrap()).unwrap()
        ),
    )
    .unwrap();
    let out = dir.join("out");

    let output = upshot(&[
        "upscale",
        "-i",
        input.to_str().unwrap(),
        "-o",
        out.to_str().unwrap(),
        "--config",
        config.to_str().unwrap(),
        "--json",
    ]);
    assert!(
        output.status.success(),
        "upscale failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(stdout_json(&output)["scale"], 3);
    assert!(out.join("in_x3.png").is_file());
    fs::remove_dir_all(dir).ok();
}

#[test]
fn illegal_family_combination_fails_with_json_error() {
    let dir = unique_temp_dir("illegal");
    let input = dir.join("in.png");
    write_png(&input, 2, 2, 3);

    let output = upshot(&[
        "upscale",
        "-i",
        input.to_str().unwrap(),
        "-o",
        dir.join("out").to_str().unwrap(),
        "--model-root",
        dir.to_str().unwrap(),
        "--family",
        "models-pro",
        "--noise",
        "1",
        "--gpu=-1",
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(10));
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["ok"], false);
    assert_eq!(value["code"], 100);
    assert!(value["error"].as_str().unwrap_or_default().contains("noise 1"));
    fs::remove_dir_all(dir).ok();
}

#[test]
fn missing_assets_fail_with_asset_code() {
    let dir = unique_temp_dir("missing");
    let input = dir.join("in.png");
    write_png(&input, 2, 2, 3);

    let output = upshot(&[
        "upscale",
        "-i",
        input.to_str().unwrap(),
        "-o",
        dir.join("out").to_str().unwrap(),
        "--model-root",
        dir.join("nowhere").to_str().unwrap(),
        "--gpu=-1",
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(11));
    let value = stdout_json(&output);
    assert_eq!(value["code"], 101);
    assert!(value["error"].as_str().unwrap_or_default().contains("up2x-conservative.param"));
    fs::remove_dir_all(dir).ok();
}
