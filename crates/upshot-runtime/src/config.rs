//! Typed host configuration.
//!
//! Every tunable is optional; [`UpscaleConfig::validate`] fills in defaults,
//! checks the device against the runtime, and produces the engine identity.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use upshot_core::context::GpuRuntime;
use upshot_core::error::{EngineError, Result};
use upshot_core::types::{DeviceTarget, ModelAssets, ModelFamily, ParameterKey};

/// Conservative denoise.
pub const DEFAULT_NOISE: i32 = -1;
pub const DEFAULT_SCALE: i32 = 2;
pub const DEFAULT_SYNCGAP: i32 = 3;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpscaleConfig {
    /// Directory holding one sub-directory per model family.
    pub model_root: PathBuf,
    /// -1 conservative, 0 none, 1..=3 denoise strength.  Default -1.
    #[serde(default)]
    pub noise: Option<i32>,
    /// 2, 3 or 4.  Default 2.
    #[serde(default)]
    pub scale: Option<i32>,
    /// 0..=3.  Default 3; always 0 for `models-nose`.
    #[serde(default)]
    pub syncgap: Option<i32>,
    /// `models-nose`, `models-pro` or `models-se`.  Default `models-se`.
    #[serde(default)]
    pub model_family: Option<String>,
    /// Test-time augmentation.  Default off.
    #[serde(default)]
    pub tta: Option<bool>,
    /// Device ordinal, or -1 for CPU.  Default: the runtime's default device.
    #[serde(default)]
    pub gpu_device: Option<i32>,
}

/// A configuration that passed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedConfig {
    pub key: ParameterKey,
    pub assets: ModelAssets,
}

impl UpscaleConfig {
    pub fn new(model_root: impl Into<PathBuf>) -> Self {
        Self {
            model_root: model_root.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|err| EngineError::Configuration(format!("Invalid config JSON: {err}")))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Configuration(format!(
                "Failed to read config from {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&data)
    }

    /// Resolve defaults and check every field.
    ///
    /// Touches no registry or GPU state.
    pub fn validate(&self, runtime: &dyn GpuRuntime) -> Result<ValidatedConfig> {
        if self.model_root.as_os_str().is_empty() {
            return Err(EngineError::Configuration("model_root is required".into()));
        }

        let gpu = self.gpu_device.unwrap_or_else(|| runtime.default_device());
        let device = DeviceTarget::from_id(gpu)?;
        if let DeviceTarget::Gpu(ordinal) = device {
            let visible = runtime.device_count();
            if ordinal as usize >= visible {
                return Err(EngineError::Configuration(format!(
                    "gpu device {ordinal} not present; {visible} device(s) visible, use -1 for CPU"
                )));
            }
        }

        let key = ParameterKey::new(
            self.model_family
                .clone()
                .unwrap_or_else(|| ModelFamily::DEFAULT_NAME.to_string()),
            self.scale.unwrap_or(DEFAULT_SCALE),
            self.noise.unwrap_or(DEFAULT_NOISE),
            self.syncgap.unwrap_or(DEFAULT_SYNCGAP),
            self.tta.unwrap_or(false),
            device,
        )?;
        let assets = ModelAssets::resolve(&self.model_root, &key);
        Ok(ValidatedConfig { key, assets })
    }
}
