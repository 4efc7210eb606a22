//! Value types that define engine identity.
//!
//! [`ParameterKey`] is the cache key of the registry: two initialisations with
//! equal keys share one engine.  Keys are only constructed through
//! [`ParameterKey::new`], which validates every field against the rules of
//! the requested [`ModelFamily`].

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

/// Device id that selects the CPU instead of a GPU.
pub const CPU_ONLY: i32 = -1;

/// Worker threads handed to every engine.
pub const ENGINE_THREADS: u32 = 1;

// ─── Handle ─────────────────────────────────────────────────────────────────

/// Opaque, process-unique reference to a live engine entry.
///
/// Handles are allocated from a monotonic counter and never reused, so a
/// stale handle can only ever miss, never alias a newer engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u64);

impl Handle {
    /// Wrap a raw value received from a host boundary.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Device target ──────────────────────────────────────────────────────────

/// Where an engine runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceTarget {
    Cpu,
    /// GPU ordinal as enumerated by the active [`GpuRuntime`](crate::context::GpuRuntime).
    Gpu(u32),
}

impl DeviceTarget {
    /// Map a host device id (`-1` = CPU) onto a target.
    ///
    /// Range checks against the number of visible devices happen at the
    /// configuration boundary; this only rejects ids below `-1`.
    pub fn from_id(id: i32) -> Result<Self> {
        match id {
            CPU_ONLY => Ok(Self::Cpu),
            id if id >= 0 => Ok(Self::Gpu(id as u32)),
            id => Err(EngineError::Configuration(format!(
                "invalid gpu device id {id}; use -1 for CPU or a device ordinal"
            ))),
        }
    }

    pub fn id(self) -> i32 {
        match self {
            Self::Cpu => CPU_ONLY,
            Self::Gpu(ordinal) => ordinal as i32,
        }
    }

    #[inline]
    pub fn is_gpu(self) -> bool {
        matches!(self, Self::Gpu(_))
    }
}

// ─── Model family ───────────────────────────────────────────────────────────

/// Known model families and their legal scale / noise combinations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    /// `models-nose`: 2× only, no denoise, no cross-tile sync.
    ConservativeOnly,
    /// `models-pro`: 2×/3×, conservative / no-denoise / 3× denoise.
    Pro,
    /// `models-se`: 2×–4×, every noise level.
    Standard,
}

impl ModelFamily {
    pub const DEFAULT_NAME: &'static str = "models-se";

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "models-nose" => Ok(Self::ConservativeOnly),
            "models-pro" => Ok(Self::Pro),
            "models-se" => Ok(Self::Standard),
            other => Err(EngineError::Configuration(format!(
                "unknown model family '{other}'; expected models-nose, models-pro or models-se"
            ))),
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::ConservativeOnly => "models-nose",
            Self::Pro => "models-pro",
            Self::Standard => "models-se",
        }
    }

    pub fn allowed_scales(self) -> &'static [u32] {
        match self {
            Self::ConservativeOnly => &[2],
            Self::Pro => &[2, 3],
            Self::Standard => &[2, 3, 4],
        }
    }

    pub fn allowed_noise(self) -> &'static [i32] {
        match self {
            Self::ConservativeOnly => &[0],
            Self::Pro => &[-1, 0, 3],
            Self::Standard => &[-1, 0, 1, 2, 3],
        }
    }

    /// The conservative-only family has no cross-tile synchronisation.
    #[inline]
    pub fn forces_zero_syncgap(self) -> bool {
        matches!(self, Self::ConservativeOnly)
    }
}

// ─── Parameter key ──────────────────────────────────────────────────────────

/// Canonical engine identity.
///
/// Equality and hashing are structural over all fields, including the exact
/// family string.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParameterKey {
    noise: i32,
    scale: u32,
    syncgap: u32,
    tta: bool,
    device: DeviceTarget,
    family_name: String,
    family: ModelFamily,
}

impl ParameterKey {
    /// Validate a configuration tuple and build its key.
    ///
    /// `syncgap` is checked against `[0, 3]` first and then forced to 0 for
    /// the conservative-only family.
    pub fn new(
        family_name: impl Into<String>,
        scale: i32,
        noise: i32,
        syncgap: i32,
        tta: bool,
        device: DeviceTarget,
    ) -> Result<Self> {
        let family_name = family_name.into();
        let family = ModelFamily::from_name(&family_name)?;

        if !(-1..=3).contains(&noise) {
            return Err(EngineError::Configuration(format!(
                "invalid noise {noise}; expected -1..=3"
            )));
        }
        if !(2..=4).contains(&scale) {
            return Err(EngineError::Configuration(format!(
                "invalid scale {scale}; expected 2..=4"
            )));
        }
        if !(0..=3).contains(&syncgap) {
            return Err(EngineError::Configuration(format!(
                "invalid syncgap {syncgap}; expected 0..=3"
            )));
        }

        let scale = scale as u32;
        let syncgap = if family.forces_zero_syncgap() {
            0
        } else {
            syncgap as u32
        };

        let key = Self {
            noise,
            scale,
            syncgap,
            tta,
            device,
            family_name,
            family,
        };
        key.validate()?;
        Ok(key)
    }

    /// Check the family legality table.
    pub fn validate(&self) -> Result<()> {
        if !self.family.allowed_scales().contains(&self.scale) {
            return Err(EngineError::Configuration(format!(
                "scale {} is not allowed for {}; allowed: {:?}",
                self.scale,
                self.family_name,
                self.family.allowed_scales()
            )));
        }
        if !self.family.allowed_noise().contains(&self.noise) {
            return Err(EngineError::Configuration(format!(
                "noise {} is not allowed for {}; allowed: {:?}",
                self.noise,
                self.family_name,
                self.family.allowed_noise()
            )));
        }
        if self.syncgap > 3 || (self.family.forces_zero_syncgap() && self.syncgap != 0) {
            return Err(EngineError::Configuration(format!(
                "syncgap {} is not allowed for {}",
                self.syncgap, self.family_name
            )));
        }
        Ok(())
    }

    pub fn noise(&self) -> i32 {
        self.noise
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn syncgap(&self) -> u32 {
        self.syncgap
    }

    pub fn tta(&self) -> bool {
        self.tta
    }

    pub fn device(&self) -> DeviceTarget {
        self.device
    }

    pub fn family_name(&self) -> &str {
        &self.family_name
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    /// Asset file stem for this key's denoise level.
    pub fn variant(&self) -> String {
        match self.noise {
            -1 => "conservative".to_string(),
            0 => "no-denoise".to_string(),
            n => format!("denoise{n}x"),
        }
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/up{}x-{} syncgap={} tta={} device={}",
            self.family_name,
            self.scale,
            self.variant(),
            self.syncgap,
            self.tta,
            self.device.id()
        )
    }
}

// ─── Engine parameters ──────────────────────────────────────────────────────

/// Margin added around every tile, by scale factor.
pub fn prepadding_for_scale(scale: u32) -> u32 {
    match scale {
        2 => 18,
        3 => 14,
        4 => 19,
        _ => 0,
    }
}

/// Everything an engine needs to configure itself before `load`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineParams {
    pub key: ParameterKey,
    /// Spatial chunk processed per inference pass.
    pub tile_size: u32,
    pub prepadding: u32,
    pub num_threads: u32,
}

impl EngineParams {
    pub fn new(key: ParameterKey, tile_size: u32) -> Self {
        let prepadding = prepadding_for_scale(key.scale());
        Self {
            key,
            tile_size,
            prepadding,
            num_threads: ENGINE_THREADS,
        }
    }
}

// ─── Model assets ───────────────────────────────────────────────────────────

/// Read-only `.param` / `.bin` pair for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelAssets {
    pub param_path: PathBuf,
    pub model_path: PathBuf,
}

impl ModelAssets {
    /// `{root}/{family}/up{scale}x-{variant}.{param|bin}`
    pub fn resolve(root: &Path, key: &ParameterKey) -> Self {
        let dir = root.join(key.family_name());
        let stem = format!("up{}x-{}", key.scale(), key.variant());
        Self {
            param_path: dir.join(format!("{stem}.param")),
            model_path: dir.join(format!("{stem}.bin")),
        }
    }

    /// Fail with [`EngineError::AssetMissing`] unless both files can be opened.
    pub fn ensure_present(&self) -> Result<()> {
        for path in [&self.param_path, &self.model_path] {
            let readable = File::open(path)
                .and_then(|f| f.metadata())
                .map(|m| m.is_file())
                .unwrap_or(false);
            if !readable {
                return Err(EngineError::AssetMissing { path: path.clone() });
            }
        }
        Ok(())
    }
}
