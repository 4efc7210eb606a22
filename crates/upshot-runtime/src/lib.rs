#![doc = include_str!("../README.md")]

pub mod config;
pub mod upscaler;

pub use config::{UpscaleConfig, ValidatedConfig};
pub use upscaler::Upscaler;
