#![doc = include_str!("../README.md")]

pub mod backend;
pub mod codec_traits;
pub mod context;
pub mod error;
pub mod registry;
pub mod tiling;
pub mod types;
