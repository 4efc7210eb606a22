#![doc = include_str!("../README.md")]

pub mod engine;

pub use engine::{PARAM_MAGIC, ResampleEngine, ResampleFactory};
