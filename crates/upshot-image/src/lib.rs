#![doc = include_str!("../README.md")]

pub mod codec;

pub use codec::{ContainerDecoder, encode_png, write_png};
