//! llama-launcher library
//!
//! Core of the llama-server launcher, without any presentation layer.

pub mod server;
pub mod storage;
pub mod system;
pub mod types;
