//! Model types
//!
//! Defines metadata for discovered model files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

/// A `.gguf` file found in the models directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Absolute path to the GGUF file
    pub path: PathBuf,
    /// File name without directory
    pub file_name: String,
    /// Model size in bytes
    pub size_bytes: u64,
    /// File name plus human-readable size, e.g. `llama-7b.gguf (3.8 GB)`
    pub display_name: String,
}

impl ModelEntry {
    pub fn new(path: PathBuf, file_name: String, size_bytes: u64) -> Self {
        let display_name = format!("{} ({})", file_name, format_size(size_bytes));
        Self {
            path,
            file_name,
            size_bytes,
            display_name,
        }
    }
}

/// Gigabytes to one decimal, or megabytes when under 0.1 GB
pub fn format_size(bytes: u64) -> String {
    let gb = bytes as f64 / GIB;
    if gb < 0.1 {
        format!("{:.1} MB", bytes as f64 / MIB)
    } else {
        format!("{:.1} GB", gb)
    }
}
