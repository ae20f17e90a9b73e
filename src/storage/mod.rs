//! Persistent storage
//!
//! This module handles persistence of launcher settings and discovery of model files.

pub mod models;
pub mod settings;

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading or writing launcher data
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Settings root is not a JSON object")]
    NotAnObject,
    #[error("Could not determine the user data directory")]
    NoDataDir,
}

/// Per-user data directory
///
/// Linux: ~/.local/share/llama-launcher
/// macOS: ~/Library/Application Support/com.llama.llama-launcher
/// Windows: %APPDATA%\llama\llama-launcher\data
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "llama", "llama-launcher")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
