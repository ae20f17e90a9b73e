//! Model discovery
//!
//! Scans the models directory for GGUF files.

use crate::types::model::ModelEntry;
use std::path::Path;

/// File pattern the inference server accepts
pub const MODEL_GLOB: &str = "*.gguf";

/// List the `.gguf` files directly inside `dir`, sorted by file name.
///
/// A missing or unreadable directory is the "no models" state, not an error.
pub fn find_models(dir: impl AsRef<Path>) -> Vec<ModelEntry> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        tracing::debug!("Models directory {} does not exist", dir.display());
        return Vec::new();
    }

    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        MODEL_GLOB
    );

    // Hidden files (partial downloads and the like) are not models
    let options = glob::MatchOptions {
        require_literal_leading_dot: true,
        ..glob::MatchOptions::new()
    };
    let paths = match glob::glob_with(&pattern, options) {
        Ok(paths) => paths,
        Err(e) => {
            tracing::warn!("Invalid model pattern {}: {}", pattern, e);
            return Vec::new();
        }
    };

    let mut models: Vec<ModelEntry> = paths
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::debug!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter_map(|path| {
            let metadata = std::fs::metadata(&path).ok()?;
            if !metadata.is_file() {
                return None;
            }
            let file_name = path.file_name()?.to_string_lossy().into_owned();
            Some(ModelEntry::new(path, file_name, metadata.len()))
        })
        .collect();

    models.sort_by(|a, b| a.file_name.cmp(&b.file_name));

    tracing::info!("Found {} GGUF models in {}", models.len(), dir.display());
    models
}
