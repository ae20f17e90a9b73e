//! Settings storage
//!
//! Persists the launcher form as a flat `key -> string` JSON object.

use crate::storage::{get_data_dir, StorageError};
use crate::types::config::{Language, ServerConfig, DEFAULT_THEME};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const SETTINGS_FILE: &str = "settings.json";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Reads and writes [`ServerConfig`] at a fixed path
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<data dir>/settings.json`
    pub fn default_location() -> Result<Self, StorageError> {
        Ok(Self::new(get_data_dir()?.join(SETTINGS_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings from disk
    ///
    /// Returns defaults if the file doesn't exist or is corrupted. Keys that
    /// are readable override the defaults one by one.
    pub fn load(&self) -> ServerConfig {
        match self.try_load() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    "Failed to load settings from {}, using defaults: {}",
                    self.path.display(),
                    e
                );
                ServerConfig::default()
            }
        }
    }

    /// Internal settings loading with error propagation
    fn try_load(&self) -> Result<ServerConfig, StorageError> {
        if !self.path.exists() {
            tracing::info!("Settings file not found, using defaults");
            return Ok(ServerConfig::default());
        }

        let json = fs::read_to_string(&self.path)?;
        let Value::Object(map) = serde_json::from_str::<Value>(&json)? else {
            return Err(StorageError::NotAnObject);
        };

        let config = merge_over_defaults(&map);
        tracing::info!("Loaded settings from {}", self.path.display());
        Ok(config)
    }

    /// Save settings to disk, logging instead of failing
    pub fn save(&self, config: &ServerConfig) {
        if let Err(e) = self.try_save(config) {
            tracing::error!(
                "Failed to save settings to {}: {}",
                self.path.display(),
                e
            );
        }
    }

    /// Write the full record atomically: temp file in the same directory, then rename.
    pub fn try_save(&self, config: &ServerConfig) -> Result<(), StorageError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let json = serde_json::to_string_pretty(config)?;

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| SETTINGS_FILE.to_string());
        let tmp = parent.join(format!(
            ".{}.{}.{}.tmp",
            file_name,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        if let Err(e) = fs::write(&tmp, json).and_then(|_| fs::rename(&tmp, &self.path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        tracing::debug!("Saved settings to {}", self.path.display());
        Ok(())
    }
}

/// Overlay every readable key of `map` onto the defaults
fn merge_over_defaults(map: &Map<String, Value>) -> ServerConfig {
    let mut config = ServerConfig::default();

    let fields: [(&str, &mut String); 14] = [
        ("models_dir", &mut config.models_dir),
        ("bin_base", &mut config.bin_base),
        ("ngl", &mut config.ngl),
        ("port", &mut config.port),
        ("prompt", &mut config.prompt),
        ("temp", &mut config.temp),
        ("top_k", &mut config.top_k),
        ("top_p", &mut config.top_p),
        ("repeat_penalty", &mut config.repeat_penalty),
        ("threads", &mut config.threads),
        ("ctx_size", &mut config.ctx_size),
        ("max_tokens", &mut config.max_tokens),
        ("theme", &mut config.theme),
        ("model", &mut config.model),
    ];

    for (key, slot) in fields {
        match map.get(key) {
            Some(value) => match value_as_string(value) {
                Some(text) => *slot = text,
                None => tracing::warn!("Ignoring unreadable settings key {}", key),
            },
            None => tracing::debug!("Settings key {} missing, keeping default", key),
        }
    }

    if let Some(code) = map.get("language").and_then(value_as_string) {
        match Language::from_code(&code) {
            Some(language) => config.language = language,
            None => tracing::warn!("Unknown language {:?}, falling back to en", code),
        }
    }

    if config.theme.trim().is_empty() {
        config.theme = DEFAULT_THEME.to_string();
    }

    config
}

/// Older files stored some numbers as JSON numbers
fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
