//! Configuration types
//!
//! The launcher form record, kept as the raw strings the user typed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported interface languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Es,
    #[default]
    En,
    Pt,
    It,
    De,
    Zh,
    Ja,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Language::Es,
        Language::En,
        Language::Pt,
        Language::It,
        Language::De,
        Language::Zh,
        Language::Ja,
    ];

    /// Two-letter code as stored in the settings file
    pub fn code(self) -> &'static str {
        match self {
            Language::Es => "es",
            Language::En => "en",
            Language::Pt => "pt",
            Language::It => "it",
            Language::De => "de",
            Language::Zh => "zh",
            Language::Ja => "ja",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.trim();
        Self::ALL
            .into_iter()
            .find(|lang| lang.code().eq_ignore_ascii_case(code))
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Server launch settings as submitted by the form
///
/// Numeric fields stay strings until [`crate::server::validation::validate`]
/// turns them into [`crate::server::validation::LaunchParams`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerConfig {
    /// Directory scanned for `.gguf` models
    pub models_dir: String,
    /// Directory containing the `llama-server` binary
    pub bin_base: String,
    /// Layers offloaded to the GPU
    pub ngl: String,
    pub port: String,
    /// Initial prompt. Persisted only; the server has no flag for it.
    pub prompt: String,
    pub temp: String,
    pub top_k: String,
    pub top_p: String,
    pub repeat_penalty: String,
    pub threads: String,
    pub ctx_size: String,
    pub max_tokens: String,
    pub language: Language,
    pub theme: String,
    /// File name of the selected model; empty selects the first one found
    pub model: String,
}

pub const DEFAULT_THEME: &str = "system";

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            models_dir: String::new(),
            bin_base: String::new(),
            ngl: "40".to_string(),
            port: "8080".to_string(),
            prompt: String::new(),
            temp: "0.8".to_string(),
            top_k: "40".to_string(),
            top_p: "0.9".to_string(),
            repeat_penalty: "1.1".to_string(),
            threads: crate::system::resources::default_threads().to_string(),
            ctx_size: "4096".to_string(),
            max_tokens: "512".to_string(),
            language: Language::default(),
            theme: DEFAULT_THEME.to_string(),
            model: String::new(),
        }
    }
}
