//! Launch parameter validation
//!
//! Turns the raw form strings of a [`ServerConfig`] into typed [`LaunchParams`].
//! Checks run in a fixed order and stop at the first failure.

use crate::system::resources::max_threads;
use crate::types::config::ServerConfig;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub const TEMPERATURE_RANGE: (f64, f64) = (0.1, 2.0);
pub const TOP_K_RANGE: (i64, i64) = (1, 100);
pub const TOP_P_RANGE: (f64, f64) = (0.0, 1.0);
pub const REPEAT_PENALTY_RANGE: (f64, f64) = (1.0, 2.0);
pub const CTX_SIZE_RANGE: (i64, i64) = (512, 32768);
pub const MAX_TOKENS_RANGE: (i64, i64) = (1, 32768);
pub const PORT_RANGE: (i64, i64) = (1, 65535);

/// Form fields that can fail validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    ModelsDir,
    BinBase,
    Port,
    Prompt,
    Temperature,
    TopK,
    TopP,
    RepeatPenalty,
    Threads,
    CtxSize,
    MaxTokens,
    GpuLayers,
}

impl Field {
    pub fn label(self) -> &'static str {
        match self {
            Field::ModelsDir => "models directory",
            Field::BinBase => "binary directory",
            Field::Port => "port",
            Field::Prompt => "prompt",
            Field::Temperature => "temperature",
            Field::TopK => "top-k",
            Field::TopP => "top-p",
            Field::RepeatPenalty => "repeat penalty",
            Field::Threads => "threads",
            Field::CtxSize => "context size",
            Field::MaxTokens => "max tokens",
            Field::GpuLayers => "GPU layers",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    Missing(Field),
    #[error("{field} must be {expected}, got {value:?}")]
    Invalid {
        field: Field,
        expected: &'static str,
        value: String,
    },
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: Field,
        min: String,
        max: String,
        value: String,
    },
}

impl ValidationError {
    /// The field that failed
    pub fn field(&self) -> Field {
        match self {
            ValidationError::Missing(field) => *field,
            ValidationError::Invalid { field, .. } => *field,
            ValidationError::OutOfRange { field, .. } => *field,
        }
    }
}

/// Typed launch parameters
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchParams {
    pub models_dir: PathBuf,
    pub bin_base: PathBuf,
    pub port: u16,
    pub prompt: String,
    pub temperature: f64,
    pub top_k: u32,
    pub top_p: f64,
    pub repeat_penalty: f64,
    pub threads: u32,
    pub ctx_size: u32,
    pub max_tokens: u32,
    pub gpu_layers: u32,
}

/// Validate against the thread limit of this machine
pub fn validate(config: &ServerConfig) -> Result<LaunchParams, ValidationError> {
    validate_with_thread_limit(config, max_threads())
}

pub fn validate_with_thread_limit(
    config: &ServerConfig,
    thread_limit: usize,
) -> Result<LaunchParams, ValidationError> {
    let models_dir = PathBuf::from(required(Field::ModelsDir, &config.models_dir)?);
    let bin_base = PathBuf::from(required(Field::BinBase, &config.bin_base)?);
    let port = parse_int(Field::Port, &config.port, PORT_RANGE)? as u16;
    required(Field::Prompt, &config.prompt)?;
    let temperature = parse_float(Field::Temperature, &config.temp, TEMPERATURE_RANGE)?;
    let top_k = parse_int(Field::TopK, &config.top_k, TOP_K_RANGE)? as u32;
    let top_p = parse_float(Field::TopP, &config.top_p, TOP_P_RANGE)?;
    let repeat_penalty =
        parse_float(Field::RepeatPenalty, &config.repeat_penalty, REPEAT_PENALTY_RANGE)?;
    let thread_limit = i64::try_from(thread_limit.max(1)).unwrap_or(i64::MAX);
    let threads = parse_int(Field::Threads, &config.threads, (1, thread_limit))? as u32;
    let ctx_size = parse_int(Field::CtxSize, &config.ctx_size, CTX_SIZE_RANGE)? as u32;
    let max_tokens = parse_int(Field::MaxTokens, &config.max_tokens, MAX_TOKENS_RANGE)? as u32;

    // Empty means CPU only
    let gpu_layers = if config.ngl.trim().is_empty() {
        0
    } else {
        parse_int(Field::GpuLayers, &config.ngl, (0, i64::from(u32::MAX)))? as u32
    };

    Ok(LaunchParams {
        models_dir,
        bin_base,
        port,
        prompt: config.prompt.clone(),
        temperature,
        top_k,
        top_p,
        repeat_penalty,
        threads,
        ctx_size,
        max_tokens,
        gpu_layers,
    })
}

/// Cut `prompt` to `ctx_size` characters. `None` when it already fits.
pub fn truncate_prompt(prompt: &str, ctx_size: u32) -> Option<String> {
    let limit = ctx_size as usize;
    if prompt.chars().count() <= limit {
        return None;
    }
    Some(prompt.chars().take(limit).collect())
}

fn required(field: Field, raw: &str) -> Result<&str, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        Err(ValidationError::Missing(field))
    } else {
        Ok(trimmed)
    }
}

fn parse_int(field: Field, raw: &str, (min, max): (i64, i64)) -> Result<i64, ValidationError> {
    let text = required(field, raw)?;
    let value: i64 = text.parse().map_err(|_| ValidationError::Invalid {
        field,
        expected: "an integer",
        value: text.to_string(),
    })?;
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            min: min.to_string(),
            max: max.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn parse_float(field: Field, raw: &str, (min, max): (f64, f64)) -> Result<f64, ValidationError> {
    let text = required(field, raw)?;
    let value: f64 = text
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| ValidationError::Invalid {
            field,
            expected: "a number",
            value: text.to_string(),
        })?;
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            min: min.to_string(),
            max: max.to_string(),
            value: text.to_string(),
        });
    }
    Ok(value)
}
