//! Launch orchestration
//!
//! Turns a submitted [`ServerConfig`] into a running server, persisting the
//! settings once the start succeeds.

use crate::server::command::build_command;
use crate::server::prompt::{ConflictDecision, ConflictPrompt};
use crate::server::supervisor::{ServerHandle, Supervisor, SupervisorError};
use crate::server::validation::{truncate_prompt, validate, ValidationError};
use crate::storage::models::find_models;
use crate::storage::settings::ConfigStore;
use crate::system::processes::check_server_running;
use crate::system::signals::Termination;
use crate::types::config::ServerConfig;
use crate::types::model::ModelEntry;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Invalid settings: {0}")]
    Validation(#[from] ValidationError),
    #[error("Launch cancelled: a server is already running on port {port} (PID {pid})")]
    Cancelled { port: u16, pid: u32 },
    #[error("Could not stop the server on port {port} (PID {pid}): {reason}")]
    StopFailed { port: u16, pid: u32, reason: String },
    #[error("No GGUF models found in {0}")]
    NoModels(PathBuf),
    #[error("Model {name} not found in {dir}")]
    ModelNotFound { name: String, dir: PathBuf },
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// A successful start
#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub handle: ServerHandle,
    pub model: ModelEntry,
    /// `http://localhost:<port>`
    pub url: String,
    /// Non-fatal notes, e.g. prompt truncation
    pub warnings: Vec<String>,
    /// The settings that were persisted
    pub config: ServerConfig,
}

#[derive(Debug, Clone)]
pub enum LaunchOutcome {
    Started(LaunchReport),
    /// The user chose to stop the server already on the port and not start a new one
    Stopped { pid: u32, termination: Termination },
}

/// Drives one launch attempt against a single supervisor
pub struct Launcher {
    store: ConfigStore,
    supervisor: Supervisor,
}

impl Launcher {
    pub fn new(store: ConfigStore, supervisor: Supervisor) -> Self {
        Self { store, supervisor }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut Supervisor {
        &mut self.supervisor
    }

    pub async fn launch(
        &mut self,
        config: &ServerConfig,
        prompt: &dyn ConflictPrompt,
    ) -> Result<LaunchOutcome, LaunchError> {
        let params = validate(config)?;

        let mut submitted = config.clone();
        let mut warnings = Vec::new();
        if let Some(truncated) = truncate_prompt(&params.prompt, params.ctx_size) {
            let warning = format!(
                "Prompt truncated from {} to {} characters to fit the context size",
                params.prompt.chars().count(),
                params.ctx_size
            );
            tracing::warn!("{}", warning);
            warnings.push(warning);
            submitted.prompt = truncated;
        }

        let port = params.port;
        let occupant = tokio::task::spawn_blocking(move || check_server_running(port))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Process scan for port {} failed: {}", port, e);
                None
            });
        if let Some(pid) = occupant {
            let decision = prompt.resolve_conflict(params.port, pid).await;
            tracing::info!("Port {} conflict with PID {}: {}", params.port, pid, decision);
            match decision {
                ConflictDecision::Cancel => {
                    return Err(LaunchError::Cancelled {
                        port: params.port,
                        pid,
                    })
                }
                ConflictDecision::StopOnly => {
                    let termination = self.supervisor.stop_pid(pid).await;
                    if !termination.is_terminated() {
                        tracing::warn!("Server (PID {}) may still be running", pid);
                    }
                    return Ok(LaunchOutcome::Stopped { pid, termination });
                }
                ConflictDecision::StopAndContinue => {
                    if let Termination::Failed(reason) = self.supervisor.stop_pid(pid).await {
                        return Err(LaunchError::StopFailed {
                            port: params.port,
                            pid,
                            reason,
                        });
                    }
                }
            }
        }

        let model = select_model(&params.models_dir, &submitted.model)?;
        submitted.model = model.file_name.clone();
        let command = build_command(&params, &model.path);
        tracing::info!("Executing: {}", command);

        let handle = self.supervisor.start(&command)?;
        self.store.save(&submitted);

        let url = format!("http://localhost:{}", params.port);
        tracing::info!("Server available at {}", url);
        Ok(LaunchOutcome::Started(LaunchReport {
            handle,
            model,
            url,
            warnings,
            config: submitted,
        }))
    }

    /// Stop the server this launcher started
    pub async fn stop(&mut self) -> bool {
        self.supervisor.stop().await
    }
}

/// The named model, or the first one when no name is set
fn select_model(dir: &Path, name: &str) -> Result<ModelEntry, LaunchError> {
    let mut models = find_models(dir);
    if models.is_empty() {
        return Err(LaunchError::NoModels(dir.to_path_buf()));
    }

    let name = name.trim();
    if name.is_empty() {
        return Ok(models.swap_remove(0));
    }

    models
        .into_iter()
        .find(|model| model.file_name == name)
        .ok_or_else(|| LaunchError::ModelNotFound {
            name: name.to_string(),
            dir: dir.to_path_buf(),
        })
}
