//! llama-launcher terminal front-end
//!
//! Loads the saved settings, applies command-line overrides, launches
//! `llama-server` and streams its output until it exits or Ctrl-C is pressed.

use async_trait::async_trait;
use clap::Parser;
use llama_launcher::server::launcher::{LaunchError, LaunchOutcome, Launcher};
use llama_launcher::server::prompt::{ConflictDecision, ConflictPrompt, FixedDecision};
use llama_launcher::server::supervisor::{drain_events, ServerEvent, Supervisor};
use llama_launcher::storage::models::find_models;
use llama_launcher::storage::settings::ConfigStore;
use llama_launcher::storage::StorageError;
use llama_launcher::types::config::{Language, ServerConfig};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// How long to wait for the last server output after it exits
const OUTPUT_DRAIN_LIMIT: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "llama-launcher", version, about = "Configure and supervise a local llama-server")]
struct Cli {
    /// Settings file (defaults to the per-user data directory)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory containing .gguf models
    #[arg(long)]
    models_dir: Option<String>,
    /// Directory containing the llama-server binary
    #[arg(long)]
    bin_base: Option<String>,
    /// Model file name inside the models directory
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    port: Option<String>,
    /// Layers offloaded to the GPU
    #[arg(long)]
    ngl: Option<String>,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    temp: Option<String>,
    #[arg(long)]
    top_k: Option<String>,
    #[arg(long)]
    top_p: Option<String>,
    #[arg(long)]
    repeat_penalty: Option<String>,
    #[arg(long)]
    threads: Option<String>,
    #[arg(long)]
    ctx_size: Option<String>,
    #[arg(long)]
    max_tokens: Option<String>,
    /// Interface language code (es, en, pt, it, de, zh, ja)
    #[arg(long)]
    language: Option<String>,
    #[arg(long)]
    theme: Option<String>,
    /// Answer a port conflict without asking: cancel, stop or replace
    #[arg(long)]
    on_conflict: Option<ConflictDecision>,
    /// Print the models found and exit
    #[arg(long)]
    list_models: bool,
    /// Save the settings without launching
    #[arg(long)]
    save_only: bool,
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("Unsupported language: {0}")]
    Language(String),
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) -> Result<(), AppError> {
        let overrides = [
            (&self.models_dir, &mut config.models_dir),
            (&self.bin_base, &mut config.bin_base),
            (&self.model, &mut config.model),
            (&self.port, &mut config.port),
            (&self.ngl, &mut config.ngl),
            (&self.prompt, &mut config.prompt),
            (&self.temp, &mut config.temp),
            (&self.top_k, &mut config.top_k),
            (&self.top_p, &mut config.top_p),
            (&self.repeat_penalty, &mut config.repeat_penalty),
            (&self.threads, &mut config.threads),
            (&self.ctx_size, &mut config.ctx_size),
            (&self.max_tokens, &mut config.max_tokens),
            (&self.theme, &mut config.theme),
        ];
        for (value, slot) in overrides {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }

        if let Some(code) = &self.language {
            config.language =
                Language::from_code(code).ok_or_else(|| AppError::Language(code.clone()))?;
        }
        Ok(())
    }
}

/// Asks the port-conflict question on the terminal
struct TerminalPrompt;

#[async_trait]
impl ConflictPrompt for TerminalPrompt {
    async fn resolve_conflict(&self, port: u16, pid: u32) -> ConflictDecision {
        println!("A llama-server is already running on port {} (PID {}).", port, pid);
        let mut stdin = BufReader::new(tokio::io::stdin());
        loop {
            print!("[c]ancel, [s]top it, or stop it and start a new one [y]? ");
            let _ = std::io::stdout().flush();

            let mut line = String::new();
            match stdin.read_line(&mut line).await {
                Ok(0) | Err(_) => return ConflictDecision::Cancel,
                Ok(_) => match line.parse() {
                    Ok(decision) => return decision,
                    Err(e) => eprintln!("{}", e),
                },
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("llama_launcher=info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, AppError> {
    let store = match &cli.config {
        Some(path) => ConfigStore::new(path),
        None => ConfigStore::default_location()?,
    };
    let mut config = store.load();
    cli.apply(&mut config)?;

    if cli.list_models {
        let models = find_models(&config.models_dir);
        if models.is_empty() {
            println!("No GGUF models found in {:?}", config.models_dir);
        }
        for model in models {
            println!("{}", model.display_name);
        }
        return Ok(ExitCode::SUCCESS);
    }

    if cli.save_only {
        store.try_save(&config)?;
        println!("Settings saved to {}", store.path().display());
        return Ok(ExitCode::SUCCESS);
    }

    let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    let mut launcher = Launcher::new(store, Supervisor::new(tx));
    let prompt: Box<dyn ConflictPrompt> = match cli.on_conflict {
        Some(decision) => Box::new(FixedDecision(decision)),
        None => Box::new(TerminalPrompt),
    };

    let report = match launcher.launch(&config, prompt.as_ref()).await? {
        LaunchOutcome::Stopped { pid, termination } => {
            if termination.is_terminated() {
                println!("Stopped the server with PID {}.", pid);
                return Ok(ExitCode::SUCCESS);
            }
            eprintln!("Warning: the server with PID {} may still be running.", pid);
            return Ok(ExitCode::FAILURE);
        }
        LaunchOutcome::Started(report) => report,
    };

    for warning in &report.warnings {
        eprintln!("Warning: {}", warning);
    }
    println!("Model: {}", report.model.display_name);
    println!("Server started on {} (Ctrl-C to stop)", report.url);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut output_closed = false;
    let code = loop {
        tokio::select! {
            Some(event) = events.recv() => {
                output_closed |= event.is_final();
                print_event(event);
            }
            status = launcher.supervisor_mut().wait() => {
                match status {
                    Some(status) if status.success() => {
                        println!("Server exited.");
                        break ExitCode::SUCCESS;
                    }
                    Some(status) => {
                        eprintln!("Server exited with {}", status);
                        break ExitCode::FAILURE;
                    }
                    None => break ExitCode::FAILURE,
                }
            }
            _ = &mut ctrl_c => {
                println!("Stopping server...");
                if launcher.stop().await {
                    println!("Server stopped.");
                    break ExitCode::SUCCESS;
                }
                eprintln!("Warning: the server may still be running.");
                break ExitCode::FAILURE;
            }
        }
    };

    if !output_closed {
        for event in drain_events(&mut events, OUTPUT_DRAIN_LIMIT).await {
            print_event(event);
        }
    }
    Ok(code)
}

fn print_event(event: ServerEvent) {
    match event {
        ServerEvent::Started { pid, command } => {
            println!("Executing: {}\n", command);
            tracing::debug!("Server PID {}", pid);
        }
        ServerEvent::Line(line) => println!("{}", line),
        ServerEvent::Closed => tracing::debug!("Server output closed"),
        ServerEvent::Failed(reason) => eprintln!("Error reading server output: {}", reason),
    }
}
