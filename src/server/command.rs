//! llama-server command line

use crate::server::validation::LaunchParams;
use crate::system::processes::SERVER_BINARY;
use std::fmt;
use std::path::{Path, PathBuf};

/// Address the server binds to
pub const BIND_HOST: &str = "0.0.0.0";

/// Always-on engine flags: memory locking, continuous batching, flash attention
pub const FIXED_FLAGS: [&str; 3] = ["--mlock", "--cont-batching", "--flash-attn"];

/// A fully resolved invocation of the server binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl ServerCommand {
    /// Program followed by its arguments
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv().join(" "))
    }
}

/// Build the `llama-server` invocation for `model`.
///
/// The prompt is not passed: the server has no flag for it.
pub fn build_command(params: &LaunchParams, model: &Path) -> ServerCommand {
    let args = vec![
        "--model".to_string(),
        model.to_string_lossy().into_owned(),
        "--host".to_string(),
        BIND_HOST.to_string(),
        "--port".to_string(),
        params.port.to_string(),
        "--n-gpu-layers".to_string(),
        params.gpu_layers.to_string(),
        "--temp".to_string(),
        params.temperature.to_string(),
        "--top-k".to_string(),
        params.top_k.to_string(),
        "--top-p".to_string(),
        params.top_p.to_string(),
        "--repeat-penalty".to_string(),
        params.repeat_penalty.to_string(),
        "--threads".to_string(),
        params.threads.to_string(),
        "--ctx-size".to_string(),
        params.ctx_size.to_string(),
        "--n-predict".to_string(),
        params.max_tokens.to_string(),
    ]
    .into_iter()
    .chain(FIXED_FLAGS.iter().map(|flag| flag.to_string()))
    .collect();

    ServerCommand {
        program: params.bin_base.join(SERVER_BINARY),
        args,
        working_dir: params.bin_base.clone(),
    }
}
