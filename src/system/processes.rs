//! Process inspection
//!
//! Finds an already running `llama-server` bound to a given port.

use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};

/// Executable name of the supervised inference server
pub const SERVER_BINARY: &str = "llama-server";

/// One row of the process table, as far as server detection cares
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub args: Vec<String>,
    /// Linux lists threads as processes carrying the parent's command line
    pub is_thread: bool,
    pub is_zombie: bool,
}

/// Return the pid of a live `llama-server` started with `--port <port>`.
///
/// Processes that disappear or can't be read during the scan are skipped.
/// This walks the whole process table; call it off the async runtime.
pub fn check_server_running(port: u16) -> Option<u32> {
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    let own_pid = sysinfo::get_current_pid().ok().map(|pid| pid.as_u32());

    let entries = sys.processes().iter().map(|(pid, process)| ProcessEntry {
        pid: pid.as_u32(),
        name: process.name().to_string_lossy().into_owned(),
        args: process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect(),
        is_thread: process.thread_kind().is_some(),
        is_zombie: process.status() == ProcessStatus::Zombie,
    });

    match find_server(entries, port, own_pid) {
        Some(pid) => {
            tracing::info!("Found existing server on port {} with PID {}", port, pid);
            Some(pid)
        }
        None => {
            tracing::debug!("No server found running on port {}", port);
            None
        }
    }
}

/// Lowest pid among live, non-thread entries serving `port`, skipping `own_pid`
pub fn find_server(
    entries: impl IntoIterator<Item = ProcessEntry>,
    port: u16,
    own_pid: Option<u32>,
) -> Option<u32> {
    entries
        .into_iter()
        .filter(|entry| Some(entry.pid) != own_pid)
        .filter(|entry| !entry.is_thread && !entry.is_zombie)
        .filter(|entry| is_server_on_port(&entry.name, &entry.args, port))
        .map(|entry| entry.pid)
        .min()
}

/// Whether a process looks like `llama-server` bound to `port`.
///
/// The port must be its own argument after `--port` (or `--port=<port>`),
/// so 8080 never matches 80801.
pub fn is_server_on_port(name: &str, args: &[String], port: u16) -> bool {
    let is_server = name.contains(SERVER_BINARY) || args.iter().any(|arg| arg.contains(SERVER_BINARY));
    if !is_server {
        return false;
    }

    let port = port.to_string();
    let inline = format!("--port={}", port);
    args.iter().any(|arg| *arg == inline)
        || args
            .windows(2)
            .any(|pair| pair[0] == "--port" && pair[1] == port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_matches_exact_port_token() {
        let cmd = args(&["/opt/bin/llama-server", "--model", "m.gguf", "--port", "8080"]);
        assert!(is_server_on_port("llama-server", &cmd, 8080));
        assert!(!is_server_on_port("llama-server", &cmd, 808));
        assert!(!is_server_on_port("llama-server", &cmd, 9090));
    }

    #[test]
    fn test_port_prefix_does_not_match() {
        let cmd = args(&["llama-server", "--port", "80801"]);
        assert!(!is_server_on_port("llama-server", &cmd, 8080));
        let cmd = args(&["llama-server", "--port=80801"]);
        assert!(!is_server_on_port("llama-server", &cmd, 8080));
    }

    #[test]
    fn test_inline_port_form() {
        let cmd = args(&["llama-server", "--port=8080"]);
        assert!(is_server_on_port("llama-server", &cmd, 8080));
    }

    #[test]
    fn test_requires_server_marker() {
        let cmd = args(&["python3", "-m", "http.server", "--port", "8080"]);
        assert!(!is_server_on_port("python3", &cmd, 8080));

        let cmd = args(&["/usr/bin/env", "/srv/llama-server", "--port", "8080"]);
        assert!(is_server_on_port("env", &cmd, 8080));
    }

    #[test]
    fn test_flag_value_is_not_the_port() {
        let cmd = args(&["llama-server", "--threads", "8080", "--port", "1"]);
        assert!(!is_server_on_port("llama-server", &cmd, 8080));
    }

    fn entry(pid: u32, is_thread: bool) -> ProcessEntry {
        ProcessEntry {
            pid,
            name: SERVER_BINARY.to_string(),
            args: args(&["llama-server", "--port", "48555"]),
            is_thread,
            is_zombie: false,
        }
    }

    #[test]
    fn test_threads_are_not_servers() {
        // Thread ids that wrapped around below the main pid
        let table = vec![entry(3363, true), entry(12, true), entry(3322, false), entry(40, true)];
        assert_eq!(find_server(table, 48555, None), Some(3322));

        let only_threads = vec![entry(12, true), entry(40, true)];
        assert_eq!(find_server(only_threads, 48555, None), None);
    }

    #[test]
    fn test_skips_zombies_and_self() {
        let mut zombie = entry(10, false);
        zombie.is_zombie = true;
        let table = vec![zombie, entry(20, false), entry(30, false)];
        assert_eq!(find_server(table, 48555, Some(20)), Some(30));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detects_live_process() {
        let port: u16 = 48213;
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30; :", SERVER_BINARY, "--port", "48213"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        assert_eq!(check_server_running(port), Some(pid));
        assert_eq!(check_server_running(port + 1), None);

        child.kill().await.unwrap();
        assert_eq!(check_server_running(port), None);
    }
}
