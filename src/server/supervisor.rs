//! Server process supervision
//!
//! Owns the single `llama-server` child. The child leads its own process
//! group so stop signals reach anything it spawns; its combined output is
//! relayed on a dedicated thread.
//!
//! State machine: `Idle -> Starting -> Running -> Stopping -> Idle`.
//! A failed start goes straight back to `Idle`.

use crate::server::command::ServerCommand;
use crate::system::signals::{self, Signal, Termination};
use chrono::{DateTime, Utc};
use std::io::{self, BufRead, BufReader, Read};
use std::process::{ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

/// How long a server gets to exit after SIGTERM
pub const STOP_GRACE_PERIOD: Duration = Duration::from_millis(2500);

/// How long to wait for the kernel to reap the child after SIGKILL
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Messages sent from the supervisor and its relay thread to the single consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Child spawned; `command` is the echoed command line
    Started { pid: u32, command: String },
    /// One line of combined stdout/stderr, without the trailing newline
    Line(String),
    /// Output stream reached EOF. Sent once.
    Closed,
    /// Reading the output stream failed. Sent once, in place of `Closed`.
    Failed(String),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Cannot start a server while the supervisor is {0:?}")]
    NotIdle(SupervisorState),
    #[error("Failed to create output pipe: {0}")]
    Pipe(#[source] io::Error),
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to start output relay: {0}")]
    Relay(#[source] io::Error),
}

/// Public view of the running server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandle {
    pub pid: u32,
    pub command: String,
    pub started_at: DateTime<Utc>,
}

/// Live child record, owned only by [`Supervisor`]
struct ServerProcess {
    child: Child,
    handle: ServerHandle,
    _relay: JoinHandle<()>,
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        // Still unreaped: take the whole group down with it
        if self.child.id().is_some() {
            tracing::warn!("Killing server process group {} on drop", self.handle.pid);
            let _ = signals::signal_group(self.handle.pid, Signal::Kill);
            let _ = self.child.start_kill();
        }
    }
}

/// Supervises at most one server process
pub struct Supervisor {
    state: SupervisorState,
    process: Option<ServerProcess>,
    events: UnboundedSender<ServerEvent>,
    grace: Duration,
}

impl Supervisor {
    /// Output and lifecycle events are delivered, in order, to `events`
    pub fn new(events: UnboundedSender<ServerEvent>) -> Self {
        Self {
            state: SupervisorState::Idle,
            process: None,
            events,
            grace: STOP_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SupervisorState::Running
    }

    pub fn current(&self) -> Option<&ServerHandle> {
        self.process.as_ref().map(|process| &process.handle)
    }

    /// Spawn `command` in its working directory. Only allowed while idle.
    pub fn start(&mut self, command: &ServerCommand) -> Result<ServerHandle, SupervisorError> {
        if self.state != SupervisorState::Idle {
            return Err(SupervisorError::NotIdle(self.state));
        }

        self.state = SupervisorState::Starting;
        match self.spawn(command) {
            Ok(process) => {
                let handle = process.handle.clone();
                self.process = Some(process);
                self.state = SupervisorState::Running;
                tracing::info!("Server started with PID {}", handle.pid);
                Ok(handle)
            }
            Err(e) => {
                self.state = SupervisorState::Idle;
                tracing::error!("Failed to start server: {}", e);
                Err(e)
            }
        }
    }

    fn spawn(&self, command: &ServerCommand) -> Result<ServerProcess, SupervisorError> {
        let (reader, writer) = io::pipe().map_err(SupervisorError::Pipe)?;
        let stderr = writer.try_clone().map_err(SupervisorError::Pipe)?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr);
        #[cfg(unix)]
        cmd.process_group(0);

        let spawned = cmd.spawn();
        // Our copies of the write end must go, or the relay never sees EOF
        drop(cmd);

        let mut child = spawned.map_err(|source| SupervisorError::Spawn {
            program: command.program.display().to_string(),
            source,
        })?;

        let pid = child.id().unwrap_or_default();
        let handle = ServerHandle {
            pid,
            command: command.to_string(),
            started_at: Utc::now(),
        };
        let _ = self.events.send(ServerEvent::Started {
            pid,
            command: handle.command.clone(),
        });

        let events = self.events.clone();
        let relay = std::thread::Builder::new()
            .name(format!("server-output-{}", pid))
            .spawn(move || relay_output(reader, events));
        let relay = match relay {
            Ok(relay) => relay,
            Err(e) => {
                let _ = signals::signal_group(pid, Signal::Kill);
                let _ = child.start_kill();
                return Err(SupervisorError::Relay(e));
            }
        };

        Ok(ServerProcess {
            child,
            handle,
            _relay: relay,
        })
    }

    /// Stop the supervised server. True when its exit was confirmed.
    pub async fn stop(&mut self) -> bool {
        self.stop_with_outcome().await.is_terminated()
    }

    /// Stop the supervised server and report how it ended.
    ///
    /// The handle is released and the state returns to `Idle` whatever the
    /// outcome, including when this future is dropped mid-wait.
    pub async fn stop_with_outcome(&mut self) -> Termination {
        let Some(mut process) = self.process.take() else {
            self.state = SupervisorState::Idle;
            return Termination::AlreadyExited;
        };

        self.state = SupervisorState::Stopping;
        let _idle = IdleOnDrop(&mut self.state);

        let outcome = shutdown_child(&mut process.child, process.handle.pid, self.grace).await;
        if let Termination::Failed(reason) = &outcome {
            tracing::warn!(
                "Server (PID {}) may still be running: {}",
                process.handle.pid,
                reason
            );
        }
        outcome
    }

    /// Stop a server by pid. Delegates to [`Self::stop_with_outcome`] when the
    /// pid is our own child; otherwise the supervisor's state is untouched.
    pub async fn stop_pid(&mut self, pid: u32) -> Termination {
        if self.current().map(|handle| handle.pid) == Some(pid) {
            return self.stop_with_outcome().await;
        }
        signals::terminate_pid(pid, self.grace).await
    }

    /// Notice a server that exited on its own
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        let process = self.process.as_mut()?;
        match process.child.try_wait() {
            Ok(Some(status)) => {
                tracing::info!("Server (PID {}) exited: {}", process.handle.pid, status);
                self.process = None;
                self.state = SupervisorState::Idle;
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Could not query server status: {}", e);
                None
            }
        }
    }

    /// Wait for the server to exit on its own. `None` when nothing is running.
    pub async fn wait(&mut self) -> Option<ExitStatus> {
        let process = self.process.as_mut()?;
        let status = process.child.wait().await;
        let pid = process.handle.pid;
        self.process = None;
        self.state = SupervisorState::Idle;
        match status {
            Ok(status) => {
                tracing::info!("Server (PID {}) exited: {}", pid, status);
                Some(status)
            }
            Err(e) => {
                tracing::warn!("Lost track of server (PID {}): {}", pid, e);
                None
            }
        }
    }
}

struct IdleOnDrop<'a>(&'a mut SupervisorState);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        *self.0 = SupervisorState::Idle;
    }
}

/// SIGTERM to the group, wait up to `grace`, then SIGKILL and reap
async fn shutdown_child(child: &mut Child, pid: u32, grace: Duration) -> Termination {
    if child.id().is_none() || matches!(child.try_wait(), Ok(Some(_))) {
        tracing::debug!("Server (PID {}) had already exited", pid);
        return Termination::AlreadyExited;
    }

    tracing::info!("Stopping server (PID {})", pid);
    match signals::signal_group(pid, Signal::Terminate) {
        Ok(()) => match timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!("Server stopped gracefully ({})", status);
                return Termination::Graceful;
            }
            Ok(Err(e)) => tracing::warn!("Waiting for server failed: {}", e),
            Err(_) => tracing::warn!(
                "Server (PID {}) did not exit within {:?}, sending SIGKILL",
                pid,
                grace
            ),
        },
        Err(e) => {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return Termination::Graceful;
            }
            tracing::warn!("SIGTERM to server (PID {}) failed: {}", pid, e);
        }
    }

    if let Err(e) = signals::signal_group(pid, Signal::Kill) {
        tracing::warn!("SIGKILL to server group {} failed: {}", pid, e);
    }
    let _ = child.start_kill();

    match timeout(KILL_REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!("Server killed ({})", status);
            Termination::Forced
        }
        Ok(Err(e)) => Termination::Failed(e.to_string()),
        Err(_) => Termination::Failed("still running after SIGKILL".to_string()),
    }
}

/// Forward each line of `reader` until EOF or error, then report once and exit.
impl ServerEvent {
    /// Last event the relay sends for a child
    pub fn is_final(&self) -> bool {
        matches!(self, ServerEvent::Closed | ServerEvent::Failed(_))
    }
}

/// Receive the output still in flight after the child exited, up to and
/// including the final event. Gives up after `limit`.
pub async fn drain_events(
    events: &mut UnboundedReceiver<ServerEvent>,
    limit: Duration,
) -> Vec<ServerEvent> {
    let deadline = tokio::time::Instant::now() + limit;
    let mut drained = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        let done = event.is_final();
        drained.push(event);
        if done {
            break;
        }
    }
    if !drained.last().is_some_and(ServerEvent::is_final) {
        tracing::debug!("Server output did not close within {:?}", limit);
    }
    drained
}

pub(crate) fn relay_output(reader: impl Read, events: UnboundedSender<ServerEvent>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                let _ = events.send(ServerEvent::Closed);
                return;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if events.send(ServerEvent::Line(line)).is_err() {
                    // Consumer gone
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = events.send(ServerEvent::Failed(e.to_string()));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn sh(script: &str) -> ServerCommand {
        ServerCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: std::env::temp_dir(),
        }
    }

    /// Collect events up to and including the terminal `Closed`/`Failed`
    async fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for server events")
                .expect("event channel closed");
            let done = event.is_final();
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_relays_merged_output_in_order() {
        let (tx, mut rx) = unbounded_channel();
        let mut supervisor = Supervisor::new(tx);

        let handle = supervisor
            .start(&sh("echo one; echo two >&2; printf 'three'"))
            .unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Running);

        let events = drain(&mut rx).await;
        assert_eq!(
            events,
            [
                ServerEvent::Started {
                    pid: handle.pid,
                    command: handle.command.clone()
                },
                ServerEvent::Line("one".into()),
                ServerEvent::Line("two".into()),
                ServerEvent::Line("three".into()),
                ServerEvent::Closed,
            ]
        );

        assert!(supervisor.wait().await.unwrap().success());
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert!(supervisor.current().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_stays_idle() {
        let (tx, _rx) = unbounded_channel();
        let mut supervisor = Supervisor::new(tx);
        let command = ServerCommand {
            program: PathBuf::from("/definitely/not/here/llama-server"),
            args: Vec::new(),
            working_dir: std::env::temp_dir(),
        };

        let err = supervisor.start(&command).unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert_eq!(supervisor.state(), SupervisorState::Idle);

        let mut bad_dir = sh("true");
        bad_dir.working_dir = PathBuf::from("/definitely/not/here");
        assert!(supervisor.start(&bad_dir).is_err());
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_start_rejected_while_running() {
        let (tx, _rx) = unbounded_channel();
        let mut supervisor = Supervisor::new(tx);
        supervisor.start(&sh("sleep 30")).unwrap();

        let err = supervisor.start(&sh("sleep 30")).unwrap_err();
        assert!(matches!(err, SupervisorError::NotIdle(SupervisorState::Running)));

        assert!(supervisor.stop().await);
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_graceful_without_escalation() {
        let (tx, mut rx) = unbounded_channel();
        let mut supervisor = Supervisor::new(tx).with_grace_period(Duration::from_secs(2));
        supervisor.start(&sh("sleep 30")).unwrap();

        let started = std::time::Instant::now();
        let outcome = supervisor.stop_with_outcome().await;
        assert_eq!(outcome, Termination::Graceful);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert!(supervisor.current().is_none());

        let events = drain(&mut rx).await;
        assert_eq!(events.last(), Some(&ServerEvent::Closed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_escalates_when_sigterm_ignored() {
        let (tx, mut rx) = unbounded_channel();
        let grace = Duration::from_millis(400);
        let mut supervisor = Supervisor::new(tx).with_grace_period(grace);
        supervisor
            .start(&sh("trap '' TERM; echo ready; while :; do sleep 0.1; done"))
            .unwrap();

        // Wait until the trap is installed
        loop {
            match timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap() {
                ServerEvent::Line(line) if line == "ready" => break,
                _ => continue,
            }
        }

        let started = std::time::Instant::now();
        let outcome = supervisor.stop_with_outcome().await;
        assert_eq!(outcome, Termination::Forced);
        assert!(started.elapsed() >= grace);
        assert!(started.elapsed() < grace + KILL_REAP_TIMEOUT + Duration::from_secs(1));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interrupted_stop_still_returns_to_idle() {
        let (tx, mut rx) = unbounded_channel();
        let mut supervisor = Supervisor::new(tx).with_grace_period(Duration::from_secs(30));
        let handle = supervisor
            .start(&sh("trap '' TERM; echo ready; while :; do sleep 0.1; done"))
            .unwrap();

        loop {
            match timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap() {
                ServerEvent::Line(line) if line == "ready" => break,
                _ => continue,
            }
        }

        // The child ignores SIGTERM, so the stop is abandoned mid-grace
        let abandoned = timeout(Duration::from_millis(200), supervisor.stop_with_outcome()).await;
        assert!(abandoned.is_err());

        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert!(supervisor.current().is_none());
        assert!(signals::wait_for_exit(handle.pid, Duration::from_secs(3)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_reaches_whole_process_group() {
        let (tx, mut rx) = unbounded_channel();
        let mut supervisor = Supervisor::new(tx);
        supervisor.start(&sh("sleep 30 & echo $!; wait")).unwrap();

        let grandchild = loop {
            match timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap() {
                ServerEvent::Line(line) => break line.trim().parse::<u32>().unwrap(),
                _ => continue,
            }
        };
        assert!(signals::is_alive(grandchild));

        assert!(supervisor.stop().await);
        assert!(signals::wait_for_exit(grandchild, Duration::from_secs(3)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_poll_exit_returns_to_idle() {
        let (tx, mut rx) = unbounded_channel();
        let mut supervisor = Supervisor::new(tx);
        supervisor.start(&sh("exit 3")).unwrap();
        drain(&mut rx).await;

        let status = loop {
            if let Some(status) = supervisor.poll_exit() {
                break status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(status.code(), Some(3));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert!(supervisor.stop().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_pid_leaves_own_state_alone() {
        let (tx, _rx) = unbounded_channel();
        let mut supervisor = Supervisor::new(tx);
        let mut other = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let other_pid = other.id().unwrap();
        let reaper = tokio::spawn(async move { other.wait().await });

        assert!(supervisor.stop_pid(other_pid).await.is_terminated());
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        reaper.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_late_output() {
        let (tx, mut rx) = unbounded_channel();
        tx.send(ServerEvent::Line("early".to_string())).unwrap();
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(ServerEvent::Line("late".to_string())).unwrap();
            tx.send(ServerEvent::Closed).unwrap();
            tx.send(ServerEvent::Line("after close".to_string())).unwrap();
        });

        let events = drain_events(&mut rx, Duration::from_secs(5)).await;
        assert_eq!(
            events,
            vec![
                ServerEvent::Line("early".to_string()),
                ServerEvent::Line("late".to_string()),
                ServerEvent::Closed,
            ]
        );
        late.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_limit() {
        let (tx, mut rx) = unbounded_channel();
        tx.send(ServerEvent::Line("only".to_string())).unwrap();

        let events = drain_events(&mut rx, Duration::from_millis(100)).await;
        assert_eq!(events, vec![ServerEvent::Line("only".to_string())]);
        drop(tx);
    }

    #[test]
    fn test_relay_reports_stream_error_once() {
        struct Broken {
            sent: bool,
        }
        impl Read for Broken {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if !self.sent {
                    self.sent = true;
                    let data = b"partial line\n";
                    buf[..data.len()].copy_from_slice(data);
                    return Ok(data.len());
                }
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke"))
            }
        }

        let (tx, mut rx) = unbounded_channel();
        relay_output(Broken { sent: false }, tx);

        assert_eq!(rx.try_recv().unwrap(), ServerEvent::Line("partial line".into()));
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Failed(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_relay_handles_crlf_and_invalid_utf8() {
        let (tx, mut rx) = unbounded_channel();
        relay_output(&b"dos line\r\n\xffbad\n"[..], tx);

        assert_eq!(rx.try_recv().unwrap(), ServerEvent::Line("dos line".into()));
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::Line("\u{fffd}bad".into()));
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::Closed);
        assert!(rx.try_recv().is_err());
    }
}
