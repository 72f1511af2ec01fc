//! Agent child process spawner.
//!
//! Spawns agent processes with piped stdin/stdout/stderr and
//! `kill_on_drop(true)` so children are cleaned up even if the gateway
//! aborts. The spawner only launches the process and captures its stdio;
//! the handshake and stream loops belong to [`peer`](crate::protocol::peer).

use std::path::PathBuf;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::{AppError, Result};

/// Command line used to launch one agent child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    /// Executable to run.
    pub program: String,
    /// Arguments passed before any protocol traffic.
    pub args: Vec<String>,
    /// Working directory for the child; inherits the gateway's when absent.
    pub cwd: Option<PathBuf>,
}

/// A freshly spawned agent child with its captured stdio handles.
#[derive(Debug)]
pub struct SpawnedAgent {
    /// Child process handle — kept alive so `kill_on_drop` works.
    pub child: Child,
    /// Agent's stdin for outbound protocol frames.
    pub stdin: ChildStdin,
    /// Agent's stdout for inbound protocol frames.
    pub stdout: ChildStdout,
    /// Agent's stderr, drained into the bounded ring.
    pub stderr: ChildStderr,
}

/// Spawn an agent child process with piped stdio.
///
/// # Errors
///
/// - [`AppError::Protocol`]`("failed to spawn agent: …")` — OS spawn failure.
/// - [`AppError::Protocol`]`("failed to capture agent …")` — a stdio handle
///   was not piped (should not occur).
pub fn spawn_agent(command: &AgentCommand) -> Result<SpawnedAgent> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);

    if let Some(ref cwd) = command.cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Protocol(format!(
            "failed to spawn agent `{}`: {err}",
            command.program
        ))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Protocol("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Protocol("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Protocol("failed to capture agent stderr".into()))?;

    Ok(SpawnedAgent {
        child,
        stdin,
        stdout,
        stderr,
    })
}
