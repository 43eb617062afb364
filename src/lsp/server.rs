use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::utils::error::LspError;

/// How to launch a language server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct ServerCommand {
    /// Display name; also names the transcript file.
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ServerCommand {
    pub fn new(name: &str, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
        }
    }

    /// Locate the program on `PATH`.
    pub fn resolve(&self) -> Result<PathBuf, LspError> {
        which::which(&self.program)
            .map_err(|_| LspError::ServerNotInstalled { server: self.name.clone() })
    }
}

/// A running language-server process.
pub struct LspServer {
    process: Child,
    name: String,
}

impl LspServer {
    /// Spawn `command` with `workspace_root` as its working directory.
    pub fn start(command: &ServerCommand, workspace_root: &Path) -> Result<Self, LspError> {
        let program = command.resolve()?;

        tracing::debug!(
            "Starting {} LSP server ({}) in workspace: {}",
            command.name,
            program.display(),
            workspace_root.display()
        );

        let mut process = Command::new(&program)
            .args(&command.args)
            .current_dir(workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LspError::Spawn { server: command.name.clone(), source })?;

        tracing::debug!("{} LSP server process started (pid: {:?})", command.name, process.id());

        if let Some(stderr) = process.stderr.take() {
            let name = command.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[{name} stderr] {line}");
                }
            });
        }

        Ok(Self { process, name: command.name.clone() })
    }

    pub fn take_stdin(&mut self) -> Result<ChildStdin, LspError> {
        self.process.stdin.take().ok_or(LspError::Pipe { stream: "stdin" })
    }

    pub fn take_stdout(&mut self) -> Result<BufReader<ChildStdout>, LspError> {
        self.process.stdout.take().map(BufReader::new).ok_or(LspError::Pipe { stream: "stdout" })
    }

    /// Wait up to `grace` for the process to exit on its own, then kill it.
    ///
    /// Best effort: failures to wait or kill are logged, never returned.
    pub async fn shutdown(mut self, grace: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(grace, self.process.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("{} LSP server exited: {status}", self.name);
                return Some(status);
            }
            Ok(Err(err)) => tracing::debug!("Waiting on {} LSP server failed: {err}", self.name),
            Err(_) => {
                tracing::debug!("{} LSP server still running after {grace:?}, killing", self.name);
            }
        }

        if let Err(err) = self.process.kill().await {
            tracing::debug!("Killing {} LSP server failed: {err}", self.name);
            return None;
        }
        self.process.try_wait().ok().flatten()
    }
}

impl Drop for LspServer {
    fn drop(&mut self) {
        let _ = self.process.start_kill();
    }
}
