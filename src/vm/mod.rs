//! The isolated environment the VPN client runs in
//!
//! The orchestrator only needs to know whether the environment is up. The
//! client adapter needs a way to run commands inside it ([`Launcher`]) and
//! the proxy layer needs an SSH destination to tunnel through.

pub mod lima;

pub use lima::LimaVm;

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Error, Debug)]
pub enum EnvironmentError {
    #[error("VM '{name}' is not running (status: {status}). Start it with: limactl start {name}")]
    NotRunning { name: String, status: String },
    #[error("VM '{0}' does not exist. Create it with: limactl create --name={0}")]
    NotFound(String),
    #[error("Failed to run {program}: {source}. Is Lima installed?")]
    Spawn { program: String, source: io::Error },
    #[error("Could not read VM status: {0}")]
    Probe(String),
    #[error("VM status check timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

#[async_trait]
pub trait Environment: Send + Sync {
    fn name(&self) -> &str;

    /// Succeeds only if the environment is running and reachable
    async fn ensure_ready(&self) -> Result<(), EnvironmentError>;
}

/// How to reach the environment over SSH
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshDestination {
    /// Passed as `ssh -F`
    pub config_file: Option<PathBuf>,
    pub host: String,
}

/// Builds commands that run inside the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
    prefix: Vec<String>,
}

impl Launcher {
    /// Run commands directly on this host
    pub fn local() -> Self {
        Self { prefix: Vec::new() }
    }

    /// Run commands through `limactl shell`
    pub fn lima(instance: &str) -> Self {
        Self::wrapped(
            ["limactl", "shell", "--workdir", "/", instance, "--"]
                .into_iter()
                .map(String::from)
                .collect(),
        )
    }

    /// Run commands as arguments of an arbitrary wrapper
    pub fn wrapped(prefix: Vec<String>) -> Self {
        Self { prefix }
    }

    pub fn command(&self, program: &str, args: &[&str]) -> Command {
        let mut command = match self.prefix.split_first() {
            None => Command::new(program),
            Some((wrapper, rest)) => {
                let mut command = Command::new(wrapper);
                command.args(rest).arg(program);
                command
            }
        };
        command.args(args);
        command
    }
}

/// Run a non-interactive command with captured output. `None` on timeout;
/// the child is killed in that case.
pub(crate) async fn run_bounded(
    mut command: Command,
    limit: Duration,
) -> io::Result<Option<Output>> {
    command.stdin(Stdio::null()).kill_on_drop(true);
    match timeout(limit, command.output()).await {
        Ok(output) => output.map(Some),
        Err(_) => Ok(None),
    }
}

/// Program name of a command, for error messages
pub(crate) fn program_name(command: &Command) -> String {
    command.as_std().get_program().to_string_lossy().into_owned()
}
