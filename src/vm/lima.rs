//! Lima VM backend
//!
//! Readiness comes from `limactl list --json <name>`, which prints one JSON
//! object per instance and line.

use super::{
    Environment, EnvironmentError, Launcher, SshDestination, program_name, run_bounded,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const RUNNING: &str = "Running";

#[derive(Debug, Deserialize)]
struct Instance {
    name: String,
    #[serde(default)]
    status: String,
}

pub struct LimaVm {
    name: String,
    timeout: Duration,
}

impl LimaVm {
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
        }
    }

    pub fn launcher(&self) -> Launcher {
        Launcher::lima(&self.name)
    }

    /// Lima writes an ssh config per instance; the host alias is `lima-<name>`
    pub fn ssh_destination(&self) -> SshDestination {
        let config_file = lima_home().map(|home| home.join(&self.name).join("ssh.config"));
        SshDestination {
            config_file,
            host: format!("lima-{}", self.name),
        }
    }
}

fn lima_home() -> Option<PathBuf> {
    match env::var_os("LIMA_HOME") {
        Some(home) if !home.is_empty() => Some(PathBuf::from(home)),
        _ => dirs::home_dir().map(|home| home.join(".lima")),
    }
}

/// Status of `name` in `limactl list --json` output
fn instance_status(stdout: &str, name: &str) -> Result<Option<String>, EnvironmentError> {
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let instance: Instance = serde_json::from_str(line)
            .map_err(|e| EnvironmentError::Probe(format!("unexpected limactl output: {}", e)))?;
        if instance.name == name {
            return Ok(Some(instance.status));
        }
    }
    Ok(None)
}

#[async_trait]
impl Environment for LimaVm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_ready(&self) -> Result<(), EnvironmentError> {
        let mut command = Command::new("limactl");
        command.args(["list", "--json", self.name.as_str()]);
        let program = program_name(&command);

        let output = run_bounded(command, self.timeout)
            .await
            .map_err(|source| EnvironmentError::Spawn { program, source })?
            .ok_or(EnvironmentError::Timeout(self.timeout))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match instance_status(&stdout, &self.name)? {
            Some(status) if status == RUNNING => {
                debug!("VM '{}' is running", self.name);
                Ok(())
            }
            Some(status) => Err(EnvironmentError::NotRunning {
                name: self.name.clone(),
                status,
            }),
            None if output.status.success() || stdout.trim().is_empty() => {
                Err(EnvironmentError::NotFound(self.name.clone()))
            }
            None => Err(EnvironmentError::Probe(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
        }
    }
}
