//! Process table access for proxy bookkeeping
//!
//! Tunnels are normally tracked through their pid file. The table is used
//! to validate a recorded pid and to adopt a tunnel started by an earlier
//! run that lost its pid file.

use super::ProxyError;
use std::fmt;
use std::process::Command;

/// Argument runs that together identify one of our processes
///
/// Each fragment is one or more whole arguments (`"-D 1080"` is the pair
/// `-D`, `1080`) that must appear consecutively in the command line. The
/// program itself is compared by file name, so `ssh` matches `/usr/bin/ssh`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSignature(Vec<String>);

impl ProcessSignature {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fragments.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, command_line: &str) -> bool {
        let mut args: Vec<&str> = command_line.split_whitespace().collect();
        if let Some(program) = args.first_mut() {
            let path = *program;
            *program = path.rsplit('/').next().unwrap_or(path);
        }
        self.0.iter().all(|fragment| {
            let run: Vec<&str> = fragment.split_whitespace().collect();
            !run.is_empty() && args.windows(run.len()).any(|window| window == run.as_slice())
        })
    }
}

impl fmt::Display for ProcessSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command_line: String,
}

pub trait ProcessTable: Send + Sync {
    fn list(&self) -> Result<Vec<ProcessInfo>, ProxyError>;

    /// Send a termination request. `Ok(false)` if the process was already gone.
    fn terminate(&self, pid: u32) -> Result<bool, ProxyError>;

    fn command_line(&self, pid: u32) -> Result<Option<String>, ProxyError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|p| p.pid == pid)
            .map(|p| p.command_line))
    }

    fn find(&self, signature: &ProcessSignature) -> Result<Vec<u32>, ProxyError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|p| signature.matches(&p.command_line))
            .map(|p| p.pid)
            .collect())
    }
}

/// The host's process table, read through `ps`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn list(&self) -> Result<Vec<ProcessInfo>, ProxyError> {
        let output = Command::new("ps")
            .args(["-eo", "pid=,args="])
            .output()
            .map_err(|source| ProxyError::Spawn {
                program: "ps".to_string(),
                source,
            })?;
        Ok(parse_ps(
            &String::from_utf8_lossy(&output.stdout),
            std::process::id(),
        ))
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> Result<bool, ProxyError> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return Ok(false);
        };
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(errno) => Err(ProxyError::Signal {
                pid,
                reason: errno.desc().to_string(),
            }),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self, pid: u32) -> Result<bool, ProxyError> {
        let status = Command::new("taskkill")
            .args(["/PID".to_string(), pid.to_string()])
            .status()
            .map_err(|source| ProxyError::Spawn {
                program: "taskkill".to_string(),
                source,
            })?;
        Ok(status.success())
    }
}

/// Parse `ps -eo pid=,args=` output, leaving out our own process
fn parse_ps(output: &str, own_pid: u32) -> Vec<ProcessInfo> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, args) = line.split_once(char::is_whitespace)?;
            let pid: u32 = pid.parse().ok()?;
            (pid != own_pid).then(|| ProcessInfo {
                pid,
                command_line: args.trim().to_string(),
            })
        })
        .collect()
}
