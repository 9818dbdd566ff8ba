//! SOCKS5 proxy as an `ssh -D` tunnel into the VM
//!
//! The tunnel is owned through `~/.lima-vpn/socks-<port>.pid`. Start is
//! serialized with a lock file so two concurrent runs never spawn two
//! tunnels for the same port.

use super::ProxyError;
use super::process::{ProcessSignature, ProcessTable};
use crate::vm::SshDestination;
use async_trait::async_trait;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info};

#[cfg(unix)]
const LOCK_ATTEMPTS: u32 = 50;
#[cfg(unix)]
const LOCK_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksStart {
    Started(u32),
    AlreadyRunning(u32),
}

#[async_trait]
pub trait TunnelSpawner: Send + Sync {
    /// Start a detached tunnel listening on localhost:`port`; returns its pid
    async fn spawn(&self, destination: &SshDestination, port: u16) -> Result<u32, ProxyError>;
}

/// Spawns `ssh -N -D <port>` in its own process group so it outlives us
pub struct SshTunnelSpawner {
    /// How long ssh must survive to count as started
    grace: Duration,
}

impl Default for SshTunnelSpawner {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(1),
        }
    }
}

pub fn ssh_args(destination: &SshDestination, port: u16) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(config) = &destination.config_file {
        args.push("-F".to_string());
        args.push(config.to_string_lossy().into_owned());
    }
    for option in [
        "BatchMode=yes",
        "ExitOnForwardFailure=yes",
        "ServerAliveInterval=30",
    ] {
        args.push("-o".to_string());
        args.push(option.to_string());
    }
    args.push("-N".to_string());
    args.push("-D".to_string());
    args.push(port.to_string());
    args.push(destination.host.clone());
    args
}

#[async_trait]
impl TunnelSpawner for SshTunnelSpawner {
    async fn spawn(&self, destination: &SshDestination, port: u16) -> Result<u32, ProxyError> {
        let mut command = std::process::Command::new("ssh");
        command
            .args(ssh_args(destination, port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        debug!("Spawning {:?}", command);

        let mut child = tokio::process::Command::from(command)
            .spawn()
            .map_err(|source| ProxyError::Spawn {
                program: "ssh".to_string(),
                source,
            })?;
        let pid = child.id().ok_or_else(|| {
            ProxyError::ExitedEarly("ssh exited before reporting a pid".to_string())
        })?;

        tokio::time::sleep(self.grace).await;
        if let Some(status) = child.try_wait()? {
            return Err(ProxyError::ExitedEarly(format!(
                "ssh {} (is port {} already in use, or the VM unreachable?)",
                status, port
            )));
        }
        Ok(pid)
    }
}

pub struct SocksTunnel<'a> {
    port: u16,
    destination: &'a SshDestination,
    state_dir: &'a Path,
    table: &'a dyn ProcessTable,
    spawner: &'a dyn TunnelSpawner,
}

impl<'a> SocksTunnel<'a> {
    pub fn new(
        port: u16,
        destination: &'a SshDestination,
        state_dir: &'a Path,
        table: &'a dyn ProcessTable,
        spawner: &'a dyn TunnelSpawner,
    ) -> Self {
        Self {
            port,
            destination,
            state_dir,
            table,
            spawner,
        }
    }

    /// `ssh`, `-D <port>` and the VM host alias
    pub fn signature(&self) -> ProcessSignature {
        ProcessSignature::new([
            "ssh".to_string(),
            format!("-D {}", self.port),
            self.destination.host.clone(),
        ])
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join(format!("socks-{}.pid", self.port))
    }

    fn lock_file(&self) -> PathBuf {
        self.state_dir.join(format!("socks-{}.lock", self.port))
    }

    fn recorded_pid(&self) -> Option<u32> {
        fs::read_to_string(self.pid_file()).ok()?.trim().parse().ok()
    }

    fn record(&self, pid: u32) -> Result<(), ProxyError> {
        fs::create_dir_all(self.state_dir)?;
        fs::write(self.pid_file(), format!("{}\n", pid))?;
        Ok(())
    }

    fn forget(&self) {
        if let Err(e) = fs::remove_file(self.pid_file()) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("Could not remove {}: {}", self.pid_file().display(), e);
            }
        }
    }

    /// Pid of the live tunnel for this port, if any
    ///
    /// A recorded pid counts only while its command line still matches the
    /// signature. Without one, a matching process is adopted.
    pub fn running(&self) -> Result<Option<u32>, ProxyError> {
        let signature = self.signature();
        if let Some(pid) = self.recorded_pid() {
            match self.table.command_line(pid)? {
                Some(line) if signature.matches(&line) => return Ok(Some(pid)),
                _ => debug!("Pid file {} is stale", self.pid_file().display()),
            }
        }

        match self.table.find(&signature)?.first() {
            Some(&pid) => {
                info!("Adopting SOCKS tunnel on port {} (pid {})", self.port, pid);
                self.record(pid)?;
                Ok(Some(pid))
            }
            None => {
                self.forget();
                Ok(None)
            }
        }
    }

    /// Start the tunnel unless one is already up. Idempotent.
    pub async fn start(&self) -> Result<SocksStart, ProxyError> {
        fs::create_dir_all(self.state_dir)?;
        let _lock = StartLock::acquire(&self.lock_file()).await?;

        if let Some(pid) = self.running()? {
            info!("SOCKS tunnel already running on port {} (pid {})", self.port, pid);
            return Ok(SocksStart::AlreadyRunning(pid));
        }

        let pid = self.spawner.spawn(self.destination, self.port).await?;
        self.record(pid)?;
        info!("Started SOCKS tunnel on localhost:{} (pid {})", self.port, pid);
        Ok(SocksStart::Started(pid))
    }

    /// Stop every tunnel matching this port's signature. Returns how many
    /// were signalled; zero is not an error.
    pub fn stop(&self) -> Result<usize, ProxyError> {
        let mut stopped = 0;
        for pid in self.table.find(&self.signature())? {
            if self.table.terminate(pid)? {
                info!("Stopped SOCKS tunnel on port {} (pid {})", self.port, pid);
                stopped += 1;
            }
        }
        self.forget();
        Ok(stopped)
    }
}

/// Exclusive advisory lock held while checking and spawning
struct StartLock {
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl StartLock {
    fn open(path: &Path) -> Result<File, ProxyError> {
        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?)
    }

    #[cfg(unix)]
    async fn acquire(path: &Path) -> Result<Self, ProxyError> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        let mut file = Self::open(path)?;
        for _ in 0..LOCK_ATTEMPTS {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => return Ok(Self { _lock: lock }),
                Err((returned, Errno::EWOULDBLOCK)) => {
                    file = returned;
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err((_, errno)) => return Err(ProxyError::Io(io::Error::from(errno))),
            }
        }
        Err(ProxyError::Busy(path.to_path_buf()))
    }

    #[cfg(not(unix))]
    async fn acquire(path: &Path) -> Result<Self, ProxyError> {
        Ok(Self {
            _file: Self::open(path)?,
        })
    }
}
