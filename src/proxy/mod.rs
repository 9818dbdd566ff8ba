//! Local proxies into the VPN
//!
//! - SOCKS5: an `ssh -D` tunnel into the VM, owned by lima-vpn
//! - HTTP: an always-on service inside the VM; only checked for reachability

pub mod process;
pub mod socks;

pub use process::{ProcessInfo, ProcessSignature, ProcessTable, SystemProcessTable};
pub use socks::{SocksStart, SocksTunnel, SshTunnelSpawner, TunnelSpawner};

use crate::config::{ProxyConfig, ProxySettings};
use crate::vm::SshDestination;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to run {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("Proxy bookkeeping failed: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
    #[error("Tunnel did not stay up: {0}")]
    ExitedEarly(String),
    #[error("Another lima-vpn is starting the tunnel (lock {} busy)", .0.display())]
    Busy(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Socks,
    Http,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProxyKind::Socks => "SOCKS5",
            ProxyKind::Http => "HTTP",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
    /// HTTP proxy answered on its port
    Available,
    Unavailable,
    Disabled,
    /// Enabled but not started automatically
    Manual,
    Failed(String),
    Stopped { count: usize },
    NotRunning,
    /// Left running on disconnect
    Kept,
}

/// One line of a connect or disconnect report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyReport {
    pub kind: ProxyKind,
    pub port: u16,
    pub outcome: ProxyOutcome,
}

impl ProxyReport {
    /// The proxy can be used right now
    pub fn is_usable(&self) -> bool {
        matches!(
            self.outcome,
            ProxyOutcome::Started { .. }
                | ProxyOutcome::AlreadyRunning { .. }
                | ProxyOutcome::Available
        )
    }
}

impl fmt::Display for ProxyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, port) = (self.kind, self.port);
        match &self.outcome {
            ProxyOutcome::Started { pid } => {
                write!(f, "{} proxy: localhost:{} (started, pid {})", kind, port, pid)
            }
            ProxyOutcome::AlreadyRunning { pid } => {
                write!(f, "{} proxy: localhost:{} (already running, pid {})", kind, port, pid)
            }
            ProxyOutcome::Available => write!(f, "{} proxy: localhost:{}", kind, port),
            ProxyOutcome::Unavailable => {
                write!(f, "{} proxy: localhost:{} is not reachable", kind, port)
            }
            ProxyOutcome::Disabled => write!(f, "{} proxy: disabled", kind),
            ProxyOutcome::Manual => write!(f, "{} proxy: not started (auto_start is off)", kind),
            ProxyOutcome::Failed(reason) => write!(f, "{} proxy: failed ({})", kind, reason),
            ProxyOutcome::Stopped { count } => {
                write!(f, "{} proxy: stopped ({} process(es))", kind, count)
            }
            ProxyOutcome::NotRunning => write!(f, "{} proxy: not running", kind),
            ProxyOutcome::Kept => write!(f, "{} proxy: left running", kind),
        }
    }
}

/// Liveness of one enabled proxy, for status output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyState {
    pub kind: ProxyKind,
    pub port: u16,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.running, self.pid) {
            (true, Some(pid)) => {
                write!(f, "{} proxy: localhost:{} (pid {})", self.kind, self.port, pid)
            }
            (true, None) => write!(f, "{} proxy: localhost:{}", self.kind, self.port),
            (false, _) => write!(f, "{} proxy: not running (port {})", self.kind, self.port),
        }
    }
}

/// Proxy lifecycle as seen by the orchestrator. Never fails as a whole:
/// per-proxy problems are reported in the returned lines.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    async fn start(&self, config: &ProxyConfig) -> Vec<ProxyReport>;
    async fn stop(&self, config: &ProxyConfig) -> Vec<ProxyReport>;
    async fn status(&self, config: &ProxyConfig) -> Vec<ProxyState>;
}

pub struct ProxyManager {
    destination: SshDestination,
    state_dir: PathBuf,
    table: Box<dyn ProcessTable>,
    spawner: Box<dyn TunnelSpawner>,
    probe_timeout: Duration,
}

impl ProxyManager {
    pub fn new(destination: SshDestination, state_dir: PathBuf) -> Self {
        Self::with_parts(
            destination,
            state_dir,
            Box::new(SystemProcessTable),
            Box::new(SshTunnelSpawner::default()),
        )
    }

    pub fn with_parts(
        destination: SshDestination,
        state_dir: PathBuf,
        table: Box<dyn ProcessTable>,
        spawner: Box<dyn TunnelSpawner>,
    ) -> Self {
        Self {
            destination,
            state_dir,
            table,
            spawner,
            probe_timeout: Duration::from_secs(2),
        }
    }

    fn socks(&self, port: u16) -> SocksTunnel<'_> {
        SocksTunnel::new(
            port,
            &self.destination,
            &self.state_dir,
            self.table.as_ref(),
            self.spawner.as_ref(),
        )
    }

    async fn reachable(&self, port: u16) -> bool {
        let connect = TcpStream::connect(("127.0.0.1", port));
        match timeout(self.probe_timeout, connect).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Port {} refused: {}", port, e);
                false
            }
            Err(_) => false,
        }
    }

    async fn start_socks(&self, settings: &ProxySettings) -> ProxyOutcome {
        if !settings.enabled {
            return ProxyOutcome::Disabled;
        }
        if !settings.auto_start {
            return ProxyOutcome::Manual;
        }
        match self.socks(settings.port).start().await {
            Ok(SocksStart::Started(pid)) => ProxyOutcome::Started { pid },
            Ok(SocksStart::AlreadyRunning(pid)) => ProxyOutcome::AlreadyRunning { pid },
            Err(e) => {
                warn!("SOCKS proxy on port {} did not start: {}", settings.port, e);
                ProxyOutcome::Failed(e.to_string())
            }
        }
    }

    fn stop_socks(&self, settings: &ProxySettings) -> ProxyOutcome {
        if !settings.auto_stop {
            return ProxyOutcome::Kept;
        }
        match self.socks(settings.port).stop() {
            Ok(0) => ProxyOutcome::NotRunning,
            Ok(count) => ProxyOutcome::Stopped { count },
            Err(e) => {
                warn!("SOCKS proxy on port {} did not stop: {}", settings.port, e);
                ProxyOutcome::Failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl ProxyControl for ProxyManager {
    async fn start(&self, config: &ProxyConfig) -> Vec<ProxyReport> {
        let mut reports = vec![ProxyReport {
            kind: ProxyKind::Socks,
            port: config.socks.port,
            outcome: self.start_socks(&config.socks).await,
        }];

        let http = if !config.http.enabled {
            ProxyOutcome::Disabled
        } else if self.reachable(config.http.port).await {
            ProxyOutcome::Available
        } else {
            ProxyOutcome::Unavailable
        };
        reports.push(ProxyReport {
            kind: ProxyKind::Http,
            port: config.http.port,
            outcome: http,
        });
        reports
    }

    async fn stop(&self, config: &ProxyConfig) -> Vec<ProxyReport> {
        let mut reports = vec![ProxyReport {
            kind: ProxyKind::Socks,
            port: config.socks.port,
            outcome: self.stop_socks(&config.socks),
        }];
        // The HTTP proxy belongs to the VM, not to us
        if config.http.enabled {
            reports.push(ProxyReport {
                kind: ProxyKind::Http,
                port: config.http.port,
                outcome: ProxyOutcome::Kept,
            });
        }
        reports
    }

    async fn status(&self, config: &ProxyConfig) -> Vec<ProxyState> {
        let mut states = Vec::new();
        if config.socks.enabled {
            let pid = match self.socks(config.socks.port).running() {
                Ok(pid) => pid,
                Err(e) => {
                    warn!("Could not check SOCKS proxy: {}", e);
                    None
                }
            };
            states.push(ProxyState {
                kind: ProxyKind::Socks,
                port: config.socks.port,
                running: pid.is_some(),
                pid,
            });
        }
        if config.http.enabled {
            states.push(ProxyState {
                kind: ProxyKind::Http,
                port: config.http.port,
                running: self.reachable(config.http.port).await,
                pid: None,
            });
        }
        states
    }
}
