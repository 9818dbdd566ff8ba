//! External VPN client integration
//!
//! The VPN client runs inside the VM and is driven through its interactive
//! console. This module defines what the orchestrator needs from it
//! ([`VpnClient`]) and the concrete FortiClient CLI adapter.
//!
//! # Layers
//!
//! - `events`: bytes -> [`ClientEvent`]s, with swappable prompt matching
//! - `session`: spawns one client command and answers its prompts
//! - `forticlient`: the `forticlient vpn ...` subcommands

pub mod events;
pub mod forticlient;
pub mod session;

pub use events::{ClientEvent, EventParser, ForticlientMatcher, PromptMatcher};
pub use forticlient::ForticlientCli;
pub use session::{MAX_PASSWORD_PROMPTS, Responses};

use crate::credentials::VpnCredentials;
use crate::trust::Fingerprint;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to launch {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("I/O error talking to the VPN client: {0}")]
    Io(#[from] io::Error),
    #[error("VPN client did not finish within {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("VPN client kept asking for the password; it was probably rejected")]
    AuthenticationFailed,
    #[error("VPN client failed:\n{0}")]
    Failed(String),
}

/// How to answer the client's "continue with this certificate?" question
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificatePolicy {
    /// Always answer no; used while the trust decision is still pending
    Decline,
    /// Answer yes only if the announced fingerprint is exactly this one
    AcceptPinned(Fingerprint),
}

/// What one connect attempt showed
#[derive(Debug, Clone, Default)]
pub struct AttemptOutcome {
    /// Fingerprint the client announced, if any
    pub fingerprint: Option<Fingerprint>,
    /// The client reported the tunnel as up
    pub connected: bool,
    /// We answered yes to the certificate question
    pub certificate_accepted: bool,
    /// None if the client was still running or died from a signal
    pub exit_code: Option<i32>,
    /// Unrecognised console lines, kept verbatim
    pub output: Vec<String>,
}

impl AttemptOutcome {
    pub fn diagnostics(&self) -> String {
        if self.output.is_empty() {
            match self.exit_code {
                Some(code) => format!("(no output, exit code {})", code),
                None => "(no output)".to_string(),
            }
        } else {
            self.output.join("\n")
        }
    }
}

/// VPN state as reported by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnStatus {
    Connected,
    Disconnected,
    /// The client could not be asked (VM down, client missing, ...)
    Unavailable,
}

impl fmt::Display for VpnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VpnStatus::Connected => "Connected",
            VpnStatus::Disconnected => "Not connected",
            VpnStatus::Unavailable => "Unavailable",
        })
    }
}

/// Operations the orchestrator needs from the external VPN client
#[async_trait]
pub trait VpnClient: Send + Sync {
    /// Write gateway, port and username into the client's profile
    async fn configure(&self, credentials: &VpnCredentials) -> Result<(), ClientError>;

    /// Run one connect attempt, answering prompts per `policy`
    async fn connect(
        &self,
        credentials: &VpnCredentials,
        policy: &CertificatePolicy,
    ) -> Result<AttemptOutcome, ClientError>;

    /// Tear down the session. Already-disconnected is success.
    async fn disconnect(&self) -> Result<(), ClientError>;

    async fn status(&self) -> Result<VpnStatus, ClientError>;
}
