//! Connection orchestration
//!
//! Sequence for `connect`:
//!
//! 1. Check that the VM is running
//! 2. Write gateway, port and username into the client profile
//! 3. First attempt, declining the certificate; this captures the fingerprint
//! 4. Trust decision against the pinned fingerprint (may ask the user)
//! 5. On trust: disconnect, wait, reconnect accepting only that fingerprint
//! 6. Start or check the proxies
//!
//! The orchestrator owns no global state; every call works from its
//! arguments and the trust store on disk.

use crate::client::{AttemptOutcome, CertificatePolicy, ClientError, VpnClient, VpnStatus};
use crate::config::{ClientConfig, ProxyConfig};
use crate::credentials::VpnCredentials;
use crate::prompt::Prompter;
use crate::proxy::{ProxyControl, ProxyReport, ProxyState};
use crate::trust::{Fingerprint, TrustError, TrustResult, TrustStore};
use crate::vm::{Environment, EnvironmentError};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("{0}")]
    Environment(#[from] EnvironmentError),
    #[error("{0}")]
    Client(#[from] ClientError),
    #[error("{0}")]
    Trust(#[from] TrustError),
    #[error("VPN did not come up:\n{0}")]
    NotConnected(String),
}

/// Whether the user's trust decision was needed and what it was
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustDecision {
    /// Fingerprint matched the pin or the user accepted it
    Accepted,
    Rejected,
    /// The client never asked about the certificate
    NotRequired,
}

/// State of one connect call
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    pub endpoint: String,
    pub presented: Option<Fingerprint>,
    pub decision: Option<TrustDecision>,
    pub reconnected: bool,
}

impl ConnectionAttempt {
    fn new(credentials: &VpnCredentials) -> Self {
        Self {
            endpoint: credentials.endpoint(),
            presented: None,
            decision: None,
            reconnected: false,
        }
    }
}

#[derive(Debug)]
pub struct ConnectSummary {
    pub attempt: ConnectionAttempt,
    pub proxies: Vec<ProxyReport>,
}

impl fmt::Display for ConnectSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VPN connected to {}", self.attempt.endpoint)?;
        if let Some(fingerprint) = &self.attempt.presented {
            write!(f, "\nCertificate: {}", fingerprint)?;
        }
        for report in &self.proxies {
            write!(f, "\n{}", report)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConnectResult {
    Connected(ConnectSummary),
    /// The user declined; nothing was left running
    Aborted(String),
    Failed(OrchestratorError),
}

impl ConnectResult {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectResult::Connected(_))
    }
}

#[derive(Debug)]
pub struct DisconnectReport {
    pub proxies: Vec<ProxyReport>,
    /// Set when the VPN itself was not touched
    pub note: Option<String>,
}

impl fmt::Display for DisconnectReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.note {
            Some(note) => write!(f, "VPN: {}", note)?,
            None => write!(f, "VPN disconnected")?,
        }
        for report in &self.proxies {
            write!(f, "\n{}", report)?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub vm: String,
    pub vpn: VpnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub proxies: Vec<ProxyState>,
    pub trusted_fingerprint: Option<String>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VM: {}\nVPN: {}", self.vm, self.vpn)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        for state in &self.proxies {
            write!(f, "\n{}", state)?;
        }
        match &self.trusted_fingerprint {
            Some(fingerprint) => write!(f, "\nTrusted certificate: {}", fingerprint),
            None => write!(f, "\nTrusted certificate: none"),
        }
    }
}

pub struct Orchestrator<E, C, P, R> {
    environment: E,
    client: C,
    proxies: P,
    prompter: R,
    trust: TrustStore,
    reconnect_delay: Duration,
}

impl<E, C, P, R> Orchestrator<E, C, P, R>
where
    E: Environment,
    C: VpnClient,
    P: ProxyControl,
    R: Prompter,
{
    pub fn new(environment: E, client: C, proxies: P, prompter: R, trust: TrustStore) -> Self {
        Self {
            environment,
            client,
            proxies,
            prompter,
            trust,
            reconnect_delay: ClientConfig::default().reconnect_delay(),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    /// Bring the VPN up and start the proxies
    pub async fn connect(
        &self,
        credentials: &VpnCredentials,
        proxies: &ProxyConfig,
    ) -> ConnectResult {
        let mut attempt = ConnectionAttempt::new(credentials);
        match self.establish(credentials, &mut attempt).await {
            Ok(true) => {
                let reports = self.proxies.start(proxies).await;
                info!("VPN connected to {}", attempt.endpoint);
                ConnectResult::Connected(ConnectSummary {
                    attempt,
                    proxies: reports,
                })
            }
            Ok(false) => ConnectResult::Aborted(format!(
                "certificate for {} was not trusted",
                attempt.endpoint
            )),
            Err(e) => {
                warn!("Connect to {} failed: {}", attempt.endpoint, e);
                // Once the client has run, a session may be half open
                if !matches!(e, OrchestratorError::Environment(_)) {
                    self.teardown().await;
                }
                ConnectResult::Failed(e)
            }
        }
    }

    /// `Ok(false)` means the user rejected the certificate
    async fn establish(
        &self,
        credentials: &VpnCredentials,
        attempt: &mut ConnectionAttempt,
    ) -> Result<bool, OrchestratorError> {
        info!(
            "Connecting to {} as {} via VM '{}'",
            attempt.endpoint,
            credentials.username,
            self.environment.name()
        );
        self.environment.ensure_ready().await?;
        self.client.configure(credentials).await?;

        let first = self
            .client
            .connect(credentials, &CertificatePolicy::Decline)
            .await?;

        let Some(presented) = first.fingerprint.clone() else {
            attempt.decision = Some(TrustDecision::NotRequired);
            return self.confirm_up(&first).await.map(|()| true);
        };
        attempt.presented = Some(presented.clone());

        match self
            .trust
            .verify(&presented, &credentials.gateway, &self.prompter)?
        {
            TrustResult::RejectedByUser => {
                attempt.decision = Some(TrustDecision::Rejected);
                self.teardown().await;
                return Ok(false);
            }
            TrustResult::Trusted => attempt.decision = Some(TrustDecision::Accepted),
        }

        self.teardown().await;
        debug!("Waiting {:?} before reconnecting", self.reconnect_delay);
        tokio::time::sleep(self.reconnect_delay).await;

        info!("Reconnecting with pinned certificate {}", presented);
        attempt.reconnected = true;
        let second = self
            .client
            .connect(credentials, &CertificatePolicy::AcceptPinned(presented))
            .await?;
        self.confirm_up(&second).await.map(|()| true)
    }

    /// Trust the client's own marker first, then ask it
    async fn confirm_up(&self, outcome: &AttemptOutcome) -> Result<(), OrchestratorError> {
        if outcome.connected {
            return Ok(());
        }
        match self.client.status().await {
            Ok(VpnStatus::Connected) => Ok(()),
            Ok(_) => Err(OrchestratorError::NotConnected(outcome.diagnostics())),
            Err(e) => {
                debug!("Status check failed: {}", e);
                Err(OrchestratorError::NotConnected(outcome.diagnostics()))
            }
        }
    }

    /// Disconnect that never fails; used between attempts
    async fn teardown(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Ignoring disconnect failure: {}", e);
        }
    }

    /// Stop auto-stop proxies and disconnect. Safe when nothing is connected.
    pub async fn disconnect(
        &self,
        proxies: &ProxyConfig,
    ) -> Result<DisconnectReport, OrchestratorError> {
        let reports = self.proxies.stop(proxies).await;

        let note = match self.environment.ensure_ready().await {
            Ok(()) => {
                self.client.disconnect().await?;
                info!("VPN disconnected");
                None
            }
            Err(e) => {
                info!("Skipping VPN disconnect: {}", e);
                Some(format!("nothing to disconnect ({})", e))
            }
        };

        Ok(DisconnectReport {
            proxies: reports,
            note,
        })
    }

    /// Read-only snapshot; problems show up as `Unavailable` with a detail
    pub async fn status(&self, proxies: &ProxyConfig) -> StatusReport {
        let (vpn, detail) = match self.environment.ensure_ready().await {
            Err(e) => (VpnStatus::Unavailable, Some(e.to_string())),
            Ok(()) => match self.client.status().await {
                Ok(status) => (status, None),
                Err(e) => (VpnStatus::Unavailable, Some(e.to_string())),
            },
        };

        let trusted_fingerprint = self.trust.stored().unwrap_or_else(|e| {
            warn!("{}", e);
            None
        });

        StatusReport {
            vm: self.environment.name().to_string(),
            vpn,
            detail,
            proxies: self.proxies.status(proxies).await,
            trusted_fingerprint,
        }
    }
}
