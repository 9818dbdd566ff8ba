//! FortiClient Linux CLI adapter
//!
//! Subcommands used:
//!
//! - `forticlient vpn edit <profile>`: interactive profile form
//! - `forticlient vpn connect <profile> -u <user> -p`: interactive login
//! - `forticlient vpn disconnect`
//! - `forticlient vpn status`

use super::events::{ForticlientMatcher, PromptMatcher};
use super::session::{Responses, drive};
use super::{AttemptOutcome, CertificatePolicy, ClientError, VpnClient, VpnStatus};
use crate::config::ClientConfig;
use crate::credentials::VpnCredentials;
use crate::vm::{Launcher, program_name, run_bounded};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Phrases meaning "there was nothing to disconnect"
const NOT_CONNECTED: &[&str] = &["not connected", "no active", "already disconnected"];

pub struct ForticlientCli {
    launcher: Launcher,
    binary: String,
    profile: String,
    matcher: Box<dyn PromptMatcher>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl ForticlientCli {
    pub fn new(launcher: Launcher, config: &ClientConfig) -> Self {
        Self {
            launcher,
            binary: config.binary.clone(),
            profile: config.profile.clone(),
            matcher: Box::new(ForticlientMatcher),
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
        }
    }

    /// Swap the prompt rules, e.g. for a client release with other wording
    pub fn with_matcher(mut self, matcher: impl PromptMatcher + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    fn command(&self, args: &[&str]) -> tokio::process::Command {
        self.launcher.command(&self.binary, args)
    }

    /// Run a non-interactive subcommand, returning (success, combined output)
    async fn run(&self, args: &[&str]) -> Result<(bool, String), ClientError> {
        let command = self.command(args);
        let program = program_name(&command);
        let output = run_bounded(command, self.command_timeout)
            .await
            .map_err(|source| ClientError::Spawn { program, source })?
            .ok_or(ClientError::Timeout(self.command_timeout))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.success(), text.trim().to_string()))
    }
}

/// Answers for the `vpn edit` form
fn profile_fields(credentials: &VpnCredentials) -> Vec<(&'static str, String)> {
    vec![
        ("certificate type", "4".to_string()),
        ("authentication", "1".to_string()),
        ("remote gateway", credentials.gateway.clone()),
        ("port", credentials.port.to_string()),
        ("username", credentials.username.clone()),
        ("type", "ssl".to_string()),
    ]
}

fn parse_status(text: &str) -> VpnStatus {
    let lower = text.to_ascii_lowercase();
    if ["disconnected", "not running", "not connected"]
        .iter()
        .any(|m| lower.contains(m))
    {
        VpnStatus::Disconnected
    } else if lower.contains("connected") {
        VpnStatus::Connected
    } else {
        VpnStatus::Disconnected
    }
}

fn nothing_to_disconnect(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    NOT_CONNECTED.iter().any(|m| lower.contains(m))
}

#[async_trait]
impl VpnClient for ForticlientCli {
    async fn configure(&self, credentials: &VpnCredentials) -> Result<(), ClientError> {
        info!("Updating VPN profile '{}' for {}", self.profile, credentials.endpoint());
        let responses = Responses::form(profile_fields(credentials));
        let outcome = drive(
            self.command(&["vpn", "edit", &self.profile]),
            &responses,
            self.matcher.as_ref(),
            self.command_timeout,
        )
        .await?;

        match outcome.exit_code {
            Some(0) | None => Ok(()),
            Some(_) => Err(ClientError::Failed(outcome.diagnostics())),
        }
    }

    async fn connect(
        &self,
        credentials: &VpnCredentials,
        policy: &CertificatePolicy,
    ) -> Result<AttemptOutcome, ClientError> {
        info!("Connecting profile '{}' as {}", self.profile, credentials.username);
        let responses = Responses::login(&credentials.password, policy.clone());
        drive(
            self.command(&[
                "vpn",
                "connect",
                &self.profile,
                "-u",
                &credentials.username,
                "-p",
            ]),
            &responses,
            self.matcher.as_ref(),
            self.connect_timeout,
        )
        .await
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        let (success, text) = self.run(&["vpn", "disconnect"]).await?;
        if success || nothing_to_disconnect(&text) {
            debug!("Disconnect: {}", text);
            Ok(())
        } else {
            Err(ClientError::Failed(text))
        }
    }

    async fn status(&self) -> Result<VpnStatus, ClientError> {
        let (_, text) = self.run(&["vpn", "status"]).await?;
        debug!("Client status: {}", text);
        Ok(parse_status(&text))
    }
}
