//! Drives one interactive client command
//!
//! The command is spawned with piped stdio. Both output streams go through
//! an [`EventParser`]; prompts are answered from [`Responses`] until the
//! client exits, reports the tunnel up, or the time limit runs out.
//!
//! A client that reports the tunnel up and stays in the foreground is left
//! running. Its console keeps being drained in the background so later
//! writes never hit a closed pipe.

use super::events::{ClientEvent, EventParser, PromptMatcher};
use super::{AttemptOutcome, CertificatePolicy, ClientError};
use crate::credentials::Password;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Password prompts answered before giving up
pub const MAX_PASSWORD_PROMPTS: usize = 3;

/// Answers for the prompts a session may raise
pub struct Responses<'a> {
    pub password: Option<&'a Password>,
    pub certificate: CertificatePolicy,
    /// `(label fragment, answer)`; the first fragment found in a field label
    /// wins. Non-empty enables field prompts.
    pub fields: Vec<(&'static str, String)>,
}

impl<'a> Responses<'a> {
    pub fn login(password: &'a Password, certificate: CertificatePolicy) -> Self {
        Self {
            password: Some(password),
            certificate,
            fields: Vec::new(),
        }
    }

    pub fn form(fields: Vec<(&'static str, String)>) -> Self {
        Self {
            password: None,
            certificate: CertificatePolicy::Decline,
            fields,
        }
    }

    fn field(&self, label: &str) -> &str {
        let label = label.to_ascii_lowercase();
        self.fields
            .iter()
            .find(|(key, _)| label.contains(key))
            .map(|(_, answer)| answer.as_str())
            .unwrap_or("")
    }
}

/// Run `command` to completion (or until it reports the tunnel up)
pub async fn drive(
    mut command: Command,
    responses: &Responses<'_>,
    matcher: &dyn PromptMatcher,
    limit: Duration,
) -> Result<AttemptOutcome, ClientError> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("Running {:?}", command.as_std());
    let mut child = command
        .spawn()
        .map_err(|source| ClientError::Spawn { program, source })?;

    let result = match timeout(limit, interact(&mut child, responses, matcher)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("VPN client timed out after {}s", limit.as_secs());
            Err(ClientError::Timeout(limit))
        }
    };

    match result {
        Ok((outcome, Some(console))) => {
            tokio::spawn(keep_attached(child, console));
            Ok(outcome)
        }
        Ok((outcome, None)) => Ok(outcome),
        Err(e) => {
            if let Err(kill) = child.kill().await {
                debug!("Could not kill VPN client: {}", kill);
            }
            Err(e)
        }
    }
}

/// Console of a client still running after the session returned
struct Console {
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

/// Drain a detached client's output until it exits, then reap it
async fn keep_attached(mut child: Child, console: Console) {
    let Console {
        stdin: _stdin,
        mut stdout,
        mut stderr,
    } = console;
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => debug!("client: {}", String::from_utf8_lossy(&out_buf[..n]).trim_end()),
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => debug!("client: {}", String::from_utf8_lossy(&err_buf[..n]).trim_end()),
            },
        }
    }

    match child.wait().await {
        Ok(status) => debug!("Detached VPN client exited ({})", status),
        Err(e) => debug!("Could not reap VPN client: {}", e),
    }
}

async fn interact(
    child: &mut Child,
    responses: &Responses<'_>,
    matcher: &dyn PromptMatcher,
) -> Result<(AttemptOutcome, Option<Console>), ClientError> {
    let missing = || ClientError::Io(io::Error::other("client stdio was not captured"));
    let mut stdout = child.stdout.take().ok_or_else(missing)?;
    let mut stderr = child.stderr.take().ok_or_else(missing)?;

    let fields = !responses.fields.is_empty();
    let mut out_parser = EventParser::new(matcher).with_fields(fields);
    let mut err_parser = EventParser::new(matcher).with_fields(fields);
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let (mut out_open, mut err_open) = (true, true);

    let mut responder = Responder {
        responses,
        stdin: child.stdin.take(),
        outcome: AttemptOutcome::default(),
        password_prompts: 0,
    };

    while out_open || err_open {
        let events = tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => match read? {
                0 => {
                    out_open = false;
                    out_parser.finish()
                }
                n => out_parser.feed(&out_buf[..n]),
            },
            read = stderr.read(&mut err_buf), if err_open => match read? {
                0 => {
                    err_open = false;
                    err_parser.finish()
                }
                n => err_parser.feed(&err_buf[..n]),
            },
        };

        for event in events {
            responder.handle(event).await?;
        }

        if responder.outcome.connected {
            break;
        }
    }

    let (mut outcome, stdin) = responder.finish();
    let (status, console) = if out_open || err_open {
        // Reported connected while still attached; the client keeps the tunnel
        let console = Console {
            stdin,
            stdout,
            stderr,
        };
        (child.try_wait()?, Some(console))
    } else {
        (Some(child.wait().await?), None)
    };
    outcome.exit_code = status.and_then(|s| s.code());
    debug!(
        "Client session ended (connected: {}, exit code: {:?})",
        outcome.connected, outcome.exit_code
    );
    Ok((outcome, console))
}

struct Responder<'r, 'a> {
    responses: &'r Responses<'a>,
    stdin: Option<ChildStdin>,
    outcome: AttemptOutcome,
    password_prompts: usize,
}

impl Responder<'_, '_> {
    async fn handle(&mut self, event: ClientEvent) -> Result<(), ClientError> {
        match event {
            ClientEvent::PasswordRequested => {
                self.password_prompts += 1;
                if self.password_prompts > MAX_PASSWORD_PROMPTS {
                    return Err(ClientError::AuthenticationFailed);
                }
                match self.responses.password {
                    Some(password) => self.send(password.expose()).await?,
                    None => {
                        warn!("VPN client asked for a password outside of login");
                        self.send("").await?
                    }
                }
            }
            ClientEvent::FingerprintAnnounced(fingerprint) => {
                info!("Gateway presented certificate {}", fingerprint);
                self.outcome.fingerprint = Some(fingerprint);
            }
            ClientEvent::ConfirmationRequested => {
                let accept = match &self.responses.certificate {
                    CertificatePolicy::Decline => false,
                    CertificatePolicy::AcceptPinned(pinned) => {
                        let matches = self.outcome.fingerprint.as_ref() == Some(pinned);
                        if !matches {
                            warn!(
                                "Certificate changed between attempts (expected {}), declining",
                                pinned
                            );
                        }
                        matches
                    }
                };
                self.outcome.certificate_accepted = accept;
                self.send(if accept { "y" } else { "n" }).await?;
            }
            ClientEvent::FieldRequested(label) => {
                let answer = self.responses.field(&label).to_string();
                debug!("Answering '{}' with '{}'", label, answer);
                self.send(&answer).await?;
            }
            ClientEvent::Connected => {
                info!("VPN client reports the tunnel is up");
                self.outcome.connected = true;
            }
            ClientEvent::Output(line) => {
                debug!("client: {}", line);
                self.outcome.output.push(line);
            }
            ClientEvent::SessionEnded => {}
        }
        Ok(())
    }

    /// Write one answer line. A client that already exited is not an error.
    async fn send(&mut self, answer: &str) -> Result<(), ClientError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        let written = async {
            stdin.write_all(answer.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;

        match written {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("VPN client closed its input");
                self.stdin = None;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn finish(self) -> (AttemptOutcome, Option<ChildStdin>) {
        (self.outcome, self.stdin)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::client::events::ForticlientMatcher;
    use crate::trust::Fingerprint;

    const FP: &str = "AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99:AA:BB:CC:DD";
    const LIMIT: Duration = Duration::from_secs(10);

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    fn fingerprint() -> Fingerprint {
        FP.parse().unwrap()
    }

    /// Asks for a password, shows the certificate and connects on "y"
    fn gateway_script() -> String {
        format!(
            r#"printf 'Password:'
read pw
[ "$pw" = "s3cret" ] || {{ echo "Authentication failed"; exit 1; }}
echo "The server certificate SHA1 fingerprint: {FP}"
printf 'Confirm (y/n) [default=n]:'
read answer
if [ "$answer" = "y" ]; then echo "VPN connected"; exit 0; fi
echo "Connection cancelled"
exit 1"#
        )
    }

    #[tokio::test]
    async fn test_decline_captures_fingerprint() {
        let password = Password::new("s3cret".to_string());
        let responses = Responses::login(&password, CertificatePolicy::Decline);

        let outcome = drive(sh(&gateway_script()), &responses, &ForticlientMatcher, LIMIT)
            .await
            .unwrap();

        assert_eq!(outcome.fingerprint, Some(fingerprint()));
        assert!(!outcome.connected);
        assert!(!outcome.certificate_accepted);
        assert_eq!(outcome.exit_code, Some(1));
        assert!(outcome.diagnostics().contains("Connection cancelled"));
    }

    #[tokio::test]
    async fn test_accept_pinned_connects() {
        let password = Password::new("s3cret".to_string());
        let responses =
            Responses::login(&password, CertificatePolicy::AcceptPinned(fingerprint()));

        let outcome = drive(sh(&gateway_script()), &responses, &ForticlientMatcher, LIMIT)
            .await
            .unwrap();

        assert!(outcome.connected);
        assert!(outcome.certificate_accepted);
    }

    #[tokio::test]
    async fn test_pinned_mismatch_declines() {
        let other: Fingerprint = "11:22:33:44:55:66:77:88:99:00:AA:BB:CC:DD:EE:FF:00:11:22:33"
            .parse()
            .unwrap();
        let password = Password::new("s3cret".to_string());
        let responses = Responses::login(&password, CertificatePolicy::AcceptPinned(other));

        let outcome = drive(sh(&gateway_script()), &responses, &ForticlientMatcher, LIMIT)
            .await
            .unwrap();

        assert!(!outcome.connected);
        assert!(!outcome.certificate_accepted);
        assert_eq!(outcome.fingerprint, Some(fingerprint()));
    }

    #[tokio::test]
    async fn test_repeated_password_prompts_fail() {
        let script = "while true; do printf 'Password:'; read pw || exit 1; done";
        let password = Password::new("wrong".to_string());
        let responses = Responses::login(&password, CertificatePolicy::Decline);

        let result = drive(sh(script), &responses, &ForticlientMatcher, LIMIT).await;
        assert!(matches!(result, Err(ClientError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_timeout_kills_client() {
        let password = Password::new("pw".to_string());
        let responses = Responses::login(&password, CertificatePolicy::Decline);

        let result = drive(
            sh("sleep 30"),
            &responses,
            &ForticlientMatcher,
            Duration::from_millis(200),
        )
        .await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_stderr_is_parsed_too() {
        let script = "echo 'Could not resolve vpn.example.com' >&2; exit 2";
        let password = Password::new("pw".to_string());
        let responses = Responses::login(&password, CertificatePolicy::Decline);

        let outcome = drive(sh(script), &responses, &ForticlientMatcher, LIMIT)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(2));
        assert_eq!(outcome.output, vec!["Could not resolve vpn.example.com"]);
    }

    #[tokio::test]
    async fn test_form_answers_fields() {
        let script = r#"printf 'Type [ssl/ipsec]:'; read t
printf 'Remote Gateway:'; read gw
printf 'Port [443]:'; read port
printf 'Notes:'; read notes
echo "saved $t $gw $port [$notes]""#;
        let responses = Responses::form(vec![
            ("remote gateway", "vpn.example.com".to_string()),
            ("port", "8443".to_string()),
            ("type", "ssl".to_string()),
        ]);

        let outcome = drive(sh(script), &responses, &ForticlientMatcher, LIMIT)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.output, vec!["saved ssl vpn.example.com 8443 []"]);
    }

    #[tokio::test]
    async fn test_client_staying_attached_keeps_running() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("still-alive");
        let script = format!(
            "echo 'VPN connected'; sleep 1; echo 'STATUS::keepalive'; touch '{}'",
            marker.display()
        );
        let password = Password::new("pw".to_string());
        let responses = Responses::login(&password, CertificatePolicy::Decline);

        let outcome = drive(sh(&script), &responses, &ForticlientMatcher, LIMIT)
            .await
            .unwrap();
        assert!(outcome.connected);
        assert_eq!(outcome.exit_code, None);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let password = Password::new("pw".to_string());
        let responses = Responses::login(&password, CertificatePolicy::Decline);
        let command = Command::new("/nonexistent/forticlient");

        let result = drive(command, &responses, &ForticlientMatcher, LIMIT).await;
        match result {
            Err(ClientError::Spawn { program, .. }) => {
                assert_eq!(program, "/nonexistent/forticlient")
            }
            other => panic!("expected spawn error, got {:?}", other),
        }
    }
}
