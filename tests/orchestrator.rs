use async_trait::async_trait;
use lima_vpn::client::{AttemptOutcome, CertificatePolicy, ClientError, VpnClient, VpnStatus};
use lima_vpn::config::{self, Config, ConfigError, ProxyConfig};
use lima_vpn::credentials::{Password, VpnCredentials};
use lima_vpn::orchestrator::{
    ConnectResult, ConnectSummary, Orchestrator, OrchestratorError, TrustDecision,
};
use lima_vpn::prompt::Prompter;
use lima_vpn::proxy::{
    ProcessInfo, ProcessSignature, ProcessTable, ProxyError, ProxyKind, ProxyManager,
    ProxyOutcome, TunnelSpawner,
};
use lima_vpn::trust::{Fingerprint, TrustStore};
use lima_vpn::vm::{Environment, EnvironmentError, SshDestination};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const FP: &str = "AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99:AA:BB:CC:DD";
const OTHER_FP: &str = "11:22:33:44:55:66:77:88:99:00:AA:BB:CC:DD:EE:FF:11:22:33:44";

// --- fakes -----------------------------------------------------------------

struct FakeVm {
    running: bool,
}

#[async_trait]
impl Environment for FakeVm {
    fn name(&self) -> &str {
        "fortivpn"
    }

    async fn ensure_ready(&self) -> Result<(), EnvironmentError> {
        if self.running {
            Ok(())
        } else {
            Err(EnvironmentError::NotRunning {
                name: "fortivpn".to_string(),
                status: "Stopped".to_string(),
            })
        }
    }
}

/// Gateway that presents `fingerprint` and only connects once it is pinned.
/// Clones share state, so a test can keep one while the orchestrator owns another.
#[derive(Clone, Default)]
struct FakeClient {
    fingerprint: Option<Fingerprint>,
    /// Never comes up, whatever the certificate answer
    refuses: bool,
    connected: Arc<Mutex<bool>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeClient {
    fn presenting(fingerprint: &str) -> Self {
        Self {
            fingerprint: Some(fingerprint.parse().unwrap()),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(call)).count()
    }
}

#[async_trait]
impl VpnClient for FakeClient {
    async fn configure(&self, credentials: &VpnCredentials) -> Result<(), ClientError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("configure {}", credentials.endpoint()));
        Ok(())
    }

    async fn connect(
        &self,
        _credentials: &VpnCredentials,
        policy: &CertificatePolicy,
    ) -> Result<AttemptOutcome, ClientError> {
        self.calls.lock().unwrap().push(format!("connect {:?}", policy));
        let accepted = match (&self.fingerprint, policy) {
            _ if self.refuses => false,
            (None, _) => true,
            (Some(presented), CertificatePolicy::AcceptPinned(pinned)) => presented == pinned,
            (Some(_), CertificatePolicy::Decline) => false,
        };
        *self.connected.lock().unwrap() = accepted;
        Ok(AttemptOutcome {
            fingerprint: self.fingerprint.clone(),
            connected: accepted,
            certificate_accepted: accepted && self.fingerprint.is_some(),
            exit_code: if accepted { None } else { Some(1) },
            output: if accepted {
                Vec::new()
            } else {
                vec!["Connection cancelled".to_string()]
            },
        })
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.calls.lock().unwrap().push("disconnect".to_string());
        *self.connected.lock().unwrap() = false;
        Ok(())
    }

    async fn status(&self) -> Result<VpnStatus, ClientError> {
        Ok(if *self.connected.lock().unwrap() {
            VpnStatus::Connected
        } else {
            VpnStatus::Disconnected
        })
    }
}

/// In-memory process table shared with the spawner
#[derive(Default)]
struct FakeTable {
    processes: Mutex<Vec<ProcessInfo>>,
}

impl ProcessTable for FakeTable {
    fn list(&self) -> Result<Vec<ProcessInfo>, ProxyError> {
        Ok(self.processes.lock().unwrap().clone())
    }

    fn terminate(&self, pid: u32) -> Result<bool, ProxyError> {
        let mut processes = self.processes.lock().unwrap();
        let before = processes.len();
        processes.retain(|p| p.pid != pid);
        Ok(processes.len() != before)
    }
}

struct FakeSpawner {
    table: Arc<FakeTable>,
    next_pid: AtomicU32,
    spawned: AtomicUsize,
    fails: bool,
}

#[async_trait]
impl TunnelSpawner for FakeSpawner {
    async fn spawn(&self, destination: &SshDestination, port: u16) -> Result<u32, ProxyError> {
        if self.fails {
            return Err(ProxyError::ExitedEarly(format!(
                "ssh exit status: 255 (is port {} already in use, or the VM unreachable?)",
                port
            )));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.table.processes.lock().unwrap().push(ProcessInfo {
            pid,
            command_line: format!("ssh -N -D {} {}", port, destination.host),
        });
        Ok(pid)
    }
}

/// Lets the test keep a handle on the table the manager owns
struct SharedTable(Arc<FakeTable>);

impl ProcessTable for SharedTable {
    fn list(&self) -> Result<Vec<ProcessInfo>, ProxyError> {
        self.0.list()
    }

    fn terminate(&self, pid: u32) -> Result<bool, ProxyError> {
        self.0.terminate(pid)
    }
}

#[derive(Default)]
struct ScriptedPrompter {
    passwords: RefCell<VecDeque<String>>,
    confirmations: RefCell<VecDeque<bool>>,
    questions: RefCell<Vec<String>>,
    notices: RefCell<Vec<String>>,
}

impl ScriptedPrompter {
    fn confirming(answers: &[bool]) -> Self {
        let prompter = Self::default();
        prompter.confirmations.borrow_mut().extend(answers);
        prompter
    }
}

impl Prompter for &ScriptedPrompter {
    fn password(&self, message: &str) -> io::Result<String> {
        self.questions.borrow_mut().push(message.to_string());
        self.passwords
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted password"))
    }

    fn confirm(&self, message: &str) -> io::Result<bool> {
        self.questions.borrow_mut().push(message.to_string());
        self.confirmations
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted answer"))
    }

    fn notice(&self, message: &str) {
        self.notices.borrow_mut().push(message.to_string());
    }
}

// --- harness ---------------------------------------------------------------

struct Harness {
    dir: TempDir,
    table: Arc<FakeTable>,
    spawn_fails: bool,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            table: Arc::new(FakeTable::default()),
            spawn_fails: false,
        }
    }

    fn trust_store(&self) -> TrustStore {
        TrustStore::new(self.dir.path().join("trusted_cert"))
    }

    fn proxies(&self) -> (ProxyManager, Arc<FakeSpawner>) {
        let spawner = Arc::new(FakeSpawner {
            table: Arc::clone(&self.table),
            next_pid: AtomicU32::new(4000),
            spawned: AtomicUsize::new(0),
            fails: self.spawn_fails,
        });
        let manager = ProxyManager::with_parts(
            SshDestination {
                config_file: None,
                host: "lima-fortivpn".to_string(),
            },
            self.dir.path().join("state"),
            Box::new(SharedTable(Arc::clone(&self.table))),
            Box::new(SharedSpawner(Arc::clone(&spawner))),
        );
        (manager, spawner)
    }

    fn orchestrator<'p>(
        &self,
        client: &FakeClient,
        prompter: &'p ScriptedPrompter,
        running: bool,
    ) -> (
        Orchestrator<FakeVm, FakeClient, ProxyManager, &'p ScriptedPrompter>,
        Arc<FakeSpawner>,
    ) {
        let (proxies, spawner) = self.proxies();
        let orchestrator = Orchestrator::new(
            FakeVm { running },
            client.clone(),
            proxies,
            prompter,
            self.trust_store(),
        )
        .with_reconnect_delay(Duration::ZERO);
        (orchestrator, spawner)
    }

    fn socks_processes(&self) -> usize {
        let signature = ProcessSignature::new(["ssh", "-D 1080", "lima-fortivpn"]);
        self.table.find(&signature).unwrap().len()
    }
}

struct SharedSpawner(Arc<FakeSpawner>);

#[async_trait]
impl TunnelSpawner for SharedSpawner {
    async fn spawn(&self, destination: &SshDestination, port: u16) -> Result<u32, ProxyError> {
        self.0.spawn(destination, port).await
    }
}

fn connected(result: ConnectResult) -> ConnectSummary {
    match result {
        ConnectResult::Connected(summary) => summary,
        other => panic!("expected a connection, got {:?}", other),
    }
}

fn alice() -> VpnCredentials {
    VpnCredentials {
        gateway: "vpn.example.com".to_string(),
        port: 443,
        username: "alice".to_string(),
        password: Password::new("s3cret".to_string()),
    }
}

// --- connect ---------------------------------------------------------------

#[tokio::test]
async fn test_first_connect_end_to_end() {
    let harness = Harness::new();
    let client = FakeClient::presenting(FP);
    let prompter = ScriptedPrompter::confirming(&[true]);
    let (orchestrator, _) = harness.orchestrator(&client, &prompter, true);

    let result = orchestrator.connect(&alice(), &ProxyConfig::default()).await;

    let summary = connected(result);
    assert_eq!(summary.attempt.decision, Some(TrustDecision::Accepted));
    assert!(summary.attempt.reconnected);
    let report = summary.to_string();
    assert!(report.contains("SOCKS5 proxy: localhost:1080"), "{}", report);
    assert!(report.contains("vpn.example.com:443"));

    assert_eq!(
        harness.trust_store().stored().unwrap().as_deref(),
        Some(FP)
    );
    assert_eq!(harness.socks_processes(), 1);
    assert!(prompter.notices.borrow()[0].contains(FP));
}

#[tokio::test]
async fn test_accepted_certificate_reconnects_exactly_once() {
    let harness = Harness::new();
    let client = FakeClient::presenting(FP);
    let prompter = ScriptedPrompter::confirming(&[true]);
    let (orchestrator, _) = harness.orchestrator(&client, &prompter, true);

    assert!(orchestrator.connect(&alice(), &ProxyConfig::default()).await.is_connected());

    let calls = client.calls();
    let pinned = format!("connect AcceptPinned({:?})", FP.parse::<Fingerprint>().unwrap());
    assert_eq!(
        calls,
        vec![
            "configure vpn.example.com:443".to_string(),
            "connect Decline".to_string(),
            "disconnect".to_string(),
            pinned,
        ]
    );
    assert_eq!(client.status().await.unwrap(), VpnStatus::Connected);
}

#[tokio::test]
async fn test_rejected_certificate_aborts() {
    let harness = Harness::new();
    let client = FakeClient::presenting(FP);
    let prompter = ScriptedPrompter::confirming(&[false]);
    let (orchestrator, spawner) = harness.orchestrator(&client, &prompter, true);

    let result = orchestrator.connect(&alice(), &ProxyConfig::default()).await;

    assert!(matches!(result, ConnectResult::Aborted(_)), "{:?}", result);
    assert_eq!(client.status().await.unwrap(), VpnStatus::Disconnected);
    assert_eq!(client.count("connect"), 1);
    assert!(harness.trust_store().stored().unwrap().is_none());
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_pinned_certificate_needs_no_prompt() {
    let harness = Harness::new();
    fs::write(harness.dir.path().join("trusted_cert"), format!("{}\n", FP)).unwrap();
    let client = FakeClient::presenting(FP);
    // No scripted answers: a prompt would fail the connect
    let prompter = ScriptedPrompter::default();
    let (orchestrator, _) = harness.orchestrator(&client, &prompter, true);

    let result = orchestrator.connect(&alice(), &ProxyConfig::default()).await;

    assert!(result.is_connected(), "{:?}", result);
    assert!(prompter.questions.borrow().is_empty());
}

#[tokio::test]
async fn test_changed_certificate_rejected_keeps_pin() {
    let harness = Harness::new();
    fs::write(harness.dir.path().join("trusted_cert"), format!("{}\n", OTHER_FP)).unwrap();
    let client = FakeClient::presenting(FP);
    let prompter = ScriptedPrompter::confirming(&[false]);
    let (orchestrator, _) = harness.orchestrator(&client, &prompter, true);

    let result = orchestrator.connect(&alice(), &ProxyConfig::default()).await;

    assert!(matches!(result, ConnectResult::Aborted(_)));
    assert_eq!(
        harness.trust_store().stored().unwrap().as_deref(),
        Some(OTHER_FP)
    );
    let notices = prompter.notices.borrow();
    assert!(notices.iter().any(|n| n.contains("WARNING") && n.contains(OTHER_FP)));
}

#[tokio::test]
async fn test_client_trusting_certificate_itself() {
    let harness = Harness::new();
    let client = FakeClient::default();
    let prompter = ScriptedPrompter::default();
    let (orchestrator, _) = harness.orchestrator(&client, &prompter, true);

    let result = orchestrator.connect(&alice(), &ProxyConfig::default()).await;

    let summary = connected(result);
    assert_eq!(summary.attempt.decision, Some(TrustDecision::NotRequired));
    assert!(!summary.attempt.reconnected);
    assert_eq!(client.count("connect"), 1);
    assert_eq!(client.count("disconnect"), 0);
}

#[tokio::test]
async fn test_vm_not_running_fails_before_client() {
    let harness = Harness::new();
    let client = FakeClient::presenting(FP);
    let prompter = ScriptedPrompter::default();
    let (orchestrator, _) = harness.orchestrator(&client, &prompter, false);

    let result = orchestrator.connect(&alice(), &ProxyConfig::default()).await;

    match result {
        ConnectResult::Failed(OrchestratorError::Environment(e)) => {
            assert!(e.to_string().contains("limactl start fortivpn"))
        }
        other => panic!("expected environment failure, got {:?}", other),
    }
    assert!(client.calls().is_empty());
}

#[tokio::test]
async fn test_connect_twice_keeps_one_socks_tunnel() {
    let harness = Harness::new();
    fs::write(harness.dir.path().join("trusted_cert"), format!("{}\n", FP)).unwrap();
    let client = FakeClient::presenting(FP);
    let prompter = ScriptedPrompter::default();
    let (orchestrator, spawner) = harness.orchestrator(&client, &prompter, true);

    assert!(orchestrator.connect(&alice(), &ProxyConfig::default()).await.is_connected());
    let second = orchestrator.connect(&alice(), &ProxyConfig::default()).await;

    let summary = connected(second);
    assert!(summary.to_string().contains("already running"));
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);
    assert_eq!(harness.socks_processes(), 1);
}

#[tokio::test]
async fn test_unanswered_trust_prompt_leaves_no_session() {
    let harness = Harness::new();
    let client = FakeClient::presenting(FP);
    // No scripted answer: the trust prompt hits end of input
    let prompter = ScriptedPrompter::default();
    let (orchestrator, spawner) = harness.orchestrator(&client, &prompter, true);

    let result = orchestrator.connect(&alice(), &ProxyConfig::default()).await;

    assert!(
        matches!(result, ConnectResult::Failed(OrchestratorError::Trust(_))),
        "{:?}",
        result
    );
    assert_eq!(client.count("disconnect"), 1);
    assert_eq!(client.status().await.unwrap(), VpnStatus::Disconnected);
    assert!(harness.trust_store().stored().unwrap().is_none());
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_pinned_reconnect_is_torn_down() {
    let harness = Harness::new();
    fs::write(harness.dir.path().join("trusted_cert"), format!("{}\n", FP)).unwrap();
    let client = FakeClient {
        refuses: true,
        ..FakeClient::presenting(FP)
    };
    let prompter = ScriptedPrompter::default();
    let (orchestrator, _) = harness.orchestrator(&client, &prompter, true);

    let result = orchestrator.connect(&alice(), &ProxyConfig::default()).await;

    match result {
        ConnectResult::Failed(OrchestratorError::NotConnected(detail)) => {
            assert!(detail.contains("Connection cancelled"))
        }
        other => panic!("expected a failed reconnect, got {:?}", other),
    }
    assert_eq!(client.count("connect"), 2);
    assert_eq!(client.calls().last().map(String::as_str), Some("disconnect"));
    assert_eq!(harness.socks_processes(), 0);
}

#[tokio::test]
async fn test_proxy_failure_still_reports_connected() {
    let mut harness = Harness::new();
    harness.spawn_fails = true;
    fs::write(harness.dir.path().join("trusted_cert"), format!("{}\n", FP)).unwrap();
    let client = FakeClient::presenting(FP);
    let prompter = ScriptedPrompter::default();
    let (orchestrator, _) = harness.orchestrator(&client, &prompter, true);

    let result = orchestrator.connect(&alice(), &ProxyConfig::default()).await;

    let summary = connected(result);
    let socks = &summary.proxies[0];
    assert_eq!(socks.kind, ProxyKind::Socks);
    assert!(!socks.is_usable());
    assert!(matches!(socks.outcome, ProxyOutcome::Failed(_)));
    let report = summary.to_string();
    assert!(report.starts_with("VPN connected to vpn.example.com:443"));
    assert!(report.contains("SOCKS5 proxy: failed"), "{}", report);
    assert_eq!(client.status().await.unwrap(), VpnStatus::Connected);
    assert_eq!(harness.socks_processes(), 0);
}

// --- disconnect and status ---------------------------------------------------

#[tokio::test]
async fn test_disconnect_when_nothing_is_connected() {
    let harness = Harness::new();
    let client = FakeClient::default();
    let prompter = ScriptedPrompter::default();
    let (orchestrator, _) = harness.orchestrator(&client, &prompter, true);

    let report = orchestrator.disconnect(&ProxyConfig::default()).await.unwrap();

    assert!(report.note.is_none());
    assert!(report.to_string().contains("SOCKS5 proxy: not running"));
}

#[tokio::test]
async fn test_disconnect_with_vm_stopped_still_stops_proxies() {
    let harness = Harness::new();
    harness.table.processes.lock().unwrap().push(ProcessInfo {
        pid: 31337,
        command_line: "ssh -N -D 1080 lima-fortivpn".to_string(),
    });
    let client = FakeClient::default();
    let prompter = ScriptedPrompter::default();
    let (orchestrator, _) = harness.orchestrator(&client, &prompter, false);

    let report = orchestrator.disconnect(&ProxyConfig::default()).await.unwrap();

    assert!(report.note.is_some());
    assert_eq!(harness.socks_processes(), 0);
    assert_eq!(client.count("disconnect"), 0);
}

#[tokio::test]
async fn test_connect_then_disconnect() {
    let harness = Harness::new();
    let client = FakeClient::presenting(FP);
    let prompter = ScriptedPrompter::confirming(&[true]);
    let (orchestrator, _) = harness.orchestrator(&client, &prompter, true);

    assert!(orchestrator.connect(&alice(), &ProxyConfig::default()).await.is_connected());
    orchestrator.disconnect(&ProxyConfig::default()).await.unwrap();

    assert_eq!(client.status().await.unwrap(), VpnStatus::Disconnected);
    assert_eq!(harness.socks_processes(), 0);
    // The pin survives a disconnect
    assert_eq!(harness.trust_store().stored().unwrap().as_deref(), Some(FP));
}

#[tokio::test]
async fn test_status_reports_everything() {
    let harness = Harness::new();
    let client = FakeClient::presenting(FP);
    let prompter = ScriptedPrompter::confirming(&[true]);
    let (orchestrator, _) = harness.orchestrator(&client, &prompter, true);
    orchestrator.connect(&alice(), &ProxyConfig::default()).await;

    let status = orchestrator.status(&ProxyConfig::default()).await;

    assert_eq!(status.vpn, VpnStatus::Connected);
    assert_eq!(status.trusted_fingerprint.as_deref(), Some(FP));
    assert_eq!(status.proxies.len(), 1);
    assert!(status.proxies[0].running);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["vpn"], "connected");
    assert_eq!(json["proxies"][0]["kind"], "socks");
}

#[tokio::test]
async fn test_status_with_vm_stopped_is_unavailable() {
    let harness = Harness::new();
    let client = FakeClient::default();
    let prompter = ScriptedPrompter::default();
    let (orchestrator, _) = harness.orchestrator(&client, &prompter, false);

    let status = orchestrator.status(&ProxyConfig::default()).await;

    assert_eq!(status.vpn, VpnStatus::Unavailable);
    assert!(status.detail.unwrap().contains("not running"));
    assert!(status.trusted_fingerprint.is_none());
}

// --- config resolution -------------------------------------------------------

#[test]
fn test_missing_field_stops_before_any_prompt() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lima-vpn.json");
    fs::write(&path, r#"{ "gateway": "vpn.example.com" }"#).unwrap();
    let prompter = ScriptedPrompter::default();

    let err = config::resolve(&path, &&prompter).unwrap_err();

    assert!(matches!(err, ConfigError::MissingField("username")));
    assert!(prompter.questions.borrow().is_empty());
}

#[test]
fn test_resolve_prompts_for_password() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lima-vpn.json");
    fs::write(
        &path,
        r#"{ "gateway": "vpn.example.com", "username": "alice",
             "socks_proxy": { "port": 1081 } }"#,
    )
    .unwrap();
    let prompter = ScriptedPrompter::default();
    prompter.passwords.borrow_mut().push_back("s3cret".to_string());

    let (credentials, proxies) = config::resolve(&path, &&prompter).unwrap();

    assert_eq!(credentials.endpoint(), "vpn.example.com:443");
    assert_eq!(credentials.password.expose(), "s3cret");
    assert_eq!(proxies.socks.port, 1081);
    assert!(proxies.socks.auto_start);
    assert!(!proxies.http.enabled);
    assert_eq!(
        prompter.questions.borrow()[0],
        "VPN password for alice@vpn.example.com: "
    );
}

#[test]
fn test_template_round_trips_through_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.json");
    Config::template().save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded.gateway.as_deref(), Some("vpn.example.com"));
    assert_eq!(loaded.proxy_config().unwrap(), ProxyConfig::default());
}
