use clap::{Parser, Subcommand};
use lima_vpn::client::{ClientError, ForticlientCli};
use lima_vpn::config::{self, Config, ConfigError};
use lima_vpn::orchestrator::{ConnectResult, Orchestrator, OrchestratorError};
use lima_vpn::prompt::TerminalPrompter;
use lima_vpn::proxy::ProxyManager;
use lima_vpn::trust::TrustStore;
use lima_vpn::vm::{EnvironmentError, LimaVm};
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::level_filters::LevelFilter;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

type LimaOrchestrator = Orchestrator<LimaVm, ForticlientCli, ProxyManager, TerminalPrompter>;

#[derive(Parser)]
#[command(name = "lima-vpn")]
#[command(about = "Run a VPN client inside a Lima VM and reach it through local proxies")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ./lima-vpn.json, then ~/.lima-vpn/config.json)
    #[arg(short, long, global = true, env = config::CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the VPN inside the VM and start the proxies
    #[command(name = "vpn-connect", alias = "connect")]
    Connect,
    /// Stop the proxies and disconnect the VPN
    #[command(name = "vpn-disconnect", alias = "disconnect")]
    Disconnect,
    /// Show VPN, proxy and certificate status
    #[command(name = "vpn-status", alias = "status")]
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate a config file template
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
    /// Show the pinned server certificate
    Trust,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            eprintln!("{}", failure);
            ExitCode::FAILURE
        }
    }
}

/// Everything a command allocated, the password included, is dropped
/// before this returns
async fn run(cli: Cli) -> Result<(), Failure> {
    // Logs go to stderr; stdout carries the reports
    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(Failure::error)?;

    let config_path = Config::locate(cli.config.as_deref());
    debug!("Using config {}", config_path.display());

    match cli.command {
        Commands::Connect => {
            let config = Config::load(&config_path).map_err(Failure::error)?;
            let prompter = TerminalPrompter::new();
            let (credentials, proxies) = config.resolve(&prompter).map_err(Failure::error)?;
            let orchestrator = build(&config, prompter).map_err(Failure::error)?;

            match orchestrator.connect(&credentials, &proxies).await {
                ConnectResult::Connected(summary) => println!("{}", summary),
                ConnectResult::Aborted(reason) => {
                    return Err(Failure {
                        message: format!("Connection aborted: {}", reason),
                        hint: None,
                    });
                }
                ConnectResult::Failed(e) => {
                    let hint = hint(&e, &config);
                    return Err(Failure::error(e).with_hint(hint));
                }
            }
        }
        Commands::Disconnect => {
            let config = Config::load(&config_path).map_err(Failure::error)?;
            let proxies = config.proxy_config().map_err(Failure::error)?;
            let orchestrator = build(&config, TerminalPrompter::new()).map_err(Failure::error)?;

            let report = orchestrator.disconnect(&proxies).await.map_err(Failure::error)?;
            println!("{}", report);
        }
        Commands::Status { json } => {
            let config = Config::load(&config_path).map_err(Failure::error)?;
            let proxies = config.proxy_config().map_err(Failure::error)?;
            let orchestrator = build(&config, TerminalPrompter::new()).map_err(Failure::error)?;

            let report = orchestrator.status(&proxies).await;
            if json {
                let json = serde_json::to_string_pretty(&report).map_err(Failure::error)?;
                println!("{}", json);
            } else {
                println!("{}", report);
            }
        }
        Commands::Init { force } => {
            let path = match cli.config {
                Some(path) => path,
                None => Config::default_path()
                    .ok_or_else(|| Failure::error(ConfigError::NoHomeDirectory))?,
            };
            if path.exists() && !force {
                let failure = Failure::error(format!("Config already exists: {}", path.display()));
                return Err(failure.with_hint(Some("Use --force to overwrite it".to_string())));
            }
            info!("Generating config template...");
            Config::template().save(&path).map_err(Failure::error)?;
            println!("Created config: {}", path.display());
            println!("Edit gateway and username, then run: lima-vpn vpn-connect");
        }
        Commands::Trust => {
            let config = Config::load(&config_path).map_err(Failure::error)?;
            let path = config
                .trust_store_path()
                .ok_or_else(|| Failure::error(ConfigError::NoHomeDirectory))?;
            let store = TrustStore::new(path);
            match store.stored().map_err(Failure::error)? {
                Some(fingerprint) => {
                    println!("Trusted certificate: {}", fingerprint);
                    println!("Stored in: {}", store.path().display());
                }
                None => println!("No certificate trusted yet ({})", store.path().display()),
            }
        }
    }

    Ok(())
}

/// Error line plus optional remediation, printed to stderr
struct Failure {
    message: String,
    hint: Option<String>,
}

impl Failure {
    fn error(err: impl Display) -> Self {
        Self {
            message: format!("Error: {}", err),
            hint: None,
        }
    }

    fn with_hint(mut self, hint: Option<String>) -> Self {
        self.hint = hint;
        self
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\nHint: {}", hint)?;
        }
        Ok(())
    }
}

fn build(config: &Config, prompter: TerminalPrompter) -> Result<LimaOrchestrator, ConfigError> {
    let state_dir = config::state_dir().ok_or(ConfigError::NoHomeDirectory)?;
    let trust_path = config
        .trust_store_path()
        .ok_or(ConfigError::NoHomeDirectory)?;

    let vm = LimaVm::new(config.vm.name.clone(), config.client.command_timeout());
    let client = ForticlientCli::new(vm.launcher(), &config.client);
    let proxies = ProxyManager::new(vm.ssh_destination(), state_dir);

    Ok(
        Orchestrator::new(vm, client, proxies, prompter, TrustStore::new(trust_path))
            .with_reconnect_delay(config.client.reconnect_delay()),
    )
}

/// Remediation shown under a failed connect
fn hint(err: &OrchestratorError, config: &Config) -> Option<String> {
    match err {
        OrchestratorError::Environment(EnvironmentError::Spawn { .. }) => {
            Some("Install Lima: https://lima-vm.io".to_string())
        }
        OrchestratorError::Client(ClientError::Spawn { .. }) => Some(format!(
            "Check that '{}' is installed in VM '{}'",
            config.client.binary, config.vm.name
        )),
        OrchestratorError::Client(ClientError::Timeout(_)) => Some(
            "Check that the gateway is reachable, or raise client.connect_timeout_secs".to_string(),
        ),
        OrchestratorError::Client(ClientError::AuthenticationFailed) => {
            Some("Check the username and password".to_string())
        }
        OrchestratorError::NotConnected(_) => {
            Some("Run 'lima-vpn vpn-status' or retry with --verbose".to_string())
        }
        _ => None,
    }
}
