//! Configuration handling for lima-vpn
//!
//! The config document is JSON (or TOML when the file ends in `.toml`) and
//! is re-read on every CLI invocation. Resolution turns it into
//! [`VpnCredentials`] and a [`ProxyConfig`], prompting for the password when
//! the file does not carry one.

use crate::credentials::{DEFAULT_PORT, Password, VpnCredentials};
use crate::prompt::Prompter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Environment variable that overrides the config path
pub const CONFIG_ENV: &str = "LIMA_VPN_CONFIG";

/// Config file picked up from the current directory
const LOCAL_CONFIG: &str = "lima-vpn.json";

/// Per-user state directory under $HOME
const STATE_DIR: &str = ".lima-vpn";

const SCHEMA_HINT: &str = r#"Create it with `lima-vpn init`, or write a JSON document like:
{
  "gateway": "vpn.example.com",
  "port": 443,
  "username": "alice",
  "password": "(optional, prompted for when absent)",
  "socks_proxy": { "enabled": true, "port": 1080, "auto_start": true, "auto_stop": true },
  "http_proxy": { "enabled": false, "port": 3128, "auto_start": false, "auto_stop": false }
}"#;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {}\n{}", path.display(), SCHEMA_HINT)]
    NotFound { path: PathBuf },
    #[error("Missing required config field: {0}")]
    MissingField(&'static str),
    #[error("Password must not be empty")]
    EmptyPassword,
    #[error("Invalid {field} {value}: must be between 1 and 65535")]
    InvalidPort { field: &'static str, value: u32 },
    #[error("Password prompt failed: {0}")]
    Prompt(#[source] std::io::Error),
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Failed to parse config: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(String),
    #[error("Could not determine the home directory")]
    NoHomeDirectory,
}

/// The config document as written on disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Password>,
    /// Override for the trusted-certificate file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_store: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks_proxy: Option<ProxyFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<ProxyFile>,
    #[serde(default)]
    pub vm: VmConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Proxy section as written; unset fields fall back to per-kind defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyFile {
    pub enabled: Option<bool>,
    pub port: Option<u32>,
    pub auto_start: Option<bool>,
    pub auto_stop: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Lima instance that runs the VPN client
    pub name: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: "fortivpn".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// VPN client executable inside the VM
    pub binary: String,
    /// Client-side profile name that holds the gateway settings
    pub profile: String,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// Pause between tearing down the first attempt and reconnecting
    pub reconnect_delay_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            binary: "forticlient".to_string(),
            profile: "lima-vpn".to_string(),
            connect_timeout_secs: 60,
            command_timeout_secs: 30,
            reconnect_delay_secs: 3,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Resolved settings for one proxy kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProxySettings {
    pub enabled: bool,
    pub port: u16,
    pub auto_start: bool,
    pub auto_stop: bool,
}

impl ProxySettings {
    pub const fn socks_default() -> Self {
        Self {
            enabled: true,
            port: 1080,
            auto_start: true,
            auto_stop: true,
        }
    }

    pub const fn http_default() -> Self {
        Self {
            enabled: false,
            port: 3128,
            auto_start: false,
            auto_stop: false,
        }
    }

    fn resolve(
        file: Option<&ProxyFile>,
        defaults: Self,
        field: &'static str,
    ) -> Result<Self, ConfigError> {
        let Some(file) = file else {
            return Ok(defaults);
        };
        let port = match file.port {
            Some(value) => checked_port(field, value)?,
            None => defaults.port,
        };
        Ok(Self {
            enabled: file.enabled.unwrap_or(defaults.enabled),
            port,
            auto_start: file.auto_start.unwrap_or(defaults.auto_start),
            auto_stop: file.auto_stop.unwrap_or(defaults.auto_stop),
        })
    }
}

/// Proxy settings for both kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProxyConfig {
    pub socks: ProxySettings,
    pub http: ProxySettings,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            socks: ProxySettings::socks_default(),
            http: ProxySettings::http_default(),
        }
    }
}

fn checked_port(field: &'static str, value: u32) -> Result<u16, ConfigError> {
    match u16::try_from(value) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort { field, value }),
    }
}

/// Treat absent, null and blank strings alike
fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingField(field))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        let config = if is_toml(path) {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = if is_toml(path) {
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| ConfigError::SerializeError(e.to_string()))?
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content + "\n")?;
        Ok(())
    }

    /// Starting point written by `lima-vpn init`
    pub fn template() -> Self {
        Self {
            gateway: Some("vpn.example.com".to_string()),
            port: Some(u32::from(DEFAULT_PORT)),
            username: Some("alice".to_string()),
            password: None,
            trust_store: None,
            socks_proxy: Some(ProxyFile::from(ProxySettings::socks_default())),
            http_proxy: Some(ProxyFile::from(ProxySettings::http_default())),
            vm: VmConfig::default(),
            client: ClientConfig::default(),
        }
    }

    /// Pick the config file: explicit path, then ./lima-vpn.json, then
    /// ~/.lima-vpn/config.json
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        let local = PathBuf::from(LOCAL_CONFIG);
        if local.exists() {
            return local;
        }
        Self::default_path().unwrap_or(local)
    }

    pub fn default_path() -> Option<PathBuf> {
        state_dir().map(|dir| dir.join("config.json"))
    }

    /// Trusted-certificate file: explicit override or ~/.lima-vpn/trusted_cert
    pub fn trust_store_path(&self) -> Option<PathBuf> {
        self.trust_store
            .clone()
            .or_else(|| state_dir().map(|dir| dir.join("trusted_cert")))
    }

    pub fn proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        Ok(ProxyConfig {
            socks: ProxySettings::resolve(
                self.socks_proxy.as_ref(),
                ProxySettings::socks_default(),
                "socks_proxy.port",
            )?,
            http: ProxySettings::resolve(
                self.http_proxy.as_ref(),
                ProxySettings::http_default(),
                "http_proxy.port",
            )?,
        })
    }

    /// Proxy settings and credentials, validated in that order so a bad
    /// port fails before the password prompt
    pub fn resolve(
        &self,
        prompter: &dyn Prompter,
    ) -> Result<(VpnCredentials, ProxyConfig), ConfigError> {
        let proxies = self.proxy_config()?;
        let credentials = self.credentials(prompter)?;
        Ok((credentials, proxies))
    }

    /// Build credentials, prompting for the password when the file has none.
    ///
    /// Required fields are checked before any prompt is shown.
    pub fn credentials(&self, prompter: &dyn Prompter) -> Result<VpnCredentials, ConfigError> {
        let gateway = required(&self.gateway, "gateway")?.to_string();
        let username = required(&self.username, "username")?.to_string();
        let port = match self.port {
            Some(value) => checked_port("port", value)?,
            None => DEFAULT_PORT,
        };

        let password = match self.password.as_ref().filter(|p| !p.is_empty()) {
            Some(password) => password.clone(),
            None => {
                let message = format!("VPN password for {}@{}: ", username, gateway);
                let answer = prompter.password(&message).map_err(ConfigError::Prompt)?;
                if answer.is_empty() {
                    return Err(ConfigError::EmptyPassword);
                }
                Password::new(answer)
            }
        };

        Ok(VpnCredentials {
            gateway,
            port,
            username,
            password,
        })
    }
}

impl From<ProxySettings> for ProxyFile {
    fn from(settings: ProxySettings) -> Self {
        Self {
            enabled: Some(settings.enabled),
            port: Some(u32::from(settings.port)),
            auto_start: Some(settings.auto_start),
            auto_stop: Some(settings.auto_stop),
        }
    }
}

/// Load the config and produce everything a connect needs
pub fn resolve(
    path: &Path,
    prompter: &dyn Prompter,
) -> Result<(VpnCredentials, ProxyConfig), ConfigError> {
    Config::load(path)?.resolve(prompter)
}

/// ~/.lima-vpn, where the pid files and the trusted certificate live
pub fn state_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(STATE_DIR))
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "toml")
}
