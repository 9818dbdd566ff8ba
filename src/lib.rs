//! lima-vpn - VPN session orchestrator for a VPN client running in a Lima VM
//!
//! The VPN client (FortiClient CLI) runs inside a local VM so the host's
//! routing stays untouched. This crate drives the client, pins the VPN
//! server's certificate on first use, and exposes the tunnel to the host
//! through local proxies.
//!
//! # Architecture
//!
//! - `config`: Config file loading and credential resolution
//! - `credentials`: In-memory credentials (password wiped on drop)
//! - `prompt`: Terminal prompts behind a trait
//! - `trust`: Trust-on-first-use certificate pinning
//! - `client`: Console-driven VPN client adapter
//! - `vm`: The Lima VM the client runs in
//! - `proxy`: SOCKS5 tunnel lifecycle and HTTP proxy checks
//! - `orchestrator`: The connect / disconnect / status sequences
//!
//! # Usage
//!
//! ```bash
//! lima-vpn init
//! lima-vpn vpn-connect
//! curl --socks5-hostname localhost:1080 https://intranet.example.com
//! lima-vpn vpn-disconnect
//! ```

pub mod client;
pub mod config;
pub mod credentials;
pub mod orchestrator;
pub mod prompt;
pub mod proxy;
pub mod trust;
pub mod vm;

pub use config::Config;
pub use credentials::VpnCredentials;
pub use orchestrator::{ConnectResult, Orchestrator, OrchestratorError, StatusReport};
pub use trust::{Fingerprint, TrustStore};
