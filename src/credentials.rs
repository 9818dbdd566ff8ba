//! VPN credentials for a single connect attempt
//!
//! Credentials are built by the config resolver and dropped once the
//! orchestration sequence returns. Nothing here is ever written to disk.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroizing;

/// Default SSL-VPN port
pub const DEFAULT_PORT: u16 = 443;

/// A password held only in memory and wiped on drop
#[derive(Clone)]
pub struct Password(Zeroizing<String>);

impl Password {
    pub fn new(value: String) -> Self {
        Self(Zeroizing::new(value))
    }

    /// Borrow the plaintext (only for writing to the VPN client's stdin)
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(<redacted>)")
    }
}

impl Serialize for Password {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for Password {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Password::new)
    }
}

/// Everything the VPN client needs to authenticate
#[derive(Debug, Clone)]
pub struct VpnCredentials {
    /// Gateway hostname or IP
    pub gateway: String,
    /// Gateway port (1-65535)
    pub port: u16,
    pub username: String,
    pub password: Password,
}

impl VpnCredentials {
    /// `gateway:port` as shown in logs and reports
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.gateway, self.port)
    }
}
