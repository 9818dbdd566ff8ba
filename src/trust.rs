//! Trust-on-first-use pinning of the VPN server certificate
//!
//! A single trusted fingerprint is kept in a one-line text file. The file
//! is written in exactly one place, [`TrustStore::verify`], and only after
//! the user has said yes.

use crate::prompt::Prompter;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TrustError {
    #[error("Failed to read trust store {}: {source}", path.display())]
    ReadError { path: PathBuf, source: io::Error },
    #[error("Failed to write trust store {}: {source}", path.display())]
    WriteError { path: PathBuf, source: io::Error },
    #[error("Certificate prompt failed: {0}")]
    Prompt(#[source] io::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid certificate fingerprint: {0}")]
pub struct InvalidFingerprint(pub String);

/// Certificate fingerprint, normalised to upper-case colon-separated octets
///
/// Accepts SHA-1 (20 octets) and SHA-256 (32 octets), with or without colons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Fingerprint {
    type Err = InvalidFingerprint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let invalid = || InvalidFingerprint(raw.to_string());

        let octets: Vec<&str> = if raw.contains(':') {
            raw.split(':').collect()
        } else {
            if raw.len() % 2 != 0 || !raw.is_ascii() {
                return Err(invalid());
            }
            (0..raw.len()).step_by(2).map(|i| &raw[i..i + 2]).collect()
        };

        if !matches!(octets.len(), 20 | 32) {
            return Err(invalid());
        }
        if !octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(invalid());
        }

        Ok(Self(octets.join(":").to_ascii_uppercase()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of checking a presented certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustResult {
    Trusted,
    RejectedByUser,
}

/// Single-value, file-backed store of the trusted fingerprint
pub struct TrustStore {
    path: PathBuf,
}

impl TrustStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored value as written, if any
    ///
    /// Returned raw so a damaged file still shows up as "something else is
    /// pinned" instead of silently counting as first use.
    pub fn stored(&self) -> Result<Option<String>, TrustError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => {
                let value = content.lines().next().unwrap_or("").trim().to_string();
                Ok((!value.is_empty()).then_some(value))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(TrustError::ReadError {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Decide whether `presented` may be used to connect to `gateway`
    ///
    /// - nothing stored: ask, persist on yes
    /// - same fingerprint stored: trusted without asking
    /// - different fingerprint stored: warn, ask, overwrite only on yes
    pub fn verify(
        &self,
        presented: &Fingerprint,
        gateway: &str,
        prompter: &dyn Prompter,
    ) -> Result<TrustResult, TrustError> {
        let stored = self.stored()?;
        debug!("Stored fingerprint: {:?}", stored);

        match stored {
            None => {
                prompter.notice(&format!(
                    "First connection to {}. The server presented this certificate:\n  {}",
                    gateway, presented
                ));
                if !self.ask(prompter, "Trust this certificate and remember it?")? {
                    info!("Certificate for {} not trusted by user", gateway);
                    return Ok(TrustResult::RejectedByUser);
                }
                self.save(presented)?;
                info!("Pinned certificate {} for {}", presented, gateway);
                Ok(TrustResult::Trusted)
            }
            Some(ref value) if value.parse::<Fingerprint>().as_ref() == Ok(presented) => {
                prompter.notice(&format!(
                    "Server certificate matches the trusted fingerprint for {}",
                    gateway
                ));
                Ok(TrustResult::Trusted)
            }
            Some(value) => {
                warn!(
                    "Certificate for {} changed: trusted {}, presented {}",
                    gateway, value, presented
                );
                prompter.notice(&format!(
                    "WARNING: the certificate presented by {} does not match the trusted one.\n\
                     This can be a man-in-the-middle attack, or a legitimate rotation.\n  \
                     trusted:   {}\n  \
                     presented: {}",
                    gateway, value, presented
                ));
                if !self.ask(prompter, "Trust the NEW certificate and replace the old one?")? {
                    info!("Changed certificate rejected, keeping {}", value);
                    return Ok(TrustResult::RejectedByUser);
                }
                self.save(presented)?;
                info!("Replaced trusted certificate with {}", presented);
                Ok(TrustResult::Trusted)
            }
        }
    }

    fn ask(&self, prompter: &dyn Prompter, question: &str) -> Result<bool, TrustError> {
        prompter.confirm(question).map_err(TrustError::Prompt)
    }

    /// Write through a temp file and rename, so an interrupted run never
    /// leaves a half-written pin behind
    fn save(&self, fingerprint: &Fingerprint) -> Result<(), TrustError> {
        let write_error = |source| TrustError::WriteError {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_error)?;
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, format!("{}\n", fingerprint)).map_err(write_error)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600)).map_err(write_error)?;
        }

        fs::rename(&tmp, &self.path).map_err(write_error)?;
        Ok(())
    }
}
