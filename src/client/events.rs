//! Console output of the VPN client as a stream of tagged events
//!
//! The client has no machine interface: prompts and certificate details are
//! printed for a human. [`EventParser`] turns raw bytes into
//! [`ClientEvent`]s and leaves the string matching to a [`PromptMatcher`],
//! so a different client version only needs a different matcher.
//!
//! Prompts are usually not newline-terminated, so the unterminated tail of
//! the stream is offered to the matcher as well.

use crate::trust::Fingerprint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The client is waiting for the account password
    PasswordRequested,
    /// The client printed the server certificate fingerprint
    FingerprintAnnounced(Fingerprint),
    /// The client asks whether to continue with an untrusted certificate
    ConfirmationRequested,
    /// A labelled input field (profile editing), e.g. `Remote Gateway:`
    FieldRequested(String),
    /// The tunnel came up
    Connected,
    /// Anything else, passed through as diagnostics
    Output(String),
    /// The output stream closed
    SessionEnded,
}

/// Classification rules for one client's console output
pub trait PromptMatcher: Send + Sync {
    /// Classify `text`. `complete` is false for an unterminated tail that
    /// may still be a prompt waiting on input. An empty result means plain
    /// output.
    fn classify(&self, text: &str, complete: bool) -> Vec<ClientEvent>;
}

/// Phrases the FortiClient CLI prints once the tunnel is up
const CONNECTED_MARKERS: &[&str] = &["vpn connected", "tunnel running", "status: connected"];

/// Rules for the FortiClient Linux CLI
#[derive(Debug, Default, Clone, Copy)]
pub struct ForticlientMatcher;

impl PromptMatcher for ForticlientMatcher {
    fn classify(&self, text: &str, complete: bool) -> Vec<ClientEvent> {
        let trimmed = text.trim();
        let mut events = Vec::new();
        if trimmed.is_empty() {
            return events;
        }
        let lower = trimmed.to_ascii_lowercase();

        // The certificate question may carry the fingerprint on the same line
        if let Some(fingerprint) = find_fingerprint(trimmed, lower.contains("fingerprint")) {
            events.push(ClientEvent::FingerprintAnnounced(fingerprint));
        }

        if lower.contains("(y/n)") {
            events.push(ClientEvent::ConfirmationRequested);
        } else if lower.ends_with("password:") {
            events.push(ClientEvent::PasswordRequested);
        } else if !complete {
            // A bare fingerprint in an unfinished line is not final yet
            events.clear();
            if trimmed.ends_with(':') {
                events.push(ClientEvent::FieldRequested(field_label(trimmed)));
            }
        } else if events.is_empty() && CONNECTED_MARKERS.iter().any(|m| lower.contains(m)) {
            events.push(ClientEvent::Connected);
        }
        events
    }
}

/// `Port [443]:` -> `Port`
fn field_label(prompt: &str) -> String {
    let label = prompt.trim_end_matches(':').trim();
    match label.find('[') {
        Some(i) => label[..i].trim().to_string(),
        None => label.to_string(),
    }
}

/// First fingerprint-shaped token on the line. Bare hex only counts when
/// the line says it is a fingerprint.
fn find_fingerprint(line: &str, labelled: bool) -> Option<Fingerprint> {
    line.split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_ascii_hexdigit()))
        .filter(|token| labelled || token.contains(':'))
        .find_map(|token| token.parse().ok())
}

/// Incremental parser over one output stream
pub struct EventParser<'m> {
    matcher: &'m dyn PromptMatcher,
    pending: Vec<u8>,
    fields: bool,
}

impl<'m> EventParser<'m> {
    pub fn new(matcher: &'m dyn PromptMatcher) -> Self {
        Self {
            matcher,
            pending: Vec::new(),
            fields: false,
        }
    }

    /// Also report labelled field prompts (only wanted while editing a profile)
    pub fn with_fields(mut self, fields: bool) -> Self {
        self.fields = fields;
        self
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ClientEvent> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            events.extend(self.classify_line(&line));
        }

        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            let prompts = self.matcher.classify(&tail, false);
            let wanted = !prompts.is_empty()
                && (self.fields
                    || !prompts
                        .iter()
                        .any(|e| matches!(e, ClientEvent::FieldRequested(_))));
            if wanted {
                self.pending.clear();
                events.extend(prompts);
            }
        }

        events
    }

    /// Flush whatever is left and mark the end of the stream
    pub fn finish(&mut self) -> Vec<ClientEvent> {
        let rest = std::mem::take(&mut self.pending);
        let mut events = self.classify_line(&rest);
        events.push(ClientEvent::SessionEnded);
        events
    }

    fn classify_line(&self, raw: &[u8]) -> Vec<ClientEvent> {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim_end_matches(['\n', '\r']);
        // Progress output redraws with carriage returns; keep the last frame
        let text = text.rsplit('\r').next().unwrap_or("").trim_end();
        if text.trim().is_empty() {
            return Vec::new();
        }
        let events = self.matcher.classify(text, true);
        if events.is_empty() {
            vec![ClientEvent::Output(text.to_string())]
        } else {
            events
        }
    }
}
