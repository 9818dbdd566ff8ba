//! Interactive prompts on the controlling terminal
//!
//! The orchestrator and the config resolver never talk to the terminal
//! directly; they go through [`Prompter`] so tests can script the answers.

use std::io::{self, BufRead, Write};

/// Source of interactive answers
pub trait Prompter {
    /// Masked, single-line secret entry. The answer is never echoed.
    fn password(&self, message: &str) -> io::Result<String>;

    /// Yes/no question. Only an explicit "y" or "yes" is a yes.
    fn confirm(&self, message: &str) -> io::Result<bool>;

    /// Informational or warning text shown to the user
    fn notice(&self, message: &str);
}

/// Prompts on the terminal: secrets via rpassword, everything else on stderr
pub struct TerminalPrompter;

impl TerminalPrompter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TerminalPrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompter for TerminalPrompter {
    fn password(&self, message: &str) -> io::Result<String> {
        rpassword::prompt_password(message)
    }

    fn confirm(&self, message: &str) -> io::Result<bool> {
        let mut stderr = io::stderr();
        write!(stderr, "{} (y/n): ", message)?;
        stderr.flush()?;

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(is_yes(&answer))
    }

    fn notice(&self, message: &str) {
        eprintln!("{}", message);
    }
}

/// Interpret a typed answer
pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
