use crate::Primitive;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Text of the synthetic record written while resynchronizing with the host.
pub const RESET_COMMAND: &str = "RESET";

/// One command bound for the host. `text` is everything after the seq on the
/// pending-commands line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub seq: u64,
    pub text: String,
}

impl Command {
    pub fn new(seq: u64, text: impl Into<String>) -> Self {
        Self {
            seq,
            text: text.into(),
        }
    }

    pub fn reset_record(seq: u64) -> Self {
        Self::new(seq, RESET_COMMAND)
    }

    pub fn is_reset(&self) -> bool {
        self.text == RESET_COMMAND
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.text)
    }
}

/// Builds the host-facing text for `cmd` with its params as space separated tokens.
pub fn render_command(cmd: &str, params: &[Primitive]) -> String {
    let mut text = cmd.trim().to_string();
    for param in params {
        text.push(' ');
        text.push_str(&param.to_string());
    }
    text
}

/// Per-session sequence source. Starts at 0 and only goes back to 0 through
/// [`SequenceCounter::reset`].
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: u64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u64 {
        let seq = self.next;
        self.next += 1;
        seq
    }

    pub fn peek(&self) -> u64 {
        self.next
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}
