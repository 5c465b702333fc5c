//! Line records exchanged with the host through the bridge files.

use crate::args::{format_args, parse_args, ArgsError};
use crate::{Command, Primitive, MAX_SEQ};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("empty record")]
    Empty,
    #[error("invalid seq '{0}'")]
    InvalidSeq(String),
    #[error("record has no name")]
    MissingName,
    #[error("invalid arguments: {0}")]
    Args(#[from] ArgsError),
}

/// An event the host appended to the host-events file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub seq: u64,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Primitive>,
}

impl OutputEvent {
    pub fn to_line(&self) -> String {
        if self.args.is_empty() {
            format!("{} {}", self.seq, self.name)
        } else {
            format!("{} {} {}", self.seq, self.name, format_args(&self.args))
        }
    }
}

fn split_seq(line: &str) -> Result<(u64, &str), RecordError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(RecordError::Empty);
    }
    let (raw_seq, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((raw_seq, rest)) => (raw_seq, rest.trim_start()),
        None => (trimmed, ""),
    };
    match raw_seq.parse::<u64>() {
        Ok(seq) if seq <= MAX_SEQ => Ok((seq, rest)),
        _ => Err(RecordError::InvalidSeq(raw_seq.to_string())),
    }
}

/// Parses `"<seq> <name> [<args>]"`; the argument list is optional.
pub fn parse_event_line(line: &str) -> Result<OutputEvent, RecordError> {
    let (seq, rest) = split_seq(line)?;
    if rest.is_empty() {
        return Err(RecordError::MissingName);
    }
    let (name, raw_args) = match rest.split_once(char::is_whitespace) {
        Some((name, raw_args)) => (name, raw_args.trim()),
        None => (rest, ""),
    };
    let args = if raw_args.is_empty() {
        Vec::new()
    } else {
        parse_args(raw_args)?
    };
    Ok(OutputEvent {
        seq,
        name: name.to_string(),
        args,
    })
}

/// Parses a pending-commands line `"<seq> <CMD> <params...>"`.
pub fn parse_command_line(line: &str) -> Result<Command, RecordError> {
    let (seq, rest) = split_seq(line)?;
    if rest.is_empty() {
        return Err(RecordError::MissingName);
    }
    Ok(Command::new(seq, rest.trim_end()))
}
