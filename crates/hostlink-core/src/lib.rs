use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod args;
pub mod command;
pub mod gap;
pub mod ledger;
pub mod protocol;
pub mod record;
pub mod reset;

pub use command::{Command, SequenceCounter};
pub use gap::{GapTracker, Observation};
pub use ledger::{InflightLedger, LedgerError};
pub use record::OutputEvent;
pub use reset::ResetSession;

/// Hard bound on commands the host has not yet applied.
pub const LEDGER_CAPACITY: usize = 50;

/// Watermark value meaning "nothing applied yet".
pub const NO_ACK: i64 = -1;

/// Largest seq a bridge record may carry; it must fit the signed watermark.
pub const MAX_SEQ: u64 = i64::MAX as u64;

pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// A primitive value carried in command params and host-event arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Primitive {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primitive::Bool(value) => write!(f, "{value}"),
            Primitive::Int(value) => write!(f, "{value}"),
            // Debug keeps the fractional part so "2.0" does not read back as an int.
            Primitive::Float(value) => write!(f, "{value:?}"),
            Primitive::Text(value) => f.write_str(value),
        }
    }
}

impl From<&str> for Primitive {
    fn from(value: &str) -> Self {
        Primitive::Text(value.to_string())
    }
}

impl From<i64> for Primitive {
    fn from(value: i64) -> Self {
        Primitive::Int(value)
    }
}

impl From<bool> for Primitive {
    fn from(value: bool) -> Self {
        Primitive::Bool(value)
    }
}

pub fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > MAX_BACKOFF {
        MAX_BACKOFF
    } else {
        next
    }
}
