use crate::{Command, LEDGER_CAPACITY};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("ledger full: {capacity} commands in flight")]
    Full { capacity: usize },
    #[error("seq {seq} does not follow {last}")]
    OutOfOrder { seq: u64, last: u64 },
}

/// Ordered, capacity-bounded set of commands the host has not applied yet.
///
/// Seqs are strictly increasing front to back. Acknowledgment is a cumulative
/// watermark, so entries only ever leave from the front.
#[derive(Debug, Clone)]
pub struct InflightLedger {
    capacity: usize,
    entries: VecDeque<Command>,
}

impl Default for InflightLedger {
    fn default() -> Self {
        Self::new(LEDGER_CAPACITY)
    }
}

impl InflightLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.entries.back().map(|command| command.seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.entries.iter()
    }

    pub fn push(&mut self, command: Command) -> Result<(), LedgerError> {
        if self.is_full() {
            return Err(LedgerError::Full {
                capacity: self.capacity,
            });
        }
        if let Some(last) = self.last_seq() {
            if command.seq <= last {
                return Err(LedgerError::OutOfOrder {
                    seq: command.seq,
                    last,
                });
            }
        }
        self.entries.push_back(command);
        Ok(())
    }

    /// Removes every leading command with `seq <= watermark` and returns them in
    /// order. Stops at the first command above the watermark.
    pub fn trim_through(&mut self, watermark: i64) -> Vec<Command> {
        let mut removed = Vec::new();
        if watermark < 0 {
            return removed;
        }
        let watermark = watermark as u64;
        while let Some(front) = self.entries.front() {
            if front.seq > watermark {
                break;
            }
            if let Some(command) = self.entries.pop_front() {
                removed.push(command);
            }
        }
        removed
    }

    pub fn take_all(&mut self) -> Vec<Command> {
        self.entries.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Pending-commands body: one `"<seq> <text>"` line per entry.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for command in &self.entries {
            out.push_str(&command.to_string());
            out.push('\n');
        }
        out
    }
}
