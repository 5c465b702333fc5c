//! Resynchronization session between the agent and the host.
//!
//! A session writes a single RESET record at `attempt_seq` and waits for the
//! host's ack watermark to reach it. Each time the escalation interval passes
//! without that happening, the record is re-issued at the next escalation
//! target (1_000_000, doubling, capped at 1_000_000_000). Any ack at or above
//! the smallest value ever attempted completes the session.

use crate::Command;
use std::time::{Duration, Instant};

pub const ESCALATION_START: u64 = 1_000_000;
pub const ESCALATION_CEILING: u64 = 1_000_000_000;
pub const DEFAULT_ESCALATION_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ResetSession {
    attempt_seq: u64,
    min_seq_accepted: u64,
    next_escalation_target: u64,
    issued_at: Instant,
    escalations: u32,
}

impl ResetSession {
    pub fn begin(last_ack: i64, now: Instant) -> Self {
        let attempt_seq = u64::try_from(last_ack.saturating_add(1)).unwrap_or(0);
        let mut next_escalation_target = ESCALATION_START;
        while next_escalation_target <= attempt_seq && next_escalation_target < ESCALATION_CEILING
        {
            next_escalation_target = next_escalation_target.saturating_mul(2);
        }
        Self {
            attempt_seq,
            min_seq_accepted: attempt_seq,
            next_escalation_target: next_escalation_target.min(ESCALATION_CEILING),
            issued_at: now,
            escalations: 0,
        }
    }

    pub fn attempt_seq(&self) -> u64 {
        self.attempt_seq
    }

    pub fn min_seq_accepted(&self) -> u64 {
        self.min_seq_accepted
    }

    pub fn next_escalation_target(&self) -> u64 {
        self.next_escalation_target
    }

    pub fn escalations(&self) -> u32 {
        self.escalations
    }

    /// The synthetic record the host must apply for the current attempt.
    pub fn record(&self) -> Command {
        Command::reset_record(self.attempt_seq)
    }

    pub fn is_satisfied_by(&self, watermark: i64) -> bool {
        watermark >= 0 && watermark as u64 >= self.min_seq_accepted
    }

    pub fn escalation_due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.issued_at) >= interval
    }

    /// Moves to the next attempt value and returns it.
    pub fn escalate(&mut self, now: Instant) -> u64 {
        self.attempt_seq = self.next_escalation_target;
        self.min_seq_accepted = self.min_seq_accepted.min(self.attempt_seq);
        self.next_escalation_target = self
            .next_escalation_target
            .saturating_mul(2)
            .min(ESCALATION_CEILING);
        self.issued_at = now;
        self.escalations += 1;
        self.attempt_seq
    }

    pub fn at_ceiling(&self) -> bool {
        self.attempt_seq >= ESCALATION_CEILING
    }
}
