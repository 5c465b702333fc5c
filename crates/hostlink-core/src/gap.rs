/// What a newly received event seq means relative to the stream so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    InOrder,
    /// Seqs `from..=to` were never received.
    Gap { from: u64, to: u64 },
    Duplicate,
    OutOfOrder,
    /// Seq 0 after a positive seq: the host started a new stream.
    Restart,
}

/// Expected-vs-received bookkeeping for a host event stream.
#[derive(Debug, Default, Clone)]
pub struct GapTracker {
    last_seen: Option<u64>,
    gaps: u64,
    missed: u64,
    duplicates: u64,
    out_of_order: u64,
}

impl GapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, seq: u64) -> Observation {
        let Some(last) = self.last_seen else {
            self.last_seen = Some(seq);
            return Observation::InOrder;
        };
        if seq == 0 && last > 0 {
            self.reset();
            self.last_seen = Some(0);
            return Observation::Restart;
        }
        if seq == last {
            self.duplicates = self.duplicates.saturating_add(1);
            return Observation::Duplicate;
        }
        if seq < last {
            self.out_of_order = self.out_of_order.saturating_add(1);
            return Observation::OutOfOrder;
        }
        self.last_seen = Some(seq);
        // seq > last, so neither bound can overflow.
        let from = last + 1;
        if seq == from {
            return Observation::InOrder;
        }
        let to = seq - 1;
        self.gaps = self.gaps.saturating_add(1);
        self.missed = self.missed.saturating_add(to - from + 1);
        Observation::Gap { from, to }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }

    /// Number of distinct gaps seen since the last restart.
    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    /// Total seqs skipped over by gaps.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }

    /// Duplicates plus out-of-order arrivals.
    pub fn disorder(&self) -> u64 {
        self.duplicates.saturating_add(self.out_of_order)
    }
}
