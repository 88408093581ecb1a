//! Core types for metering

use serde::{Deserialize, Serialize};

/// Result of one metering tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickOutcome {
    /// A block was charged
    pub charged: bool,

    /// The session ended during this tick
    pub session_ended: bool,
}

impl TickOutcome {
    /// Block charged, session continues
    pub const CHARGED: Self = Self {
        charged: true,
        session_ended: false,
    };

    /// Nothing happened (not due, not active, or tick in flight)
    pub const SKIPPED: Self = Self {
        charged: false,
        session_ended: false,
    };

    /// Payer could not cover the block; session ended without a charge
    pub const ENDED: Self = Self {
        charged: false,
        session_ended: true,
    };
}

/// Aggregate of one scheduler pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    /// Due sessions examined
    pub examined: usize,

    /// Blocks charged
    pub charged: usize,

    /// Sessions ended for insufficient balance
    pub ended: usize,

    /// Ticks that did nothing
    pub skipped: usize,

    /// Ticks that failed and will be retried next pass
    pub failed: usize,
}

impl TickSummary {
    pub(crate) fn record(&mut self, outcome: TickOutcome) {
        self.examined += 1;
        match (outcome.charged, outcome.session_ended) {
            (true, _) => self.charged += 1,
            (false, true) => self.ended += 1,
            (false, false) => self.skipped += 1,
        }
    }

    pub(crate) fn record_failure(&mut self) {
        self.examined += 1;
        self.failed += 1;
    }
}
