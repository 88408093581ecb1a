//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `ledger_entries_total` - Ledger entries appended
//! - `ledger_insufficient_balance_total` - Debits rejected for insufficient balance
//! - `ledger_duplicate_events_total` - External events skipped as duplicates
//! - `ledger_transient_failures_total` - Lock timeouts and store hiccups
//! - `ledger_apply_duration_seconds` - Histogram of commit latencies
//! - `ledger_reconciliation_discrepancy` - Discrepancy of the latest audit
//! - `ledger_unbalanced_pairs` - Unbalanced ref ids in the latest audit
//! - `metering_ticks_charged_total` - Metering blocks charged
//! - `metering_sessions_ended_total` - Sessions ended by metering

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Ledger entries appended
    pub entries_total: IntCounter,

    /// Insufficient-balance rejections
    pub insufficient_balance_total: IntCounter,

    /// Duplicate external events
    pub duplicate_events_total: IntCounter,

    /// Transient failures
    pub transient_failures_total: IntCounter,

    /// Commit latency histogram
    pub apply_duration: Histogram,

    /// Latest reconciliation discrepancy
    pub reconciliation_discrepancy: IntGauge,

    /// Latest unbalanced pair count
    pub unbalanced_pairs: IntGauge,

    /// Metering blocks charged
    pub ticks_charged_total: IntCounter,

    /// Sessions ended by metering
    pub sessions_ended_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector on a private registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_total =
            IntCounter::new("ledger_entries_total", "Ledger entries appended")?;
        registry.register(Box::new(entries_total.clone()))?;

        let insufficient_balance_total = IntCounter::new(
            "ledger_insufficient_balance_total",
            "Debits rejected for insufficient balance",
        )?;
        registry.register(Box::new(insufficient_balance_total.clone()))?;

        let duplicate_events_total = IntCounter::new(
            "ledger_duplicate_events_total",
            "External events skipped as duplicates",
        )?;
        registry.register(Box::new(duplicate_events_total.clone()))?;

        let transient_failures_total = IntCounter::new(
            "ledger_transient_failures_total",
            "Lock timeouts and transient store failures",
        )?;
        registry.register(Box::new(transient_failures_total.clone()))?;

        let apply_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_apply_duration_seconds",
                "Histogram of ledger commit latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.500, 1.0]),
        )?;
        registry.register(Box::new(apply_duration.clone()))?;

        let reconciliation_discrepancy = IntGauge::new(
            "ledger_reconciliation_discrepancy",
            "Discrepancy reported by the latest reconciliation",
        )?;
        registry.register(Box::new(reconciliation_discrepancy.clone()))?;

        let unbalanced_pairs = IntGauge::new(
            "ledger_unbalanced_pairs",
            "Unbalanced ref ids reported by the latest reconciliation",
        )?;
        registry.register(Box::new(unbalanced_pairs.clone()))?;

        let ticks_charged_total =
            IntCounter::new("metering_ticks_charged_total", "Metering blocks charged")?;
        registry.register(Box::new(ticks_charged_total.clone()))?;

        let sessions_ended_total = IntCounter::new(
            "metering_sessions_ended_total",
            "Sessions ended by the metering scheduler",
        )?;
        registry.register(Box::new(sessions_ended_total.clone()))?;

        Ok(Self {
            entries_total,
            insufficient_balance_total,
            duplicate_events_total,
            transient_failures_total,
            apply_duration,
            reconciliation_discrepancy,
            unbalanced_pairs,
            ticks_charged_total,
            sessions_ended_total,
            registry,
        })
    }

    /// Record appended entries
    pub fn record_entries(&self, count: usize) {
        self.entries_total.inc_by(count as u64);
    }

    /// Record commit duration
    pub fn record_apply_duration(&self, duration_seconds: f64) {
        self.apply_duration.observe(duration_seconds);
    }

    /// Record a ledger failure by kind
    pub fn record_failure(&self, err: &crate::Error) {
        match err {
            crate::Error::InsufficientBalance { .. } => self.insufficient_balance_total.inc(),
            e if e.is_transient() => self.transient_failures_total.inc(),
            _ => {}
        }
    }

    /// Record duplicate external event
    pub fn record_duplicate(&self) {
        self.duplicate_events_total.inc();
    }

    /// Record reconciliation outcome
    pub fn record_reconciliation(&self, discrepancy: i64, unbalanced_pairs: usize) {
        self.reconciliation_discrepancy.set(discrepancy);
        self.unbalanced_pairs.set(unbalanced_pairs as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("entries_total", &self.entries_total.get())
            .field("duplicate_events_total", &self.duplicate_events_total.get())
            .finish()
    }
}
