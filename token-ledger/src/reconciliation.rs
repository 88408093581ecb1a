//! Reconciliation auditor
//!
//! Compares aggregate issuance against the sum of balances from a single
//! point-in-time view of the store:
//!
//! ```text
//! discrepancy = (total_purchased - total_burned - total_fees) - sum_of_balances
//! ```
//!
//! Transfer legs are also grouped by ref id; every group must hold exactly
//! two legs whose deltas sum to `-fee`. Findings are logged and persisted,
//! never corrected automatically.

use crate::{
    config::ReconciliationConfig,
    metrics::Metrics,
    notifier::{Notification, NotificationSink},
    types::{
        AccountId, EntryType, LedgerEntry, ReconciliationReport, ReconciliationSnapshot,
        ReconciliationStatus, UnbalancedPair,
    },
    Error, Result, Storage,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Result of replaying one account's history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountVerification {
    /// Account
    pub account_id: AccountId,
    /// Entries replayed
    pub entry_count: usize,
    /// Balance reached by replay
    pub replayed_balance: u64,
    /// Balance stored on the account row
    pub stored_balance: u64,
}

/// Periodic ledger audit
#[derive(Debug, Clone)]
pub struct Auditor {
    storage: Arc<Storage>,
    sink: Arc<dyn NotificationSink>,
    metrics: Metrics,
    config: ReconciliationConfig,
}

#[derive(Default)]
struct Totals {
    purchased: i128,
    burn_net: i128,
    balances: i128,
    entries: u64,
    legs: BTreeMap<Uuid, Vec<LedgerEntry>>,
}

impl Totals {
    fn add_entry(&mut self, entry: LedgerEntry) {
        self.entries += 1;
        if !entry.entry_type.is_issuance_or_burn() {
            // Legs without a ref id land in the nil group and are
            // reported as unbalanced.
            let ref_id = entry.ref_id.unwrap_or_else(Uuid::nil);
            self.legs.entry(ref_id).or_default().push(entry);
        } else if entry.entry_type == EntryType::Purchase {
            self.purchased += entry.delta as i128;
        } else {
            self.burn_net += entry.delta as i128;
        }
    }
}

impl Auditor {
    /// Create auditor
    pub fn new(
        storage: Arc<Storage>,
        sink: Arc<dyn NotificationSink>,
        metrics: Metrics,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            storage,
            sink,
            metrics,
            config,
        }
    }

    /// Run one reconciliation and return its snapshot
    pub fn run_reconciliation(&self) -> Result<ReconciliationSnapshot> {
        Ok(self.run_report()?.snapshot)
    }

    /// Run one reconciliation and return the full report
    pub fn run_report(&self) -> Result<ReconciliationReport> {
        let mut totals = Totals::default();
        let mut balances: i128 = 0;
        self.storage.scan_consistent(
            |entry| totals.add_entry(entry),
            |account| balances += account.balance as i128,
        )?;
        totals.balances = balances;

        let mut fees: i128 = 0;
        let mut unbalanced_pairs = Vec::new();
        for (ref_id, legs) in &totals.legs {
            let fee = legs.first().map(|e| e.fee).unwrap_or(0);
            fees += fee as i128;

            let delta_sum: i128 = legs.iter().map(|e| e.delta as i128).sum();
            let balanced = !ref_id.is_nil()
                && legs.len() == 2
                && legs.iter().all(|e| e.fee == fee)
                && delta_sum == -(fee as i128);
            if !balanced {
                unbalanced_pairs.push(UnbalancedPair {
                    ref_id: *ref_id,
                    entry_ids: legs.iter().map(|e| e.entry_id).collect(),
                    delta_sum: to_i64(delta_sum, "delta sum")?,
                    fee,
                });
            }
        }

        let total_purchased = to_i64(totals.purchased, "total purchased")?;
        let total_burned = to_i64(-totals.burn_net, "total burned")?;
        let total_fees = to_i64(fees, "total fees")?;
        let sum_of_balances = to_i64(totals.balances, "sum of balances")?;
        let discrepancy = to_i64(
            (totals.purchased + totals.burn_net - fees) - totals.balances,
            "discrepancy",
        )?;

        let previous = self
            .storage
            .latest_report()?
            .map(|report| report.snapshot.discrepancy);
        let status = classify(
            discrepancy,
            unbalanced_pairs.len(),
            previous,
            self.config.warning_threshold,
        );

        let snapshot = ReconciliationSnapshot {
            snapshot_id: Uuid::now_v7(),
            total_purchased,
            total_burned,
            total_fees,
            sum_of_balances,
            discrepancy,
            status,
            unbalanced_pair_count: unbalanced_pairs.len() as u64,
            entries_scanned: totals.entries,
            created_at: Utc::now(),
        };
        let report = ReconciliationReport {
            snapshot,
            unbalanced_pairs,
        };

        self.storage.put_report(&report)?;
        self.metrics
            .record_reconciliation(discrepancy, report.unbalanced_pairs.len());

        let snapshot = &report.snapshot;
        match snapshot.status {
            ReconciliationStatus::Balanced => tracing::info!(
                snapshot_id = %snapshot.snapshot_id,
                entries = snapshot.entries_scanned,
                sum_of_balances,
                "Reconciliation balanced"
            ),
            ReconciliationStatus::Warning => tracing::warn!(
                snapshot_id = %snapshot.snapshot_id,
                discrepancy,
                "Reconciliation warning"
            ),
            ReconciliationStatus::Failed => {
                tracing::error!(
                    snapshot_id = %snapshot.snapshot_id,
                    discrepancy,
                    unbalanced_pairs = snapshot.unbalanced_pair_count,
                    "Reconciliation failed"
                );
                self.sink.publish(Notification::ReconciliationFailed {
                    snapshot_id: snapshot.snapshot_id,
                    discrepancy,
                    unbalanced_pairs: snapshot.unbalanced_pair_count,
                });
            }
        }

        Ok(report)
    }

    /// Latest persisted report
    pub fn latest_report(&self) -> Result<Option<ReconciliationReport>> {
        self.storage.latest_report()
    }

    /// Snapshot history, newest first
    pub fn snapshots(&self, limit: usize) -> Result<Vec<ReconciliationSnapshot>> {
        Ok(self
            .storage
            .recent_reports(limit)?
            .into_iter()
            .map(|report| report.snapshot)
            .collect())
    }

    /// Replay one account's entries and check them against its balance row
    pub fn verify_account(&self, account_id: &AccountId) -> Result<AccountVerification> {
        let (account, entries) = self.storage.account_history(account_id)?;

        let mut running: u64 = 0;
        for entry in &entries {
            if entry.balance_before != running {
                return Err(Error::InvariantViolation(format!(
                    "{} entry #{} starts at {} but previous balance was {}",
                    account_id, entry.sequence, entry.balance_before, running
                )));
            }
            if !entry.is_consistent() {
                return Err(Error::InvariantViolation(format!(
                    "{} entry #{}: {} + {} != {}",
                    account_id,
                    entry.sequence,
                    entry.balance_before,
                    entry.delta,
                    entry.balance_after
                )));
            }
            running = entry.balance_after;
        }

        let stored_balance = account.map(|a| a.balance).unwrap_or(0);
        if stored_balance != running {
            return Err(Error::InvariantViolation(format!(
                "{} stores balance {} but entries replay to {}",
                account_id, stored_balance, running
            )));
        }

        Ok(AccountVerification {
            account_id: account_id.clone(),
            entry_count: entries.len(),
            replayed_balance: running,
            stored_balance,
        })
    }
}

/// Status from the discrepancy, pair count and previous run
fn classify(
    discrepancy: i64,
    unbalanced_pairs: usize,
    previous: Option<i64>,
    warning_threshold: u64,
) -> ReconciliationStatus {
    if unbalanced_pairs > 0 {
        return ReconciliationStatus::Failed;
    }
    if discrepancy == 0 {
        return ReconciliationStatus::Balanced;
    }

    let magnitude = discrepancy.unsigned_abs();
    let growing = previous
        .filter(|p| *p != 0)
        .map_or(false, |p| magnitude > p.unsigned_abs());

    if magnitude <= warning_threshold && !growing {
        ReconciliationStatus::Warning
    } else {
        ReconciliationStatus::Failed
    }
}

fn to_i64(value: i128, what: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::InvariantViolation(format!("{} {} exceeds i64", what, value)))
}

/// Run reconciliation every `interval` until `shutdown` flips to true
pub fn spawn_reconciliation_task(
    auditor: Auditor,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_secs = interval.as_secs(), "Reconciliation task started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let auditor = auditor.clone();
                    match tokio::task::spawn_blocking(move || auditor.run_report()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::error!("Reconciliation run failed: {}", e),
                        Err(e) => tracing::error!("Reconciliation task panicked: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Reconciliation task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::create_test_ledger;
    use crate::types::{ApplyOptions, TransferKind, TransferRequest};

    #[test]
    fn test_classify() {
        use ReconciliationStatus::*;
        assert_eq!(classify(0, 0, None, 100), Balanced);
        assert_eq!(classify(0, 1, None, 100), Failed);
        assert_eq!(classify(5, 0, None, 100), Warning);
        assert_eq!(classify(5, 0, Some(0), 100), Warning);
        assert_eq!(classify(-5, 0, Some(5), 100), Warning);
        assert_eq!(classify(6, 0, Some(5), 100), Failed);
        assert_eq!(classify(101, 0, None, 100), Failed);
    }

    #[tokio::test]
    async fn test_balanced_after_normal_activity() {
        let (ledger, _temp) = create_test_ledger();
        let a = AccountId::new("acct-a");
        let b = AccountId::new("acct-b");

        ledger
            .apply_delta(&a, 100, EntryType::Purchase, ApplyOptions::default())
            .await
            .unwrap();
        ledger
            .transfer(TransferRequest::new(a.clone(), b.clone(), 40, TransferKind::Tip).with_fee(4))
            .await
            .unwrap();
        ledger
            .apply_delta(&b, -6, EntryType::Refund, ApplyOptions::default())
            .await
            .unwrap();

        let auditor = ledger.auditor();
        let snapshot = auditor.run_reconciliation().unwrap();
        assert_eq!(snapshot.total_purchased, 100);
        assert_eq!(snapshot.total_burned, 6);
        assert_eq!(snapshot.total_fees, 4);
        assert_eq!(snapshot.sum_of_balances, 90);
        assert_eq!(snapshot.discrepancy, 0);
        assert_eq!(snapshot.status, ReconciliationStatus::Balanced);
        assert_eq!(snapshot.entries_scanned, 4);

        let latest = auditor.latest_report().unwrap().unwrap();
        assert_eq!(latest.snapshot, snapshot);
        assert!(latest.unbalanced_pairs.is_empty());

        assert_eq!(auditor.verify_account(&a).unwrap().replayed_balance, 60);
        assert_eq!(auditor.verify_account(&b).unwrap().stored_balance, 30);
    }

    #[tokio::test]
    async fn test_half_transfer_is_unbalanced() {
        let (ledger, _temp) = create_test_ledger();
        let a = AccountId::new("acct-a");

        ledger
            .apply_delta(&a, 10, EntryType::Purchase, ApplyOptions::default())
            .await
            .unwrap();
        // A lone transfer leg simulates a lost counterpart
        ledger
            .apply_delta(
                &a,
                -3,
                EntryType::TipSent,
                ApplyOptions {
                    ref_id: Some(Uuid::now_v7()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let report = ledger.auditor().run_report().unwrap();
        assert_eq!(report.snapshot.status, ReconciliationStatus::Failed);
        assert_eq!(report.unbalanced_pairs.len(), 1);
        assert_eq!(report.unbalanced_pairs[0].delta_sum, -3);
        assert_eq!(report.snapshot.discrepancy, 3);
        assert_eq!(ledger.metrics().unbalanced_pairs.get(), 1);
    }

    #[tokio::test]
    async fn test_admin_adjust_nets_against_burn() {
        let (ledger, _temp) = create_test_ledger();
        let a = AccountId::new("acct-a");

        ledger.admin_adjust(&a, 7, "goodwill credit").await.unwrap();

        let snapshot = ledger.auditor().run_reconciliation().unwrap();
        assert_eq!(snapshot.total_burned, -7);
        assert_eq!(snapshot.discrepancy, 0);
    }

    #[tokio::test]
    async fn test_snapshots_newest_first() {
        let (ledger, _temp) = create_test_ledger();
        let auditor = ledger.auditor();

        let first = auditor.run_reconciliation().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = auditor.run_reconciliation().unwrap();

        let history = auditor.snapshots(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].snapshot_id, second.snapshot_id);
        assert_eq!(history[1].snapshot_id, first.snapshot_id);
    }

    #[tokio::test]
    async fn test_verify_unknown_account() {
        let (ledger, _temp) = create_test_ledger();
        let verification = ledger
            .auditor()
            .verify_account(&AccountId::new("nobody"))
            .unwrap();
        assert_eq!(verification.entry_count, 0);
        assert_eq!(verification.stored_balance, 0);
    }

    #[tokio::test]
    async fn test_background_task_stops_on_shutdown() {
        let (ledger, _temp) = create_test_ledger();
        let (tx, rx) = watch::channel(false);

        let handle =
            spawn_reconciliation_task(ledger.auditor(), Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(ledger.auditor().latest_report().unwrap().is_some());
    }
}
