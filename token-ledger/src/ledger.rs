//! Ledger writer
//!
//! Every balance mutation flows through [`Ledger::apply_delta`] or one of the
//! multi-leg operations built on the same posting path. A posting:
//!
//! 1. validates each leg's sign against its entry type,
//! 2. takes the row locks of all touched accounts in sorted order,
//! 3. reads balances under lock and rejects any leg that would go negative,
//! 4. commits balance rows and immutable entries in one `WriteBatch`,
//! 5. publishes a balance-changed notification per entry (best effort).
//!
//! # Example
//!
//! ```no_run
//! use token_ledger::{AccountId, ApplyOptions, Config, EntryType, Ledger};
//!
//! #[tokio::main]
//! async fn main() -> token_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default())?;
//!
//!     let outcome = ledger
//!         .apply_delta(&AccountId::new("acct-a"), 100, EntryType::AdminAdjust, ApplyOptions::default())
//!         .await?;
//!     assert_eq!(outcome.balance_after, 100);
//!
//!     Ok(())
//! }
//! ```

use crate::{
    idempotency::IdempotencyGuard,
    locks::{AccountLocks, RefClaims},
    metrics::Metrics,
    notifier::{NoopSink, Notification, NotificationSink},
    reconciliation::Auditor,
    retry::RetryPolicy,
    storage::StorageStats,
    types::{
        Account, AccountId, ApplyOptions, ApplyOutcome, EntryType, ExternalEventRecord,
        LedgerEntry, MeteredSession, ReconciliationSnapshot,
    },
    Config, Error, Result, Storage,
};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// One leg of a posting
#[derive(Debug, Clone)]
pub(crate) struct Posting {
    pub account_id: AccountId,
    pub delta: i64,
    pub entry_type: EntryType,
}

/// Attributes shared by every entry of a posting
#[derive(Debug, Clone, Default)]
pub(crate) struct EntryMeta {
    pub ref_id: Option<Uuid>,
    pub external_event_id: Option<String>,
    pub fee: u64,
    pub memo: Option<String>,
    /// Reject the posting if `ref_id` already has entries
    pub fresh_ref: bool,
}

/// Main ledger interface
pub struct Ledger {
    /// Durable tables
    storage: Arc<Storage>,

    /// Row locks
    locks: AccountLocks,

    /// Fresh ref ids being posted
    ref_claims: RefClaims,

    /// External event deduplication
    idempotency: IdempotencyGuard,

    /// Outbound notifications
    sink: Arc<dyn NotificationSink>,

    /// Prometheus collectors
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("data_dir", &self.config.data_dir)
            .field("storage", &self.storage)
            .finish()
    }
}

impl Ledger {
    /// Open ledger with configuration
    pub fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let metrics =
            Metrics::new().map_err(|e| Error::Other(format!("Failed to create metrics: {}", e)))?;

        Ok(Self {
            locks: AccountLocks::new(config.ledger.lock_timeout()),
            ref_claims: RefClaims::new(),
            idempotency: IdempotencyGuard::new(storage.clone(), metrics.clone()),
            storage,
            sink: Arc::new(NoopSink),
            metrics,
            config,
        })
    }

    /// Set notification sink
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Apply a single signed delta to one account
    ///
    /// Fails with `InsufficientBalance` when a debit would take the balance
    /// below zero; nothing is written in that case.
    pub async fn apply_delta(
        &self,
        account_id: &AccountId,
        delta: i64,
        entry_type: EntryType,
        options: ApplyOptions,
    ) -> Result<ApplyOutcome> {
        let posting = Posting {
            account_id: account_id.clone(),
            delta,
            entry_type,
        };
        let meta = EntryMeta {
            ref_id: options.ref_id,
            external_event_id: options.external_event_id,
            memo: options.memo,
            ..Default::default()
        };

        let entry = self
            .post(&[posting], meta, None)
            .await?
            .pop()
            .ok_or_else(|| Error::InvariantViolation("posting returned no entry".to_string()))?;

        Ok(ApplyOutcome {
            balance_after: entry.balance_after,
            entry,
        })
    }

    /// Commit all legs atomically or none of them
    pub(crate) async fn post(
        &self,
        postings: &[Posting],
        meta: EntryMeta,
        session: Option<&MeteredSession>,
    ) -> Result<Vec<LedgerEntry>> {
        let started = Instant::now();

        match self.post_locked(postings, meta, session).await {
            Ok(entries) => {
                self.metrics.record_entries(entries.len());
                self.metrics
                    .record_apply_duration(started.elapsed().as_secs_f64());

                for entry in &entries {
                    tracing::debug!(
                        account_id = %entry.account_id,
                        sequence = entry.sequence,
                        delta = entry.delta,
                        balance_after = entry.balance_after,
                        entry_type = %entry.entry_type,
                        "Entry appended"
                    );
                    self.sink.publish(Notification::BalanceChanged {
                        account_id: entry.account_id.clone(),
                        balance_after: entry.balance_after,
                        delta: entry.delta,
                        entry_type: entry.entry_type,
                    });
                }

                Ok(entries)
            }
            Err(e) => {
                self.metrics.record_failure(&e);
                if !e.is_expected() {
                    tracing::warn!(
                        legs = postings.len(),
                        transient = e.is_transient(),
                        "Posting failed: {}",
                        e
                    );
                }
                Err(e)
            }
        }
    }

    async fn post_locked(
        &self,
        postings: &[Posting],
        meta: EntryMeta,
        session: Option<&MeteredSession>,
    ) -> Result<Vec<LedgerEntry>> {
        if postings.is_empty() {
            return Err(Error::InvalidRequest("posting has no legs".to_string()));
        }

        for posting in postings {
            if !posting.entry_type.accepts(posting.delta) {
                return Err(Error::InvalidRequest(format!(
                    "{} entry cannot carry delta {}",
                    posting.entry_type, posting.delta
                )));
            }
        }

        // Held until the batch commits; disjoint postings share no row lock
        let _ref_claim = match (meta.fresh_ref, meta.ref_id) {
            (true, Some(ref_id)) => Some(self.ref_claims.claim(ref_id)?),
            _ => None,
        };

        let accounts: BTreeSet<AccountId> =
            postings.iter().map(|p| p.account_id.clone()).collect();
        let _locks = self.locks.acquire(&accounts).await?;

        if let (true, Some(ref_id)) = (meta.fresh_ref, meta.ref_id) {
            if !self.storage.entries_for_ref(&ref_id)?.is_empty() {
                return Err(Error::InvalidRequest(format!(
                    "ref id {} already has entries",
                    ref_id
                )));
            }
        }

        let now = Utc::now();
        let mut rows: BTreeMap<AccountId, Account> = BTreeMap::new();
        for account_id in &accounts {
            let row = self
                .storage
                .get_account(account_id)?
                .unwrap_or_else(|| Account::new(account_id.clone(), now));
            rows.insert(account_id.clone(), row);
        }

        let mut entries = Vec::with_capacity(postings.len());
        for posting in postings {
            let row = rows.get_mut(&posting.account_id).ok_or_else(|| {
                Error::InvariantViolation(format!("{} was not locked", posting.account_id))
            })?;

            let balance_before = row.balance;
            let balance_after = next_balance(&posting.account_id, balance_before, posting.delta)?;
            row.balance = balance_after;
            row.updated_at = now;

            entries.push(LedgerEntry {
                entry_id: Uuid::now_v7(),
                sequence: 0,
                account_id: posting.account_id.clone(),
                delta: posting.delta,
                balance_before,
                balance_after,
                entry_type: posting.entry_type,
                ref_id: meta.ref_id,
                external_event_id: meta.external_event_id.clone(),
                fee: meta.fee,
                memo: meta.memo.clone(),
                created_at: now,
            });
        }

        // Sequences are allocated under lock so one account's entries sort in
        // mutation order.
        for entry in &mut entries {
            entry.sequence = self.storage.next_sequence();
            if !entry.is_consistent() {
                return Err(Error::InvariantViolation(format!(
                    "entry for {}: {} + {} != {}",
                    entry.account_id, entry.balance_before, entry.delta, entry.balance_after
                )));
            }
        }

        let rows: Vec<Account> = rows.into_values().collect();
        self.storage.commit_entries(&rows, &entries, session)?;

        Ok(entries)
    }

    /// Current balance (0 for unknown accounts)
    pub fn balance(&self, account_id: &AccountId) -> Result<u64> {
        self.storage.balance(account_id)
    }

    /// Account row
    pub fn account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        self.storage.get_account(account_id)
    }

    /// Entry history of one account, oldest first
    pub fn account_entries(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>> {
        self.storage.account_entries(account_id)
    }

    /// Entries sharing a ref id
    pub fn entries_for_ref(&self, ref_id: &Uuid) -> Result<Vec<LedgerEntry>> {
        self.storage.entries_for_ref(ref_id)
    }

    /// Idempotency record for an external event
    pub fn external_event(&self, external_event_id: &str) -> Result<Option<ExternalEventRecord>> {
        self.storage.get_external_event(external_event_id)
    }

    /// Latest reconciliation snapshot
    pub fn latest_snapshot(&self) -> Result<Option<ReconciliationSnapshot>> {
        Ok(self.storage.latest_report()?.map(|report| report.snapshot))
    }

    /// Reconciliation snapshots, newest first
    pub fn snapshots(&self, limit: usize) -> Result<Vec<ReconciliationSnapshot>> {
        self.auditor().snapshots(limit)
    }

    /// Store statistics
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    /// Idempotency guard
    pub fn idempotency(&self) -> &IdempotencyGuard {
        &self.idempotency
    }

    /// Reconciliation auditor over this ledger's store
    pub fn auditor(&self) -> Auditor {
        Auditor::new(
            self.storage.clone(),
            self.sink.clone(),
            self.metrics.clone(),
            self.config.reconciliation.clone(),
        )
    }

    /// Retry policy for transient failures
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config.ledger)
    }

    /// Underlying store
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Notification sink
    pub fn sink(&self) -> &Arc<dyn NotificationSink> {
        &self.sink
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn next_balance(account_id: &AccountId, balance: u64, delta: i64) -> Result<u64> {
    if delta >= 0 {
        balance
            .checked_add(delta as u64)
            .ok_or_else(|| Error::InvalidRequest(format!("balance overflow on {}", account_id)))
    } else {
        let requested = delta.unsigned_abs();
        balance
            .checked_sub(requested)
            .ok_or_else(|| Error::InsufficientBalance {
                account_id: account_id.clone(),
                balance,
                requested,
            })
    }
}
