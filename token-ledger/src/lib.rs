//! Token Ledger
//!
//! Double-entry token ledger with idempotent issuance and periodic
//! reconciliation.
//!
//! # Architecture
//!
//! - **Balance Store**: RocksDB column families for balances, entries and indexes
//! - **Row Locks**: Per-account mutexes taken in sorted order with a bounded wait
//! - **Atomic Commit**: Balances and entries written in one batch
//! - **Idempotency**: External event ids are claimed before their effect runs
//! - **Reconciliation**: Issuance minus burn checked against the sum of balances
//!
//! # Invariants
//!
//! - Non-negativity: no balance is ever observed below zero
//! - Append-only: entries are never modified or deleted
//! - Replay: each account's entries replay to its stored balance
//! - Pairing: transfer legs under one ref id sum to `-fee`

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod locks;
pub mod ledger;
pub mod transfer;
pub mod idempotency;
pub mod purchase;
pub mod reconciliation;
pub mod notifier;
pub mod retry;
pub mod error;
pub mod config;
pub mod metrics;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use idempotency::{IdempotencyGuard, Processed};
pub use ledger::Ledger;
pub use metrics::Metrics;
pub use notifier::{spawn_notifier, NoopSink, Notification, NotificationSink, NotifierHandle};
pub use reconciliation::{spawn_reconciliation_task, AccountVerification, Auditor};
pub use retry::{retry_transient, RetryPolicy};
pub use storage::{Storage, StorageStats};
pub use types::{
    Account, AccountId, ApplyOptions, ApplyOutcome, EndReason, EntryType, EventStatus,
    ExternalEventRecord, LedgerEntry, MeteredSession, PurchaseConfirmation,
    ReconciliationReport, ReconciliationSnapshot, ReconciliationStatus, SessionState,
    TransferKind, TransferReceipt, TransferRequest, UnbalancedPair,
};
