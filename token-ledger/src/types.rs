//! Core types for the token ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Integer token arithmetic (no floating point balances)
//! - Closed enums for entry types so invalid combinations do not compile

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Account identifier (opaque user or creator id)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for AccountId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

/// Ledger entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EntryType {
    /// Tokens bought through the payment provider
    Purchase = 1,
    /// Generic spend on a creator
    Spend = 2,
    /// Tip debit
    TipSent = 3,
    /// Tip credit
    TipReceived = 4,
    /// Pay-per-minute charge
    CallCharge = 5,
    /// Pay-per-minute earning
    CallEarning = 6,
    /// Ticket debit
    TicketPurchase = 7,
    /// Ticket credit
    TicketSale = 8,
    /// Tokens returned to the payment provider (burn)
    Refund = 9,
    /// Operator compensating entry
    AdminAdjust = 10,
    /// Credit leg paired with `Spend`
    Earning = 11,
}

/// Sign a delta must carry for a given entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaSign {
    /// Strictly positive
    Credit,
    /// Strictly negative
    Debit,
    /// Either sign
    Any,
}

impl EntryType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Purchase => "purchase",
            EntryType::Spend => "spend",
            EntryType::TipSent => "tip_sent",
            EntryType::TipReceived => "tip_received",
            EntryType::CallCharge => "call_charge",
            EntryType::CallEarning => "call_earning",
            EntryType::TicketPurchase => "ticket_purchase",
            EntryType::TicketSale => "ticket_sale",
            EntryType::Refund => "refund",
            EntryType::AdminAdjust => "admin_adjust",
            EntryType::Earning => "earning",
        }
    }

    /// Required delta sign
    pub fn sign(&self) -> DeltaSign {
        match self {
            EntryType::Purchase
            | EntryType::TipReceived
            | EntryType::CallEarning
            | EntryType::TicketSale
            | EntryType::Earning => DeltaSign::Credit,
            EntryType::Spend
            | EntryType::TipSent
            | EntryType::CallCharge
            | EntryType::TicketPurchase
            | EntryType::Refund => DeltaSign::Debit,
            EntryType::AdminAdjust => DeltaSign::Any,
        }
    }

    /// Whether a delta is allowed for this type
    pub fn accepts(&self, delta: i64) -> bool {
        match self.sign() {
            DeltaSign::Credit => delta > 0,
            DeltaSign::Debit => delta < 0,
            DeltaSign::Any => delta != 0,
        }
    }

    /// Entries that create or destroy tokens rather than move them
    pub fn is_issuance_or_burn(&self) -> bool {
        matches!(
            self,
            EntryType::Purchase | EntryType::Refund | EntryType::AdminAdjust
        )
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Peer-to-peer transfer kind; fixes the (debit, credit) entry type pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Tip to a creator
    Tip,
    /// Metered call block
    Call,
    /// Event ticket
    Ticket,
    /// Generic spend
    Spend,
}

impl TransferKind {
    /// Entry type of the sender leg
    pub fn debit_type(&self) -> EntryType {
        match self {
            TransferKind::Tip => EntryType::TipSent,
            TransferKind::Call => EntryType::CallCharge,
            TransferKind::Ticket => EntryType::TicketPurchase,
            TransferKind::Spend => EntryType::Spend,
        }
    }

    /// Entry type of the recipient leg
    pub fn credit_type(&self) -> EntryType {
        match self {
            TransferKind::Tip => EntryType::TipReceived,
            TransferKind::Call => EntryType::CallEarning,
            TransferKind::Ticket => EntryType::TicketSale,
            TransferKind::Spend => EntryType::Earning,
        }
    }
}

/// Account balance row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub account_id: AccountId,

    /// Token balance
    pub balance: u64,

    /// First balance-affecting event
    pub created_at: DateTime<Utc>,

    /// Last balance-affecting event
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Fresh zero-balance account
    pub fn new(account_id: AccountId, now: DateTime<Utc>) -> Self {
        Self {
            account_id,
            balance: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub entry_id: Uuid,

    /// Global append sequence
    pub sequence: u64,

    /// Account this entry mutates
    pub account_id: AccountId,

    /// Signed token delta (positive = credit)
    pub delta: i64,

    /// Balance before this entry
    pub balance_before: u64,

    /// Balance after this entry
    pub balance_after: u64,

    /// Entry type
    pub entry_type: EntryType,

    /// Correlation id shared by both legs of a transfer
    pub ref_id: Option<Uuid>,

    /// Payment-provider event id
    pub external_event_id: Option<String>,

    /// Platform cut of the transfer this leg belongs to
    #[serde(default)]
    pub fee: u64,

    /// Operator note (admin adjustments)
    #[serde(default)]
    pub memo: Option<String>,

    /// Append timestamp
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// `balance_after == balance_before + delta`
    pub fn is_consistent(&self) -> bool {
        self.balance_before as i128 + self.delta as i128 == self.balance_after as i128
    }
}

/// Options for a single balance mutation
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Correlation id
    pub ref_id: Option<Uuid>,

    /// External event id (idempotency key)
    pub external_event_id: Option<String>,

    /// Operator note
    pub memo: Option<String>,
}

impl ApplyOptions {
    /// Options carrying an external event id
    pub fn external(event_id: impl Into<String>) -> Self {
        Self {
            external_event_id: Some(event_id.into()),
            ..Default::default()
        }
    }
}

/// Result of a single balance mutation
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// Appended entry
    pub entry: LedgerEntry,

    /// Balance after the mutation
    pub balance_after: u64,
}

/// Peer-to-peer transfer request
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Debited account
    pub sender: AccountId,

    /// Credited account
    pub recipient: AccountId,

    /// Tokens debited from the sender
    pub amount: u64,

    /// Entry type pair
    pub kind: TransferKind,

    /// Platform cut; the recipient is credited `amount - fee`
    pub fee: u64,

    /// Caller-supplied correlation id
    pub ref_id: Option<Uuid>,

    /// Session row committed in the same batch as both legs
    pub session_update: Option<MeteredSession>,
}

impl TransferRequest {
    /// Fee-free transfer with a generated ref id
    pub fn new(sender: AccountId, recipient: AccountId, amount: u64, kind: TransferKind) -> Self {
        Self {
            sender,
            recipient,
            amount,
            kind,
            fee: 0,
            ref_id: None,
            session_update: None,
        }
    }

    /// Set the platform fee
    pub fn with_fee(mut self, fee: u64) -> Self {
        self.fee = fee;
        self
    }

    /// Use a caller-supplied ref id
    pub fn with_ref_id(mut self, ref_id: Uuid) -> Self {
        self.ref_id = Some(ref_id);
        self
    }

    /// Persist this session state atomically with the transfer
    pub fn with_session_update(mut self, session: MeteredSession) -> Self {
        self.session_update = Some(session);
        self
    }
}

/// Both legs of a committed transfer
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    /// Shared correlation id
    pub ref_id: Uuid,

    /// Sender leg
    pub debit: LedgerEntry,

    /// Recipient leg
    pub credit: LedgerEntry,
}

/// Payment confirmation delivered by the checkout collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseConfirmation {
    /// Payment-provider event id
    pub external_event_id: String,

    /// Credited account
    pub account_id: AccountId,

    /// Tokens purchased
    pub token_amount: u64,

    /// Amount charged (informational)
    pub usd_amount: Decimal,
}

/// Idempotency record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Claimed, ledger write in flight
    Processing,
    /// Ledger write committed
    Completed,
    /// Ledger write failed
    Failed,
}

/// Idempotency tracker for an external event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEventRecord {
    /// Payment-provider event id
    pub external_event_id: String,

    /// Current status
    pub status: EventStatus,

    /// Event payload as JSON text
    pub payload_snapshot: String,

    /// Number of claims (1 unless a transient failure was retried)
    pub attempts: u32,

    /// Failure was transient and the event may be re-claimed
    pub retryable: bool,

    /// Last failure message
    pub last_error: Option<String>,

    /// First seen
    pub created_at: DateTime<Utc>,

    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl ExternalEventRecord {
    /// Parsed payload
    pub fn payload(&self) -> crate::Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.payload_snapshot)?)
    }
}

/// Metered session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    /// Ticking
    Active = 1,
    /// Suspended, not ticking
    Paused = 2,
    /// Terminal
    Ended = 3,
}

impl SessionState {
    /// Allowed state machine edges
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Active, SessionState::Paused)
                | (SessionState::Paused, SessionState::Active)
                | (SessionState::Active, SessionState::Ended)
                | (SessionState::Paused, SessionState::Ended)
        )
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Ended by either participant or the call infrastructure
    Explicit,
    /// Payer could not cover the next block
    InsufficientBalance,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Explicit => write!(f, "explicit"),
            EndReason::InsufficientBalance => write!(f, "insufficient_balance"),
        }
    }
}

/// Pay-per-minute session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeteredSession {
    /// Session ID
    pub session_id: Uuid,

    /// Charged account
    pub payer_id: AccountId,

    /// Credited account
    pub payee_id: AccountId,

    /// Tokens per block
    pub rate_per_block: u64,

    /// Current state
    pub state: SessionState,

    /// Last successful charge (or start/resume time)
    pub last_metered_at: DateTime<Utc>,

    /// Blocks charged so far
    pub blocks_charged: u64,

    /// Tokens charged so far
    pub total_charged: u64,

    /// Start time
    pub started_at: DateTime<Utc>,

    /// End time
    pub ended_at: Option<DateTime<Utc>>,

    /// End reason
    pub end_reason: Option<EndReason>,
}

/// Reconciliation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    /// Zero discrepancy, no unbalanced pairs
    Balanced,
    /// Small, non-growing discrepancy
    Warning,
    /// Large or growing discrepancy, or unbalanced pairs
    Failed,
}

/// Point-in-time comparison of issuance against balances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationSnapshot {
    /// Snapshot ID
    pub snapshot_id: Uuid,

    /// Σ delta of purchase entries
    pub total_purchased: i64,

    /// -Σ delta of refund and admin_adjust entries
    pub total_burned: i64,

    /// Σ fee over transfer pairs
    pub total_fees: i64,

    /// Σ account balances
    pub sum_of_balances: i64,

    /// `(total_purchased - total_burned - total_fees) - sum_of_balances`
    pub discrepancy: i64,

    /// Outcome
    pub status: ReconciliationStatus,

    /// Number of unbalanced ref ids
    pub unbalanced_pair_count: u64,

    /// Entries scanned
    pub entries_scanned: u64,

    /// Run timestamp
    pub created_at: DateTime<Utc>,
}

/// Ref id whose legs do not form a balanced pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbalancedPair {
    /// Correlation id
    pub ref_id: Uuid,

    /// Entries sharing the ref id
    pub entry_ids: Vec<Uuid>,

    /// Σ delta of those entries
    pub delta_sum: i64,

    /// Fee recorded on the first leg
    pub fee: u64,
}

/// Snapshot plus unresolved pairs, as served to the admin dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Aggregate snapshot
    pub snapshot: ReconciliationSnapshot,

    /// Unbalanced ref ids found by the same run
    pub unbalanced_pairs: Vec<UnbalancedPair>,
}
