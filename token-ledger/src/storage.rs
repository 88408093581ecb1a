//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Balance rows (key: account id)
//! - `entries` - Append-only ledger entries (key: big-endian sequence)
//! - `account_entries` - Index: account id || sequence
//! - `ref_entries` - Index: ref id || sequence
//! - `external_events` - Idempotency records (key: external event id)
//! - `sessions` - Metered sessions (key: session id)
//! - `snapshots` - Reconciliation reports (key: big-endian millis || snapshot id)
//!
//! Balance rows are only ever written by [`Storage::commit_entries`], which
//! writes them together with their ledger entries in one `WriteBatch`.

use crate::{
    error::{Error, Result},
    types::{
        Account, AccountId, EventStatus, ExternalEventRecord, LedgerEntry, MeteredSession,
        ReconciliationReport, SessionState,
    },
    Config,
};
use chrono::Utc;
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_ENTRIES: &str = "entries";
const CF_ACCOUNT_ENTRIES: &str = "account_entries";
const CF_REF_ENTRIES: &str = "ref_entries";
const CF_EXTERNAL_EVENTS: &str = "external_events";
const CF_SESSIONS: &str = "sessions";
const CF_SNAPSHOTS: &str = "snapshots";

const ALL_CFS: [&str; 7] = [
    CF_ACCOUNTS,
    CF_ENTRIES,
    CF_ACCOUNT_ENTRIES,
    CF_REF_ENTRIES,
    CF_EXTERNAL_EVENTS,
    CF_SESSIONS,
    CF_SNAPSHOTS,
];

/// Outcome of claiming an external event id
#[derive(Debug, Clone)]
pub enum EventClaim {
    /// First arrival; record inserted as `processing`
    Claimed(ExternalEventRecord),
    /// Earlier attempt failed transiently; record re-opened as `processing`
    Reclaimed(ExternalEventRecord),
    /// Record already exists and blocks reprocessing
    Existing(ExternalEventRecord),
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    /// Last allocated entry sequence
    sequence: AtomicU64,
    /// Serializes check-and-insert on `external_events`
    event_claims: Mutex<()>,
    sync_writes: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("sequence", &self.sequence.load(Ordering::SeqCst))
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let storage = Self {
            db: Arc::new(db),
            sequence: AtomicU64::new(0),
            event_claims: Mutex::new(()),
            sync_writes: config.rocksdb.sync_writes,
        };

        let last_sequence = storage.last_sequence()?;
        storage.sequence.store(last_sequence, Ordering::SeqCst);

        tracing::info!(
            path = ?path,
            last_sequence,
            "Opened RocksDB with {} column families",
            ALL_CFS.len()
        );

        Ok(storage)
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // Hot rows, read on every mutation
            CF_ACCOUNTS | CF_SESSIONS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
            CF_ACCOUNT_ENTRIES | CF_REF_ENTRIES | CF_EXTERNAL_EVENTS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
        }
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    fn last_sequence(&self) -> Result<u64> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        let mut iter = self.db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Self::decode_sequence(&key)
            }
            None => Ok(0),
        }
    }

    /// Allocate the next entry sequence
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    // Account operations

    /// Get account row
    pub fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        match self.db.get_cf(cf, account_id.as_str().as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Current balance; unknown accounts hold 0
    pub fn balance(&self, account_id: &AccountId) -> Result<u64> {
        Ok(self
            .get_account(account_id)?
            .map(|account| account.balance)
            .unwrap_or(0))
    }

    // Ledger operations

    /// Commit balance rows and their entries atomically
    ///
    /// Callers must hold the row locks of every account in `accounts`.
    pub fn commit_entries(
        &self,
        accounts: &[Account],
        entries: &[LedgerEntry],
        session: Option<&MeteredSession>,
    ) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        for account in accounts {
            let value = bincode::serialize(account)?;
            batch.put_cf(cf_accounts, account.account_id.as_str().as_bytes(), &value);
        }

        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let cf_account_entries = self.cf_handle(CF_ACCOUNT_ENTRIES)?;
        let cf_ref_entries = self.cf_handle(CF_REF_ENTRIES)?;
        for entry in entries {
            let value = bincode::serialize(entry)?;
            batch.put_cf(cf_entries, entry.sequence.to_be_bytes(), &value);

            let idx_account = Self::index_key_account(&entry.account_id, Some(entry.sequence));
            batch.put_cf(cf_account_entries, &idx_account, b"");

            if let Some(ref_id) = entry.ref_id {
                let idx_ref = Self::index_key_ref(&ref_id, Some(entry.sequence));
                batch.put_cf(cf_ref_entries, &idx_ref, b"");
            }
        }

        if let Some(session) = session {
            let cf_sessions = self.cf_handle(CF_SESSIONS)?;
            let value = bincode::serialize(session)?;
            batch.put_cf(cf_sessions, session.session_id.as_bytes(), &value);
        }

        self.write(batch)?;

        tracing::debug!(
            entries = entries.len(),
            accounts = accounts.len(),
            "Ledger batch committed"
        );

        Ok(())
    }

    /// Get entry by sequence
    pub fn get_entry(&self, sequence: u64) -> Result<LedgerEntry> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        let value = self
            .db
            .get_cf(cf, sequence.to_be_bytes())?
            .ok_or_else(|| Error::NotFound(format!("ledger entry #{}", sequence)))?;
        Ok(bincode::deserialize(&value)?)
    }

    /// Entries of one account in append order
    pub fn account_entries(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let prefix = Self::index_key_account(account_id, None);
        self.scan_index(CF_ACCOUNT_ENTRIES, &prefix)
    }

    /// Entries sharing a ref id in append order
    pub fn entries_for_ref(&self, ref_id: &Uuid) -> Result<Vec<LedgerEntry>> {
        let prefix = Self::index_key_ref(ref_id, None);
        self.scan_index(CF_REF_ENTRIES, &prefix)
    }

    fn scan_index(&self, index_cf: &str, prefix: &[u8]) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf_handle(index_cf)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            let sequence = Self::decode_sequence(&key[prefix.len()..])?;
            entries.push(self.get_entry(sequence)?);
        }

        Ok(entries)
    }

    /// Account row and entry history read from one point-in-time view
    pub fn account_history(
        &self,
        account_id: &AccountId,
    ) -> Result<(Option<Account>, Vec<LedgerEntry>)> {
        let snapshot = self.db.snapshot();
        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        let cf_index = self.cf_handle(CF_ACCOUNT_ENTRIES)?;
        let cf_entries = self.cf_handle(CF_ENTRIES)?;

        let account = match snapshot.get_cf(cf_accounts, account_id.as_str().as_bytes())? {
            Some(value) => Some(bincode::deserialize::<Account>(&value)?),
            None => None,
        };

        let prefix = Self::index_key_account(account_id, None);
        let mut entries = Vec::new();
        for item in snapshot.iterator_cf(cf_index, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let sequence = Self::decode_sequence(&key[prefix.len()..])?;
            let value = snapshot
                .get_cf(cf_entries, sequence.to_be_bytes())?
                .ok_or_else(|| Error::NotFound(format!("ledger entry #{}", sequence)))?;
            entries.push(bincode::deserialize(&value)?);
        }

        Ok((account, entries))
    }

    /// Visit every entry and every account from one point-in-time view
    ///
    /// Balance rows and entries are committed in the same batch, so a
    /// snapshot never observes one without the other.
    pub fn scan_consistent<E, A>(&self, mut on_entry: E, mut on_account: A) -> Result<()>
    where
        E: FnMut(LedgerEntry),
        A: FnMut(Account),
    {
        let snapshot = self.db.snapshot();

        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        for item in snapshot.iterator_cf(cf_entries, IteratorMode::Start) {
            let (_, value) = item?;
            on_entry(bincode::deserialize(&value)?);
        }

        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        for item in snapshot.iterator_cf(cf_accounts, IteratorMode::Start) {
            let (_, value) = item?;
            on_account(bincode::deserialize(&value)?);
        }

        Ok(())
    }

    // External event operations

    /// Get idempotency record
    pub fn get_external_event(&self, external_event_id: &str) -> Result<Option<ExternalEventRecord>> {
        let cf = self.cf_handle(CF_EXTERNAL_EVENTS)?;
        match self.db.get_cf(cf, external_event_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Insert-if-absent on the idempotency table
    pub fn claim_external_event(
        &self,
        external_event_id: &str,
        payload_snapshot: String,
    ) -> Result<EventClaim> {
        let _guard = self.event_claims.lock();
        let now = Utc::now();

        match self.get_external_event(external_event_id)? {
            Some(mut record) => {
                if record.status == EventStatus::Failed && record.retryable {
                    record.status = EventStatus::Processing;
                    record.attempts += 1;
                    record.retryable = false;
                    record.updated_at = now;
                    self.put_external_event(&record)?;
                    Ok(EventClaim::Reclaimed(record))
                } else {
                    Ok(EventClaim::Existing(record))
                }
            }
            None => {
                let record = ExternalEventRecord {
                    external_event_id: external_event_id.to_string(),
                    status: EventStatus::Processing,
                    payload_snapshot,
                    attempts: 1,
                    retryable: false,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                };
                self.put_external_event(&record)?;
                Ok(EventClaim::Claimed(record))
            }
        }
    }

    /// Overwrite idempotency record
    pub fn put_external_event(&self, record: &ExternalEventRecord) -> Result<()> {
        let cf = self.cf_handle(CF_EXTERNAL_EVENTS)?;
        let value = bincode::serialize(record)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, record.external_event_id.as_bytes(), &value);
        self.write(batch)
    }

    // Session operations

    /// Put metered session
    pub fn put_session(&self, session: &MeteredSession) -> Result<()> {
        let cf = self.cf_handle(CF_SESSIONS)?;
        let value = bincode::serialize(session)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, session.session_id.as_bytes(), &value);
        self.write(batch)
    }

    /// Get metered session
    pub fn get_session(&self, session_id: &Uuid) -> Result<Option<MeteredSession>> {
        let cf = self.cf_handle(CF_SESSIONS)?;
        match self.db.get_cf(cf, session_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Sessions currently in `state`
    pub fn sessions_in_state(&self, state: SessionState) -> Result<Vec<MeteredSession>> {
        let cf = self.cf_handle(CF_SESSIONS)?;
        let mut sessions = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let session: MeteredSession = bincode::deserialize(&value)?;
            if session.state == state {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    // Reconciliation report operations

    /// Persist reconciliation report
    pub fn put_report(&self, report: &ReconciliationReport) -> Result<()> {
        let cf = self.cf_handle(CF_SNAPSHOTS)?;
        let mut key = report
            .snapshot
            .created_at
            .timestamp_millis()
            .max(0)
            .to_be_bytes()
            .to_vec();
        key.extend_from_slice(report.snapshot.snapshot_id.as_bytes());
        let value = bincode::serialize(report)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, &key, &value);
        self.write(batch)?;

        tracing::debug!(snapshot_id = %report.snapshot.snapshot_id, "Reconciliation report stored");
        Ok(())
    }

    /// Most recent reports, newest first
    pub fn recent_reports(&self, limit: usize) -> Result<Vec<ReconciliationReport>> {
        let cf = self.cf_handle(CF_SNAPSHOTS)?;
        let mut reports = Vec::with_capacity(limit.min(64));
        for item in self.db.iterator_cf(cf, IteratorMode::End).take(limit) {
            let (_, value) = item?;
            reports.push(bincode::deserialize(&value)?);
        }
        Ok(reports)
    }

    /// Latest report
    pub fn latest_report(&self) -> Result<Option<ReconciliationReport>> {
        Ok(self.recent_reports(1)?.into_iter().next())
    }

    // Index key helpers

    fn index_key_account(account_id: &AccountId, sequence: Option<u64>) -> Vec<u8> {
        // Length prefix keeps one account's prefix from matching another's
        let id = account_id.as_str().as_bytes();
        let mut key = Vec::with_capacity(4 + id.len() + 8);
        key.extend_from_slice(&(id.len() as u32).to_be_bytes());
        key.extend_from_slice(id);
        if let Some(seq) = sequence {
            key.extend_from_slice(&seq.to_be_bytes());
        }
        key
    }

    fn index_key_ref(ref_id: &Uuid, sequence: Option<u64>) -> Vec<u8> {
        let mut key = ref_id.as_bytes().to_vec();
        if let Some(seq) = sequence {
            key.extend_from_slice(&seq.to_be_bytes());
        }
        key
    }

    fn decode_sequence(bytes: &[u8]) -> Result<u64> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Error::Storage(format!("Malformed sequence key of {} bytes", bytes.len())))?;
        Ok(u64::from_be_bytes(raw))
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            last_sequence: self.sequence.load(Ordering::SeqCst),
            approximate_accounts: self.approximate_count(self.cf_handle(CF_ACCOUNTS)?)?,
            approximate_external_events: self
                .approximate_count(self.cf_handle(CF_EXTERNAL_EVENTS)?)?,
            approximate_sessions: self.approximate_count(self.cf_handle(CF_SESSIONS)?)?,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Highest allocated entry sequence
    pub last_sequence: u64,
    /// Estimated account rows
    pub approximate_accounts: u64,
    /// Estimated idempotency records
    pub approximate_external_events: u64,
    /// Estimated sessions
    pub approximate_sessions: u64,
}
