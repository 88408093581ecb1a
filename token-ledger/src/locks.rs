//! Per-account row locks
//!
//! Mutations to one account are serialized; mutations to different accounts
//! run in parallel. Multi-account operations take their locks in sorted
//! account-id order so opposite-direction transfers cannot deadlock.
//!
//! Ref ids are claimed separately: postings on disjoint accounts share no
//! row lock, so a fresh ref id is held in [`RefClaims`] from the reuse check
//! until its batch commits.

use crate::{types::AccountId, Error, Result};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Lock table keyed by account id
#[derive(Debug)]
pub struct AccountLocks {
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
    timeout: Duration,
}

/// Guards held for the duration of one ledger transaction
///
/// Dropping the set releases the rows and evicts table entries nobody else
/// is waiting on.
#[derive(Debug)]
pub struct LockSet<'a> {
    table: &'a AccountLocks,
    accounts: Vec<AccountId>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for LockSet<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        self.table.evict_idle(&self.accounts);
    }
}

impl AccountLocks {
    /// Create lock table with a bounded wait
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    fn lock_for(&self, account_id: &AccountId) -> Arc<Mutex<()>> {
        self.locks
            .entry(account_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire every lock in `accounts` in sorted order
    ///
    /// Fails with `TransientStore` if the whole set is not held within the
    /// configured timeout; locks taken so far are released on failure.
    pub async fn acquire(&self, accounts: &BTreeSet<AccountId>) -> Result<LockSet<'_>> {
        let acquire_all = async {
            let mut guards = Vec::with_capacity(accounts.len());
            for account_id in accounts {
                guards.push(self.lock_for(account_id).lock_owned().await);
            }
            guards
        };

        match tokio::time::timeout(self.timeout, acquire_all).await {
            Ok(guards) => Ok(LockSet {
                table: self,
                accounts: accounts.iter().cloned().collect(),
                guards,
            }),
            Err(_) => {
                let accounts: Vec<AccountId> = accounts.iter().cloned().collect();
                self.evict_idle(&accounts);
                tracing::warn!(
                    accounts = accounts.len(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Account lock wait timed out"
                );
                Err(Error::TransientStore(format!(
                    "lock wait exceeded {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }

    // The table's own Arc is the only reference once no guard or waiter
    // remains; `remove_if` checks that under the shard lock.
    fn evict_idle(&self, accounts: &[AccountId]) {
        for account_id in accounts {
            self.locks
                .remove_if(account_id, |_, lock| Arc::strong_count(lock) == 1);
        }
    }

    /// Number of accounts currently locked or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no account is locked or waited on
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Ref ids with a posting in flight
#[derive(Debug, Default)]
pub struct RefClaims {
    claimed: parking_lot::Mutex<HashSet<Uuid>>,
}

/// Held ref id, released on drop
#[derive(Debug)]
pub struct RefClaim<'a> {
    claims: &'a RefClaims,
    ref_id: Uuid,
}

impl Drop for RefClaim<'_> {
    fn drop(&mut self) {
        self.claims.claimed.lock().remove(&self.ref_id);
    }
}

impl RefClaims {
    /// Create empty claim set
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `ref_id`; fails if another posting already holds it
    pub fn claim(&self, ref_id: Uuid) -> Result<RefClaim<'_>> {
        if !self.claimed.lock().insert(ref_id) {
            return Err(Error::InvalidRequest(format!(
                "ref id {} is already being posted",
                ref_id
            )));
        }
        Ok(RefClaim {
            claims: self,
            ref_id,
        })
    }

    /// Number of ref ids in flight
    pub fn len(&self) -> usize {
        self.claimed.lock().len()
    }

    /// Whether no ref id is in flight
    pub fn is_empty(&self) -> bool {
        self.claimed.lock().is_empty()
    }
}
