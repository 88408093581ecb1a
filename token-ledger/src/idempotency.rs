//! External event deduplication
//!
//! Payment-provider callbacks may be delivered any number of times. Each
//! external event id is claimed exactly once; later arrivals observe the
//! stored record instead of mutating balances again. A claim whose effect
//! failed transiently is marked retryable and may be re-claimed.

use crate::{
    metrics::Metrics,
    storage::EventClaim,
    types::{EventStatus, ExternalEventRecord},
    Error, Result, Storage,
};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;

/// Outcome of an idempotent operation
#[derive(Debug, Clone)]
pub enum Processed<T> {
    /// First delivery; the effect ran and committed
    Applied(T),

    /// Event already seen; nothing was mutated
    Duplicate(ExternalEventRecord),
}

impl<T> Processed<T> {
    /// Whether this delivery was skipped
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Processed::Duplicate(_))
    }

    /// Applied value, if any
    pub fn applied(self) -> Option<T> {
        match self {
            Processed::Applied(value) => Some(value),
            Processed::Duplicate(_) => None,
        }
    }
}

/// Claims external event ids before their effect runs
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    storage: Arc<Storage>,
    metrics: Metrics,
}

impl IdempotencyGuard {
    /// Create guard over a store
    pub fn new(storage: Arc<Storage>, metrics: Metrics) -> Self {
        Self { storage, metrics }
    }

    /// Run `effect` once per `external_event_id`
    ///
    /// The record is `processing` while the effect runs, then `completed` or
    /// `failed`. A failed record is only re-claimable when the error was
    /// transient.
    pub async fn process_once<T, F, Fut>(
        &self,
        external_event_id: &str,
        payload: &serde_json::Value,
        effect: F,
    ) -> Result<Processed<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if external_event_id.is_empty() {
            return Err(Error::InvalidRequest(
                "external event id must not be empty".to_string(),
            ));
        }

        let mut record = match self
            .storage
            .claim_external_event(external_event_id, payload.to_string())?
        {
            EventClaim::Claimed(record) => record,
            EventClaim::Reclaimed(record) => {
                tracing::info!(
                    external_event_id,
                    attempts = record.attempts,
                    "Retrying previously failed external event"
                );
                record
            }
            EventClaim::Existing(record) => {
                tracing::info!(
                    external_event_id,
                    status = ?record.status,
                    "Duplicate external event skipped"
                );
                self.metrics.record_duplicate();
                return Ok(Processed::Duplicate(record));
            }
        };

        match effect().await {
            Ok(value) => {
                record.status = EventStatus::Completed;
                record.last_error = None;
                record.updated_at = Utc::now();
                // Balances already moved; a stuck `processing` record still
                // blocks redelivery, so the commit stands.
                if let Err(e) = self.storage.put_external_event(&record) {
                    tracing::error!(external_event_id, "Failed to mark event completed: {}", e);
                }
                Ok(Processed::Applied(value))
            }
            Err(e) => {
                record.status = EventStatus::Failed;
                record.retryable = e.is_transient();
                record.last_error = Some(e.to_string());
                record.updated_at = Utc::now();
                if let Err(mark_err) = self.storage.put_external_event(&record) {
                    tracing::error!(
                        external_event_id,
                        "Failed to mark event failed: {}",
                        mark_err
                    );
                }
                tracing::warn!(
                    external_event_id,
                    retryable = record.retryable,
                    "External event failed: {}",
                    e
                );
                Err(e)
            }
        }
    }
}
