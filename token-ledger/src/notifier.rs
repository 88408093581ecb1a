//! Best-effort notification fan-out
//!
//! The ledger publishes balance changes, session endings and reconciliation
//! failures to a [`NotificationSink`]. Delivery never affects ledger
//! correctness: publishing is non-blocking and drops on backpressure.
//!
//! ```text
//! ┌────────────────────┐  try_send   ┌──────────────────────┐  broadcast  ┌─────────────┐
//! │ Ledger / Scheduler │ ──────────▶ │ NotifierActor (task) │ ──────────▶ │ subscribers │
//! │  (NotifierHandle)  │  bounded    │                      │             │ (push, ops) │
//! └────────────────────┘  mailbox    └──────────────────────┘             └─────────────┘
//! ```

use crate::types::{AccountId, EndReason, EntryType};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

/// Outbound event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// Emitted after every committed ledger entry
    BalanceChanged {
        /// Account
        account_id: AccountId,
        /// Balance after the entry
        balance_after: u64,
        /// Signed delta
        delta: i64,
        /// Entry type
        entry_type: EntryType,
    },

    /// A metered session ended; the call resource should be torn down
    SessionEnded {
        /// Session
        session_id: Uuid,
        /// Payer
        payer_id: AccountId,
        /// Payee
        payee_id: AccountId,
        /// Why
        reason: EndReason,
    },

    /// Reconciliation reported `failed`
    ReconciliationFailed {
        /// Snapshot
        snapshot_id: Uuid,
        /// Discrepancy
        discrepancy: i64,
        /// Unbalanced ref ids
        unbalanced_pairs: u64,
    },
}

/// Fire-and-forget notification sink
pub trait NotificationSink: Send + Sync + std::fmt::Debug {
    /// Publish without blocking; failures are the sink's problem
    fn publish(&self, notification: Notification);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn publish(&self, _notification: Notification) {}
}

/// Message sent to the notifier actor
enum NotifierMessage {
    /// Fan out a notification
    Publish(Notification),

    /// Register a subscriber
    Subscribe {
        response: oneshot::Sender<broadcast::Receiver<Notification>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that fans notifications out to subscribers
struct NotifierActor {
    mailbox: mpsc::Receiver<NotifierMessage>,
    subscribers: broadcast::Sender<Notification>,
    delivered: u64,
}

impl NotifierActor {
    async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                NotifierMessage::Publish(notification) => {
                    // No subscribers is not an error
                    if self.subscribers.send(notification).is_ok() {
                        self.delivered += 1;
                    }
                }
                NotifierMessage::Subscribe { response } => {
                    let _ = response.send(self.subscribers.subscribe());
                }
                NotifierMessage::Shutdown => break,
            }
        }

        tracing::debug!(delivered = self.delivered, "Notifier stopped");
    }
}

/// Handle for publishing to the notifier actor
#[derive(Debug, Clone)]
pub struct NotifierHandle {
    sender: mpsc::Sender<NotifierMessage>,
}

impl NotifierHandle {
    /// Subscribe to all subsequent notifications
    pub async fn subscribe(&self) -> Result<BroadcastStream<Notification>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(NotifierMessage::Subscribe { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Notifier mailbox closed".to_string()))?;

        let receiver = rx
            .await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?;
        Ok(BroadcastStream::new(receiver))
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(NotifierMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Notifier mailbox closed".to_string()))?;
        Ok(())
    }
}

impl NotificationSink for NotifierHandle {
    fn publish(&self, notification: Notification) {
        if let Err(e) = self.sender.try_send(NotifierMessage::Publish(notification)) {
            tracing::warn!("Dropping notification: {}", e);
        }
    }
}

/// Spawn the notifier actor
pub fn spawn_notifier(buffer: usize) -> NotifierHandle {
    let buffer = buffer.max(1);
    let (tx, rx) = mpsc::channel(buffer); // Bounded channel for backpressure
    let (subscribers, _) = broadcast::channel(buffer);
    let actor = NotifierActor {
        mailbox: rx,
        subscribers,
        delivered: 0,
    };

    tokio::spawn(actor.run());

    NotifierHandle { sender: tx }
}
