//! Metering scheduler
//!
//! Charges pay-per-minute sessions one block at a time:
//!
//! ```text
//! active --tick ok--> active
//! active --tick, payer short--> ended (insufficient_balance)
//! active <--pause/resume--> paused
//! active | paused --end--> ended (explicit)
//! ```
//!
//! Each tick commits the transfer and the updated session row in one ledger
//! batch, so a session is never charged twice for the same block.

use crate::{
    config::MeteringConfig,
    types::{TickOutcome, TickSummary},
    Error, Result,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use token_ledger::{
    AccountId, EndReason, Ledger, MeteredSession, Notification, NotificationSink, SessionState,
    TransferKind, TransferRequest,
};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Periodic biller for metered sessions
pub struct MeteringScheduler {
    ledger: Arc<Ledger>,
    config: MeteringConfig,
    block_interval: chrono::Duration,
    due_after: chrono::Duration,
    sink: Arc<dyn NotificationSink>,
    session_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for MeteringScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteringScheduler")
            .field("config", &self.config)
            .field("sink", &self.sink)
            .finish()
    }
}

impl MeteringScheduler {
    /// Create scheduler over a ledger
    pub fn new(
        ledger: Arc<Ledger>,
        config: MeteringConfig,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        if config.block_interval_secs == 0 {
            return Err(Error::Config("block interval must be positive".to_string()));
        }
        if config.tick_slack() >= config.block_interval() {
            return Err(Error::Config("tick slack must be shorter than a block".to_string()));
        }
        let block_interval = chrono::Duration::from_std(config.block_interval())
            .map_err(|e| Error::Config(format!("Invalid block interval: {}", e)))?;
        let tick_slack = chrono::Duration::from_std(config.tick_slack())
            .map_err(|e| Error::Config(format!("Invalid tick slack: {}", e)))?;

        Ok(Self {
            ledger,
            config,
            block_interval,
            due_after: block_interval - tick_slack,
            sink,
            session_locks: DashMap::new(),
        })
    }

    fn lock_for(&self, session_id: &Uuid) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(*session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn lock_session(&self, session_id: &Uuid) -> OwnedMutexGuard<()> {
        self.lock_for(session_id).lock_owned().await
    }

    fn load(&self, session_id: &Uuid) -> Result<MeteredSession> {
        self.ledger
            .storage()
            .get_session(session_id)?
            .ok_or(Error::SessionNotFound(*session_id))
    }

    fn transition(session: &MeteredSession, to: SessionState) -> Result<()> {
        if session.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                session_id: session.session_id,
                from: session.state,
                to,
            })
        }
    }

    /// Get session
    pub fn session(&self, session_id: &Uuid) -> Result<MeteredSession> {
        self.load(session_id)
    }

    /// Open a session; the first block is billed one interval from now
    pub async fn start_metering(
        &self,
        payer_id: AccountId,
        payee_id: AccountId,
        rate_per_block: u64,
    ) -> Result<MeteredSession> {
        if rate_per_block == 0 {
            return Err(Error::InvalidRequest(
                "rate per block must be positive".to_string(),
            ));
        }
        if payer_id == payee_id {
            return Err(Error::InvalidRequest(format!(
                "{} cannot meter a session with itself",
                payer_id
            )));
        }

        let now = Utc::now();
        let session = MeteredSession {
            session_id: Uuid::now_v7(),
            payer_id,
            payee_id,
            rate_per_block,
            state: SessionState::Active,
            last_metered_at: now,
            blocks_charged: 0,
            total_charged: 0,
            started_at: now,
            ended_at: None,
            end_reason: None,
        };
        self.ledger.storage().put_session(&session)?;

        info!(
            session_id = %session.session_id,
            payer_id = %session.payer_id,
            payee_id = %session.payee_id,
            rate_per_block,
            "Metering started"
        );
        Ok(session)
    }

    /// Suspend ticking
    pub async fn pause_metering(&self, session_id: &Uuid) -> Result<MeteredSession> {
        let _guard = self.lock_session(session_id).await;
        let mut session = self.load(session_id)?;
        Self::transition(&session, SessionState::Paused)?;

        session.state = SessionState::Paused;
        self.ledger.storage().put_session(&session)?;

        info!(session_id = %session_id, "Metering paused");
        Ok(session)
    }

    /// Resume ticking; paused time is not billed
    pub async fn resume_metering(&self, session_id: &Uuid) -> Result<MeteredSession> {
        let _guard = self.lock_session(session_id).await;
        let mut session = self.load(session_id)?;
        Self::transition(&session, SessionState::Active)?;

        session.state = SessionState::Active;
        session.last_metered_at = Utc::now();
        self.ledger.storage().put_session(&session)?;

        info!(session_id = %session_id, "Metering resumed");
        Ok(session)
    }

    /// End a session explicitly
    pub async fn end_metering(&self, session_id: &Uuid) -> Result<MeteredSession> {
        let _guard = self.lock_session(session_id).await;
        let mut session = self.load(session_id)?;
        Self::transition(&session, SessionState::Ended)?;

        Self::mark_ended(&mut session, EndReason::Explicit, Utc::now());
        self.ledger.storage().put_session(&session)?;
        self.session_locks.remove(session_id);

        info!(
            session_id = %session_id,
            blocks_charged = session.blocks_charged,
            total_charged = session.total_charged,
            "Metering ended"
        );
        Ok(session)
    }

    fn mark_ended(session: &mut MeteredSession, reason: EndReason, now: DateTime<Utc>) {
        session.state = SessionState::Ended;
        session.ended_at = Some(now);
        session.end_reason = Some(reason);
    }

    // Passes wake a few ms late by varying amounts, so a strict
    // `>= block_interval` would skip every block whose pass woke earlier
    // than the one before it.
    fn is_due(&self, session: &MeteredSession, now: DateTime<Utc>) -> bool {
        session.state == SessionState::Active && now - session.last_metered_at >= self.due_after
    }

    /// Tick a session at the current time
    pub async fn meter_tick(&self, session_id: &Uuid) -> Result<TickOutcome> {
        self.meter_tick_at(session_id, Utc::now()).await
    }

    /// Tick a session as of `now`
    ///
    /// Charges one block if the session is active and a block, less the
    /// configured tick slack, has elapsed since the last charge. A tick that finds another tick in
    /// flight for the same session does nothing.
    pub async fn meter_tick_at(&self, session_id: &Uuid, now: DateTime<Utc>) -> Result<TickOutcome> {
        let _guard = match self.lock_for(session_id).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(session_id = %session_id, "Tick already in flight");
                return Ok(TickOutcome::SKIPPED);
            }
        };

        // Re-read under the lock
        let session = self.load(session_id)?;
        if !self.is_due(&session, now) {
            return Ok(TickOutcome::SKIPPED);
        }

        let mut charged = session.clone();
        charged.last_metered_at = now;
        charged.blocks_charged += 1;
        charged.total_charged = charged.total_charged.saturating_add(session.rate_per_block);

        let request = TransferRequest::new(
            session.payer_id.clone(),
            session.payee_id.clone(),
            session.rate_per_block,
            TransferKind::Call,
        )
        .with_ref_id(Uuid::now_v7())
        .with_session_update(charged);

        let policy = self.ledger.retry_policy();
        let result =
            token_ledger::retry_transient(&policy, || self.ledger.transfer(request.clone())).await;

        match result {
            Ok(receipt) => {
                self.ledger.metrics().ticks_charged_total.inc();
                debug!(
                    session_id = %session_id,
                    ref_id = %receipt.ref_id,
                    payer_balance = receipt.debit.balance_after,
                    "Block charged"
                );
                Ok(TickOutcome::CHARGED)
            }
            Err(token_ledger::Error::InsufficientBalance { balance, .. }) => {
                let mut ended = session;
                Self::mark_ended(&mut ended, EndReason::InsufficientBalance, now);
                self.ledger.storage().put_session(&ended)?;
                self.session_locks.remove(session_id);
                self.ledger.metrics().sessions_ended_total.inc();

                info!(
                    session_id = %session_id,
                    payer_id = %ended.payer_id,
                    balance,
                    rate_per_block = ended.rate_per_block,
                    "Session ended: insufficient balance"
                );
                self.sink.publish(Notification::SessionEnded {
                    session_id: ended.session_id,
                    payer_id: ended.payer_id,
                    payee_id: ended.payee_id,
                    reason: EndReason::InsufficientBalance,
                });
                Ok(TickOutcome::ENDED)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Active sessions with a block elapsed as of `now`, within the tick slack
    pub fn due_sessions(&self, now: DateTime<Utc>) -> Result<Vec<MeteredSession>> {
        Ok(self
            .ledger
            .storage()
            .sessions_in_state(SessionState::Active)?
            .into_iter()
            .filter(|session| self.is_due(session, now))
            .collect())
    }

    /// Tick every due session once
    pub async fn run_due_ticks(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let mut summary = TickSummary::default();

        for session in self.due_sessions(now)? {
            match self.meter_tick_at(&session.session_id, now).await {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    warn!(session_id = %session.session_id, "Metering tick failed: {}", e);
                    summary.record_failure();
                }
            }
        }

        if summary.examined > 0 {
            info!(
                examined = summary.examined,
                charged = summary.charged,
                ended = summary.ended,
                failed = summary.failed,
                "Metering pass complete"
            );
        }
        Ok(summary)
    }

    /// Run metering passes until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_interval_secs = self.config.tick_interval_secs,
            block_interval_secs = self.config.block_interval_secs,
            "Starting metering scheduler"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_due_ticks(Utc::now()).await {
                        warn!("Metering pass failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Metering scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use token_ledger::{ApplyOptions, EntryType, NoopSink};

    fn create_scheduler() -> (MeteringScheduler, Arc<Ledger>, TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = token_ledger::Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;

        let ledger = Arc::new(Ledger::open(config).unwrap());
        let scheduler =
            MeteringScheduler::new(ledger.clone(), MeteringConfig::default(), Arc::new(NoopSink))
                .unwrap();
        (scheduler, ledger, temp_dir)
    }

    async fn fund(ledger: &Ledger, account: &str, amount: i64) {
        ledger
            .apply_delta(
                &AccountId::new(account),
                amount,
                EntryType::Purchase,
                ApplyOptions::default(),
            )
            .await
            .unwrap();
    }

    fn block(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(30 * n)
    }

    #[tokio::test]
    async fn test_tick_charges_one_block() {
        let (scheduler, ledger, _temp) = create_scheduler();
        fund(&ledger, "payer", 100).await;

        let session = scheduler
            .start_metering(AccountId::new("payer"), AccountId::new("payee"), 10)
            .await
            .unwrap();
        let at = session.last_metered_at + block(1);

        let outcome = scheduler.meter_tick_at(&session.session_id, at).await.unwrap();
        assert_eq!(outcome, TickOutcome::CHARGED);
        assert_eq!(ledger.balance(&AccountId::new("payer")).unwrap(), 90);
        assert_eq!(ledger.balance(&AccountId::new("payee")).unwrap(), 10);

        let stored = scheduler.session(&session.session_id).unwrap();
        assert_eq!(stored.last_metered_at, at);
        assert_eq!(stored.blocks_charged, 1);
        assert_eq!(stored.total_charged, 10);

        // Same interval again is not due
        let again = scheduler.meter_tick_at(&session.session_id, at).await.unwrap();
        assert_eq!(again, TickOutcome::SKIPPED);
        assert_eq!(ledger.balance(&AccountId::new("payer")).unwrap(), 90);
    }

    #[tokio::test]
    async fn test_not_due_before_full_block() {
        let (scheduler, ledger, _temp) = create_scheduler();
        fund(&ledger, "payer", 100).await;

        let session = scheduler
            .start_metering(AccountId::new("payer"), AccountId::new("payee"), 10)
            .await
            .unwrap();
        let early = session.last_metered_at + chrono::Duration::seconds(29);

        assert!(scheduler.due_sessions(early).unwrap().is_empty());
        assert_eq!(
            scheduler.meter_tick_at(&session.session_id, early).await.unwrap(),
            TickOutcome::SKIPPED
        );
        assert_eq!(scheduler.due_sessions(early + chrono::Duration::seconds(1)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_late_wakeups_still_charge_every_block() {
        let (scheduler, ledger, _temp) = create_scheduler();
        fund(&ledger, "payer", 1_000).await;

        let session = scheduler
            .start_metering(AccountId::new("payer"), AccountId::new("payee"), 10)
            .await
            .unwrap();
        let t0 = session.last_metered_at;

        // Each pass wakes on schedule give or take a few ms
        let jitter_ms = [2, 1, 3, -1, 0, 2];
        for (n, jitter) in jitter_ms.iter().enumerate() {
            let at = t0 + block(n as i64 + 1) + chrono::Duration::milliseconds(*jitter);
            let summary = scheduler.run_due_ticks(at).await.unwrap();
            assert_eq!(summary.charged, 1, "pass {} skipped a block", n + 1);
        }

        let stored = scheduler.session(&session.session_id).unwrap();
        assert_eq!(stored.blocks_charged, 6);
        assert_eq!(ledger.balance(&AccountId::new("payer")).unwrap(), 940);
    }

    #[tokio::test]
    async fn test_ended_session_releases_lock_entry() {
        let (scheduler, ledger, _temp) = create_scheduler();
        fund(&ledger, "payer", 10).await;

        let session = scheduler
            .start_metering(AccountId::new("payer"), AccountId::new("payee"), 10)
            .await
            .unwrap();
        let t0 = session.last_metered_at;

        assert_eq!(
            scheduler.meter_tick_at(&session.session_id, t0 + block(1)).await.unwrap(),
            TickOutcome::CHARGED
        );
        assert!(scheduler.session_locks.contains_key(&session.session_id));

        assert_eq!(
            scheduler.meter_tick_at(&session.session_id, t0 + block(2)).await.unwrap(),
            TickOutcome::ENDED
        );
        assert!(scheduler.session_locks.is_empty());
    }

    #[test]
    fn test_slack_longer_than_block_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = token_ledger::Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let ledger = Arc::new(Ledger::open(config).unwrap());

        let metering = MeteringConfig {
            block_interval_secs: 1,
            tick_interval_secs: 1,
            tick_slack_ms: 1_000,
        };
        assert!(matches!(
            MeteringScheduler::new(ledger, metering, Arc::new(NoopSink)),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_tick_in_flight_is_skipped() {
        let (scheduler, ledger, _temp) = create_scheduler();
        fund(&ledger, "payer", 100).await;

        let session = scheduler
            .start_metering(AccountId::new("payer"), AccountId::new("payee"), 10)
            .await
            .unwrap();

        let _held = scheduler.lock_session(&session.session_id).await;
        let outcome = scheduler
            .meter_tick_at(&session.session_id, session.last_metered_at + block(1))
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::SKIPPED);
        assert_eq!(ledger.balance(&AccountId::new("payer")).unwrap(), 100);
    }

    #[tokio::test]
    async fn test_paused_session_not_billed() {
        let (scheduler, ledger, _temp) = create_scheduler();
        fund(&ledger, "payer", 100).await;

        let session = scheduler
            .start_metering(AccountId::new("payer"), AccountId::new("payee"), 10)
            .await
            .unwrap();
        scheduler.pause_metering(&session.session_id).await.unwrap();

        let later = session.last_metered_at + block(10);
        assert!(scheduler.due_sessions(later).unwrap().is_empty());
        assert_eq!(
            scheduler.meter_tick_at(&session.session_id, later).await.unwrap(),
            TickOutcome::SKIPPED
        );

        let resumed = scheduler.resume_metering(&session.session_id).await.unwrap();
        assert_eq!(resumed.state, SessionState::Active);
        assert!(resumed.last_metered_at >= session.last_metered_at);
        assert_eq!(ledger.balance(&AccountId::new("payer")).unwrap(), 100);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let (scheduler, _ledger, _temp) = create_scheduler();
        let session = scheduler
            .start_metering(AccountId::new("payer"), AccountId::new("payee"), 10)
            .await
            .unwrap();

        assert!(matches!(
            scheduler.resume_metering(&session.session_id).await,
            Err(Error::InvalidTransition { .. })
        ));

        let ended = scheduler.end_metering(&session.session_id).await.unwrap();
        assert_eq!(ended.end_reason, Some(EndReason::Explicit));

        for result in [
            scheduler.pause_metering(&session.session_id).await,
            scheduler.resume_metering(&session.session_id).await,
            scheduler.end_metering(&session.session_id).await,
        ] {
            assert!(matches!(result, Err(Error::InvalidTransition { .. })));
        }
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (scheduler, _ledger, _temp) = create_scheduler();
        let missing = Uuid::now_v7();
        assert!(matches!(
            scheduler.meter_tick(&missing).await,
            Err(Error::SessionNotFound(_))
        ));
        assert!(matches!(
            scheduler.end_metering(&missing).await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_validation() {
        let (scheduler, _ledger, _temp) = create_scheduler();
        assert!(scheduler
            .start_metering(AccountId::new("payer"), AccountId::new("payee"), 0)
            .await
            .is_err());
        assert!(scheduler
            .start_metering(AccountId::new("payer"), AccountId::new("payer"), 5)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_run_due_ticks_summary() {
        let (scheduler, ledger, _temp) = create_scheduler();
        fund(&ledger, "rich", 100).await;

        let rich = scheduler
            .start_metering(AccountId::new("rich"), AccountId::new("host"), 10)
            .await
            .unwrap();
        let broke = scheduler
            .start_metering(AccountId::new("broke"), AccountId::new("host"), 10)
            .await
            .unwrap();

        let at = rich.last_metered_at.max(broke.last_metered_at) + block(1);
        let summary = scheduler.run_due_ticks(at).await.unwrap();
        assert_eq!(summary.examined, 2);
        assert_eq!(summary.charged, 1);
        assert_eq!(summary.ended, 1);

        let broke = scheduler.session(&broke.session_id).unwrap();
        assert_eq!(broke.state, SessionState::Ended);
        assert_eq!(broke.end_reason, Some(EndReason::InsufficientBalance));
        assert_eq!(ledger.metrics().sessions_ended_total.get(), 1);
        assert_eq!(ledger.metrics().ticks_charged_total.get(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (scheduler, _ledger, _temp) = create_scheduler();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::new(scheduler).run(rx));
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
