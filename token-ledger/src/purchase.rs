//! Issuance and burn entry points
//!
//! Purchases and refunds arrive from the payment collaborator and are routed
//! through the idempotency guard. Admin adjustments are operator-issued
//! compensating entries and carry a mandatory reason.

use crate::{
    idempotency::Processed,
    types::{AccountId, ApplyOptions, ApplyOutcome, EntryType, PurchaseConfirmation},
    Error, Ledger, Result,
};
use serde_json::json;

impl Ledger {
    /// Credit purchased tokens exactly once per payment event
    pub async fn credit_purchase(
        &self,
        confirmation: &PurchaseConfirmation,
    ) -> Result<Processed<ApplyOutcome>> {
        let payload = serde_json::to_value(confirmation)?;

        self.idempotency()
            .process_once(&confirmation.external_event_id, &payload, || async move {
                let delta = positive_delta(confirmation.token_amount)?;
                let outcome = self
                    .apply_delta(
                        &confirmation.account_id,
                        delta,
                        EntryType::Purchase,
                        ApplyOptions::external(confirmation.external_event_id.clone()),
                    )
                    .await?;

                tracing::info!(
                    account_id = %confirmation.account_id,
                    external_event_id = %confirmation.external_event_id,
                    tokens = confirmation.token_amount,
                    usd = %confirmation.usd_amount,
                    balance_after = outcome.balance_after,
                    "Purchase credited"
                );
                Ok(outcome)
            })
            .await
    }

    /// Burn refunded tokens exactly once per payment event
    ///
    /// Fails with `InsufficientBalance` if the tokens were already spent.
    pub async fn refund(
        &self,
        external_event_id: &str,
        account_id: &AccountId,
        amount: u64,
    ) -> Result<Processed<ApplyOutcome>> {
        let payload = json!({
            "kind": "refund",
            "external_event_id": external_event_id,
            "account_id": account_id,
            "amount": amount,
        });

        self.idempotency()
            .process_once(external_event_id, &payload, || async move {
                let delta = positive_delta(amount)?;
                let outcome = self
                    .apply_delta(
                        account_id,
                        -delta,
                        EntryType::Refund,
                        ApplyOptions::external(external_event_id),
                    )
                    .await?;

                tracing::info!(
                    %account_id,
                    external_event_id,
                    amount,
                    balance_after = outcome.balance_after,
                    "Refund burned"
                );
                Ok(outcome)
            })
            .await
    }

    /// Append a compensating entry
    pub async fn admin_adjust(
        &self,
        account_id: &AccountId,
        delta: i64,
        reason: &str,
    ) -> Result<ApplyOutcome> {
        if reason.trim().is_empty() {
            return Err(Error::InvalidRequest(
                "admin adjustment requires a reason".to_string(),
            ));
        }

        let outcome = self
            .apply_delta(
                account_id,
                delta,
                EntryType::AdminAdjust,
                ApplyOptions {
                    memo: Some(reason.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        tracing::warn!(
            %account_id,
            delta,
            reason,
            balance_after = outcome.balance_after,
            "Admin adjustment applied"
        );
        Ok(outcome)
    }
}

fn positive_delta(amount: u64) -> Result<i64> {
    match i64::try_from(amount) {
        Ok(delta) if delta > 0 => Ok(delta),
        _ => Err(Error::InvalidRequest(format!(
            "token amount {} must be positive and at most {}",
            amount,
            i64::MAX
        ))),
    }
}
