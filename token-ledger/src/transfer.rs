//! Two-leg transfers
//!
//! A transfer debits the sender and credits the recipient under one ref id,
//! in one commit. Either both legs exist or neither does.

use crate::{
    ledger::{EntryMeta, Posting},
    types::{TransferReceipt, TransferRequest},
    Error, Ledger, Result,
};
use uuid::Uuid;

impl Ledger {
    /// Move tokens between two accounts
    ///
    /// The sender is debited `amount`; the recipient is credited
    /// `amount - fee`. Fails with `InsufficientBalance` if the sender cannot
    /// cover `amount`, leaving both balances untouched.
    pub async fn transfer(&self, request: TransferRequest) -> Result<TransferReceipt> {
        validate(&request)?;

        let ref_id = request.ref_id.unwrap_or_else(Uuid::now_v7);
        let debit = i64::try_from(request.amount).map_err(|_| {
            Error::InvalidRequest(format!("amount {} out of range", request.amount))
        })?;
        // fee < amount, so the credit is positive and fits
        let credit = debit - request.fee as i64;

        let postings = [
            Posting {
                account_id: request.sender.clone(),
                delta: -debit,
                entry_type: request.kind.debit_type(),
            },
            Posting {
                account_id: request.recipient.clone(),
                delta: credit,
                entry_type: request.kind.credit_type(),
            },
        ];
        let meta = EntryMeta {
            ref_id: Some(ref_id),
            fee: request.fee,
            fresh_ref: true,
            ..Default::default()
        };

        let mut entries = self
            .post(&postings, meta, request.session_update.as_ref())
            .await?;

        let (credit, debit) = match (entries.pop(), entries.pop()) {
            (Some(credit), Some(debit)) if entries.is_empty() => (credit, debit),
            _ => {
                return Err(Error::TransferIntegrity(format!(
                    "transfer {} did not produce two legs",
                    ref_id
                )))
            }
        };

        tracing::info!(
            %ref_id,
            sender = %request.sender,
            recipient = %request.recipient,
            amount = request.amount,
            fee = request.fee,
            kind = ?request.kind,
            "Transfer committed"
        );

        Ok(TransferReceipt {
            ref_id,
            debit,
            credit,
        })
    }

    /// Load a committed transfer and check that its legs balance
    pub fn verify_transfer(&self, ref_id: &Uuid) -> Result<TransferReceipt> {
        let mut entries = self.entries_for_ref(ref_id)?;
        if entries.len() != 2 {
            return Err(Error::TransferIntegrity(format!(
                "ref id {} has {} entries",
                ref_id,
                entries.len()
            )));
        }
        entries.sort_by_key(|e| e.delta);

        let credit = entries.pop();
        let debit = entries.pop();
        let (debit, credit) = match (debit, credit) {
            (Some(debit), Some(credit)) => (debit, credit),
            _ => return Err(Error::TransferIntegrity(format!("ref id {} is empty", ref_id))),
        };

        let sum = debit.delta as i128 + credit.delta as i128;
        if debit.fee != credit.fee || sum != -(debit.fee as i128) {
            return Err(Error::TransferIntegrity(format!(
                "ref id {} legs sum to {} with fee {}",
                ref_id, sum, debit.fee
            )));
        }

        Ok(TransferReceipt {
            ref_id: *ref_id,
            debit,
            credit,
        })
    }
}

fn validate(request: &TransferRequest) -> Result<()> {
    if request.amount == 0 {
        return Err(Error::InvalidRequest(
            "transfer amount must be positive".to_string(),
        ));
    }
    if request.sender == request.recipient {
        return Err(Error::InvalidRequest(format!(
            "cannot transfer from {} to itself",
            request.sender
        )));
    }
    if request.fee >= request.amount {
        return Err(Error::InvalidRequest(format!(
            "fee {} must be below amount {}",
            request.fee, request.amount
        )));
    }
    Ok(())
}
