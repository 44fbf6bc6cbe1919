use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_CREDIT_GRANT;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Add purchased credits (payment collaborator entry point). Returns the
    /// new balance.
    pub async fn grant_credits(&self, student_id: Ulid, amount: u32, note: Option<String>) -> Result<u32, EngineError> {
        if amount == 0 {
            return Err(EngineError::Invalid("credit grant must be positive"));
        }
        if amount > MAX_CREDIT_GRANT {
            return Err(EngineError::LimitExceeded("credit grant too large"));
        }

        let mut txn = self.begin().await?;
        txn.lock_account_or_create(student_id).await?;
        let at = txn.now();
        txn.stage(Event::CreditsAdjusted {
            student_id,
            entry: CreditEntry {
                at,
                delta: amount as i64,
                reason: CreditReason::Grant,
                class_id: None,
                note,
            },
        });
        let balance = txn.commit_then(|t| t.credits()).await?;
        info!(%student_id, amount, balance, "credits granted");
        Ok(balance)
    }

    pub async fn credit_balance(&self, student_id: Ulid) -> u32 {
        match self.store.account(&student_id) {
            Some(shared) => shared.read().await.credits,
            None => 0,
        }
    }

    /// Unused makeup entitlements from teacher cancellations.
    pub async fn makeup_balance(&self, student_id: Ulid) -> u32 {
        match self.store.account(&student_id) {
            Some(shared) => shared.read().await.makeup_credits,
            None => 0,
        }
    }

    pub async fn credit_ledger(&self, student_id: Ulid) -> Vec<CreditEntry> {
        match self.store.account(&student_id) {
            Some(shared) => shared.read().await.ledger.clone(),
            None => Vec::new(),
        }
    }
}
