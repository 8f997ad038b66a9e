//! Quota Ledger: per-user token balances and the admission rules on top.
//!
//! Users without a recorded balance are untracked and never refused.

use std::sync::Arc;

use jokbo_core::error::CoreError;
use jokbo_core::mode::ModelTier;
use jokbo_core::quota::{QuotaPolicy, TokenRates};

use crate::store::JobStore;

/// A charge taken at job start, kept so it can be refunded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Debit {
    pub user_id: String,
    pub amount: i64,
    /// Balance right after the charge.
    pub balance: i64,
}

#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn JobStore>,
    policy: QuotaPolicy,
    rates: TokenRates,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn JobStore>, policy: QuotaPolicy, rates: TokenRates) -> Self {
        Self {
            store,
            policy,
            rates,
        }
    }

    pub fn policy(&self) -> QuotaPolicy {
        self.policy
    }

    pub fn rates(&self) -> TokenRates {
        self.rates
    }

    pub async fn get_balance(&self, user_id: &str) -> Result<Option<i64>, CoreError> {
        self.store.get_balance(user_id).await
    }

    pub async fn set_balance(&self, user_id: &str, amount: i64) -> Result<(), CoreError> {
        self.store.set_balance(user_id, amount).await?;
        tracing::info!(user_id, balance = amount, "Quota balance set");
        Ok(())
    }

    /// Atomic increment. Returns the new balance.
    pub async fn add_delta(&self, user_id: &str, delta: i64) -> Result<i64, CoreError> {
        let balance = self.store.add_balance(user_id, delta).await?;
        tracing::debug!(user_id, delta, balance, "Quota balance adjusted");
        Ok(balance)
    }

    /// Advisory pre-check before a job is created.
    ///
    /// Only an exhausted tracked balance refuses. A failed read propagates.
    pub async fn check_admission(&self, user_id: &str) -> Result<(), CoreError> {
        if self.policy == QuotaPolicy::Disabled {
            return Ok(());
        }
        match self.store.get_balance(user_id).await? {
            Some(balance) if !self.policy.admits(balance) => Err(CoreError::QuotaExhausted {
                user_id: user_id.to_string(),
                balance,
            }),
            _ => Ok(()),
        }
    }

    /// Charge `units` units at `tier`.
    ///
    /// `None` for untracked users. If the charge leaves a balance the policy
    /// rejects, it is refunded and `QuotaExhausted` returned.
    pub async fn debit(
        &self,
        user_id: &str,
        tier: ModelTier,
        units: u32,
    ) -> Result<Option<Debit>, CoreError> {
        if self.store.get_balance(user_id).await?.is_none() {
            return Ok(None);
        }
        let amount = self.rates.cost(tier, units);
        let balance = self.store.add_balance(user_id, -amount).await?;

        if !self.policy.accepts_after_debit(balance) {
            let debit = Debit {
                user_id: user_id.to_string(),
                amount,
                balance,
            };
            self.refund(&debit).await;
            return Err(CoreError::QuotaExhausted {
                user_id: user_id.to_string(),
                balance: balance.saturating_add(amount),
            });
        }

        tracing::info!(user_id, amount, balance, "Quota debited");
        Ok(Some(Debit {
            user_id: user_id.to_string(),
            amount,
            balance,
        }))
    }

    /// Give a charge back. Best-effort.
    pub async fn refund(&self, debit: &Debit) {
        match self.store.add_balance(&debit.user_id, debit.amount).await {
            Ok(balance) => {
                tracing::info!(user_id = %debit.user_id, amount = debit.amount, balance, "Quota refunded");
            }
            Err(e) => {
                tracing::error!(user_id = %debit.user_id, amount = debit.amount, error = %e, "Quota refund failed");
            }
        }
    }
}
