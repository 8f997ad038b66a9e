//! Quota admission policy and per-unit token cost.
//!
//! Balances live in the store. This module holds the rules only.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::mode::ModelTier;

/// How the ledger gates admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPolicy {
    /// Balances are tracked but never refuse work.
    Disabled,
    /// Work is refused once the balance would drop below zero.
    #[default]
    RequirePositive,
}

impl QuotaPolicy {
    /// Advisory pre-check made at job creation.
    pub fn admits(self, balance: i64) -> bool {
        match self {
            QuotaPolicy::Disabled => true,
            QuotaPolicy::RequirePositive => balance > 0,
        }
    }

    /// Whether a balance left after a debit is acceptable.
    pub fn accepts_after_debit(self, balance: i64) -> bool {
        match self {
            QuotaPolicy::Disabled => true,
            QuotaPolicy::RequirePositive => balance >= 0,
        }
    }
}

impl FromStr for QuotaPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(QuotaPolicy::Disabled),
            "require_positive" | "require-positive" => Ok(QuotaPolicy::RequirePositive),
            other => Err(CoreError::Validation(format!(
                "Unsupported quota policy: \"{other}\""
            ))),
        }
    }
}

/// Tokens charged per analysed unit, by model tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRates {
    pub flash: i64,
    pub pro: i64,
}

impl Default for TokenRates {
    fn default() -> Self {
        Self { flash: 1, pro: 4 }
    }
}

impl TokenRates {
    pub fn per_unit(&self, tier: ModelTier) -> i64 {
        match tier {
            ModelTier::Flash => self.flash,
            ModelTier::Pro => self.pro,
        }
    }

    /// Total charge for `units` units at `tier`.
    pub fn cost(&self, tier: ModelTier, units: u32) -> i64 {
        self.per_unit(tier).saturating_mul(i64::from(units))
    }
}
