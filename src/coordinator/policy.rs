//! Profitability policy for batch aggregation.

use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::U256;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::infra::{AggregatorError, Result};

/// Which profitability checker to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfitabilityCheckerType {
    /// Reward threshold with a consolidate-anyway override.
    Base,
    /// Accept every batch.
    AcceptAll,
}

impl FromStr for ProfitabilityCheckerType {
    type Err = AggregatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base" => Ok(Self::Base),
            "acceptall" | "accept_all" => Ok(Self::AcceptAll),
            other => Err(AggregatorError::Configuration(format!(
                "unknown profitability checker type: {other}"
            ))),
        }
    }
}

/// Decides whether a pending batch is worth proving right now.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProfitabilityChecker: Send + Sync {
    /// `collateral` is the reward offered for aggregating the batch and
    /// `batch_age` is the time since the batch was sequenced.
    async fn is_profitable(&self, collateral: U256, batch_age: Duration) -> Result<bool>;
}

/// Accepts a batch once the reward clears the configured threshold, or
/// unconditionally once it has waited longer than the consolidation interval.
pub struct TxProfitabilityCheckerBase {
    min_reward: U256,
    interval_after_which_consolidate_anyway: Duration,
}

impl TxProfitabilityCheckerBase {
    pub fn new(min_reward: U256, interval_after_which_consolidate_anyway: Duration) -> Self {
        Self {
            min_reward,
            interval_after_which_consolidate_anyway,
        }
    }
}

#[async_trait]
impl ProfitabilityChecker for TxProfitabilityCheckerBase {
    async fn is_profitable(&self, collateral: U256, batch_age: Duration) -> Result<bool> {
        if batch_age >= self.interval_after_which_consolidate_anyway {
            return Ok(true);
        }
        Ok(collateral >= self.min_reward)
    }
}

/// Accepts every batch.
pub struct TxProfitabilityCheckerAcceptAll;

#[async_trait]
impl ProfitabilityChecker for TxProfitabilityCheckerAcceptAll {
    async fn is_profitable(&self, _collateral: U256, _batch_age: Duration) -> Result<bool> {
        Ok(true)
    }
}
