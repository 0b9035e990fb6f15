use crate::error::ChainError;
use crate::transaction::{AccountId, Amount, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::chain::{Block, Payload};

/// Balance table derived from the chain.
///
/// Never persisted on its own: it is always the left fold of transaction
/// application over `blocks[1..]`, starting from the configured seed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    pub balances: BTreeMap<AccountId, Amount>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: impl IntoIterator<Item = (AccountId, Amount)>) -> Self {
        Self {
            balances: seed.into_iter().collect(),
        }
    }

    /// Rebuild balances from scratch by replaying every transaction in `blocks`.
    pub fn replay(seed: &LedgerState, blocks: &[Block]) -> Result<Self, ChainError> {
        let mut state = seed.clone();
        for block in blocks.iter().skip(1) {
            if let Payload::Transactions(transactions) = &block.payload {
                state.execute(transactions).map_err(|e| {
                    ChainError::InvalidBlock(format!(
                        "Replay failed at block {}: {}",
                        block.index, e
                    ))
                })?;
            }
        }
        Ok(state)
    }

    pub fn get_balance(&self, account: &str) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    pub fn total_supply(&self) -> Amount {
        self.balances.values().sum()
    }

    /// Apply a batch in order. Stops at the first failing transaction, leaving
    /// the preceding ones applied; callers that need atomicity run this on a copy
    /// (see [`crate::transaction::validate_transactions`]).
    pub fn execute(&mut self, transactions: &[Transaction]) -> Result<(), ChainError> {
        for tx in transactions {
            self.apply_transaction(tx)?;
        }
        Ok(())
    }

    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), ChainError> {
        tx.validate_shape()?;
        let amount = tx.amount();

        if let Some(debited) = tx.debited_account() {
            let available = self.get_balance(debited);
            if available < amount {
                return Err(ChainError::InsufficientFunds(format!(
                    "{} has {} but needs {}",
                    debited, available, amount
                )));
            }
            *self.balances.entry(debited.to_string()).or_insert(0) -= amount;
        }

        if let Some(credited) = tx.credited_account() {
            let balance = self.balances.entry(credited.to_string()).or_insert(0);
            *balance = balance.checked_add(amount).ok_or_else(|| {
                ChainError::MalformedInput(format!("Balance overflow for {}", credited))
            })?;
        }

        Ok(())
    }
}
