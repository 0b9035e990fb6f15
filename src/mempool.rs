//! Pending transaction pool
//!
//! Transactions wait here until the next mined block picks them up. The pool
//! is in-memory only; pending transactions do not survive a restart.

use crate::error::ChainError;
use crate::transaction::{Amount, Transaction};

/// Hard cap on pending transactions.
pub const MAX_POOL_SIZE: usize = 10_000;

#[derive(Debug, Clone, Default)]
pub struct Mempool {
    transactions: Vec<Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a transaction after its stateless checks.
    ///
    /// `confirmed` looks up an account's balance on the chain. Withdrawals are
    /// additionally checked against the pending-aware available balance
    /// (`confirmed + pending deposits - pending withdrawals`), and any credit
    /// must fit in the credited account's confirmed balance plus everything
    /// already pending for it. Transfers are only funds-checked when mined.
    pub fn add_transaction<F>(&mut self, tx: Transaction, confirmed: F) -> Result<(), ChainError>
    where
        F: Fn(&str) -> Amount,
    {
        tx.validate_shape()?;

        if self.transactions.len() >= MAX_POOL_SIZE {
            return Err(ChainError::MalformedInput(format!(
                "Pending pool is full ({} transactions)",
                MAX_POOL_SIZE
            )));
        }

        if let Transaction::Withdrawal { account, amount } = &tx {
            let available = self.available_balance(account, confirmed(account))?;
            if available < *amount {
                return Err(ChainError::InsufficientFunds(format!(
                    "{} has {} available but wants to withdraw {}",
                    account, available, amount
                )));
            }
        }

        if let Some(credited) = tx.credited_account() {
            self.credit_ceiling(credited, confirmed(credited))?
                .checked_add(tx.amount())
                .ok_or_else(|| overflow(credited))?;
        }

        self.transactions.push(tx);
        Ok(())
    }

    pub fn available_balance(&self, account: &str, confirmed_balance: Amount) -> Result<Amount, ChainError> {
        self.transactions.iter().try_fold(confirmed_balance, |available, tx| {
            match tx {
                Transaction::Deposit { account: a, amount } if a == account => available.checked_add(*amount),
                Transaction::Withdrawal { account: a, amount } if a == account => available.checked_sub(*amount),
                _ => Some(available),
            }
            .ok_or_else(|| overflow(account))
        })
    }

    /// Balance `account` would reach if every pending credit landed and no
    /// pending debit did.
    fn credit_ceiling(&self, account: &str, confirmed_balance: Amount) -> Result<Amount, ChainError> {
        self.transactions
            .iter()
            .filter(|tx| tx.credited_account() == Some(account))
            .try_fold(confirmed_balance, |total, tx| {
                total.checked_add(tx.amount()).ok_or_else(|| overflow(account))
            })
    }

    pub fn get_all_transactions(&self) -> Vec<Transaction> {
        self.transactions.clone()
    }

    /// Drop the oldest `count` transactions: the batch a mining attempt
    /// snapshotted. Transactions submitted while it was mining stay queued.
    pub fn remove_mined(&mut self, count: usize) {
        let count = count.min(self.transactions.len());
        self.transactions.drain(..count);
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

fn overflow(account: &str) -> ChainError {
    ChainError::MalformedInput(format!("Balance overflow for {}", account))
}
