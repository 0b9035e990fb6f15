/// Transaction types for tallychain
use serde::{Deserialize, Serialize};

/// Opaque account identifier.
///
/// Identifiers are not authenticated: anyone can submit a transaction naming
/// any sender. The ledger only guarantees that balances never go negative.
pub type AccountId = String;

/// Signed balance quantity. Amounts carried by transactions must be positive.
pub type Amount = i64;

/// A balance-affecting record carried in a block's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transaction {
    /// Two-party move of funds; total supply is unchanged.
    Transfer {
        sender: AccountId,
        receiver: AccountId,
        amount: Amount,
    },
    /// Single-party credit; always succeeds when `amount > 0`.
    Deposit { account: AccountId, amount: Amount },
    /// Single-party debit; fails if it would overdraw the account.
    Withdrawal { account: AccountId, amount: Amount },
}

impl Transaction {
    pub fn transfer(sender: impl Into<String>, receiver: impl Into<String>, amount: Amount) -> Self {
        Transaction::Transfer {
            sender: sender.into(),
            receiver: receiver.into(),
            amount,
        }
    }

    pub fn deposit(account: impl Into<String>, amount: Amount) -> Self {
        Transaction::Deposit {
            account: account.into(),
            amount,
        }
    }

    pub fn withdrawal(account: impl Into<String>, amount: Amount) -> Self {
        Transaction::Withdrawal {
            account: account.into(),
            amount,
        }
    }

    pub fn amount(&self) -> Amount {
        match self {
            Transaction::Transfer { amount, .. }
            | Transaction::Deposit { amount, .. }
            | Transaction::Withdrawal { amount, .. } => *amount,
        }
    }

    /// The account whose balance decreases, if any.
    pub fn debited_account(&self) -> Option<&str> {
        match self {
            Transaction::Transfer { sender, .. } => Some(sender),
            Transaction::Withdrawal { account, .. } => Some(account),
            Transaction::Deposit { .. } => None,
        }
    }

    /// The account whose balance increases, if any.
    pub fn credited_account(&self) -> Option<&str> {
        match self {
            Transaction::Transfer { receiver, .. } => Some(receiver),
            Transaction::Deposit { account, .. } => Some(account),
            Transaction::Withdrawal { .. } => None,
        }
    }

    /// Net change in total supply caused by this transaction.
    pub fn supply_delta(&self) -> Amount {
        match self {
            Transaction::Transfer { .. } => 0,
            Transaction::Deposit { amount, .. } => *amount,
            Transaction::Withdrawal { amount, .. } => -*amount,
        }
    }
}
