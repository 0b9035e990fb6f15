/// Validation logic for transactions separated from type definitions
use crate::blockchain::LedgerState;
use crate::error::ChainError;
use crate::transaction::types::Transaction;

impl Transaction {
    /// Stateless checks: positive amount and non-empty identifiers.
    pub fn validate_shape(&self) -> Result<(), ChainError> {
        if self.amount() <= 0 {
            return Err(ChainError::MalformedInput(format!(
                "Amount must be positive, got {}",
                self.amount()
            )));
        }

        let ids: &[&str] = match self {
            Transaction::Transfer {
                sender, receiver, ..
            } => &[sender.as_str(), receiver.as_str()],
            Transaction::Deposit { account, .. } | Transaction::Withdrawal { account, .. } => {
                &[account.as_str()]
            }
        };
        if ids.iter().any(|id| id.trim().is_empty()) {
            return Err(ChainError::MalformedInput(
                "Account identifiers cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Replays `transactions` against a copy of `balances`.
///
/// All-or-nothing: the first malformed or overdrawing transaction rejects the
/// whole batch and the caller's state is never touched.
pub fn validate_transactions(
    transactions: &[Transaction],
    balances: &LedgerState,
) -> Result<(), ChainError> {
    let mut simulated = balances.clone();
    simulated.execute(transactions)
}
