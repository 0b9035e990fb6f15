// Ledger engine. The implementation lives under `blockchain/core/` split by
// concern: block and chain management, balance state, and chain verification.

pub mod core;
pub use core::*;
