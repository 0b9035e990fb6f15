//! tallychain - a minimal proof-of-work ledger
//!
//! Nodes keep an append-only, hash-linked chain of sealed blocks. Each block
//! carries either a chat message or a batch of balance-changing transactions,
//! and nodes converge on the longest chain that independently verifies.
//!
//! # Architecture
//!
//! ## Ledger engine
//! - [`hasher`] - Canonical block preimage and SHA-256 digest
//! - [`blockchain`] - Blocks, the ledger, balance state and chain verification
//! - [`transaction`] - Transfer, deposit and withdrawal records
//! - [`mempool`] - Pending transaction pool
//! - [`miner`] - Cancellable proof-of-work search
//! - [`consensus`] - Longest-valid-chain selection
//!
//! ## Node
//! - [`node`] - Per-instance owner of ledger, pool and peers
//! - [`sync`] - Peer registry
//! - [`network`] - Outbound peer client
//! - [`persistence`] - Database layer (SQLite)
//! - [`api`] - HTTP interface (feature `api`)
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types
//!
//! Transactions are not signed: sender and receiver identifiers are plain,
//! unauthenticated strings and anyone can spend from any account.

#![forbid(unsafe_code)]

// ============================================================================
// Ledger engine
// ============================================================================
pub mod blockchain;
pub mod consensus;
pub mod hasher;
pub mod mempool;
pub mod miner;
pub mod transaction;

// ============================================================================
// Node & Networking
// ============================================================================
pub mod network;
pub mod node;
pub mod persistence;
pub mod sync;

// ============================================================================
// Integration
// ============================================================================
#[cfg(feature = "api")]
pub mod api;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
