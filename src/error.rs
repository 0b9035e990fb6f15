//! Error types for tallychain

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Non-positive amount, empty identifier, missing field.
    MalformedInput(String),
    /// A transaction would drive a simulated balance below zero.
    InsufficientFunds(String),
    /// The local chain fails its own validity check.
    ChainCorrupted(String),
    /// A candidate block does not extend the current head.
    StaleOrForked(String),
    PeerUnreachable(String),
    InvalidBlock(String),
    MiningCancelled,
    DatabaseError(String),
    IoError(String),
    SerializationError(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::MalformedInput(msg) => write!(f, "Malformed input: {}", msg),
            ChainError::InsufficientFunds(msg) => write!(f, "Insufficient funds: {}", msg),
            ChainError::ChainCorrupted(msg) => write!(f, "Chain corrupted: {}", msg),
            ChainError::StaleOrForked(msg) => write!(f, "Stale or forked block: {}", msg),
            ChainError::PeerUnreachable(msg) => write!(f, "Peer unreachable: {}", msg),
            ChainError::InvalidBlock(msg) => write!(f, "Invalid block: {}", msg),
            ChainError::MiningCancelled => write!(f, "Mining cancelled"),
            ChainError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            ChainError::IoError(msg) => write!(f, "IO error: {}", msg),
            ChainError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
