//! Peer registry for tallychain
//!
//! Tracks the set of known peer addresses plus per-peer reachability
//! bookkeeping. Holds no ledger logic: the node only uses it to drive
//! broadcast and chain-fetch fan-out.

use crate::error::ChainError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

/// Consecutive failures after which a peer is reported as unreliable.
pub const UNRELIABLE_AFTER: u32 = 3;

/// Peer reachability information
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub address: String,
    pub last_seen: Option<Instant>,
    pub failures: u32,
    pub chain_length: Option<usize>,
}

impl PeerInfo {
    pub fn new(address: String) -> Self {
        Self {
            address,
            last_seen: None,
            failures: 0,
            chain_length: None,
        }
    }

    pub fn is_unreliable(&self) -> bool {
        self.failures >= UNRELIABLE_AFTER
    }

    /// Seconds since the last successful exchange, if there was one.
    pub fn seen_ago(&self) -> Option<Duration> {
        self.last_seen.map(|t| t.elapsed())
    }
}

/// Serializable view of a peer for the HTTP layer
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PeerSummary {
    pub address: String,
    pub failures: u32,
    pub unreliable: bool,
    pub chain_length: Option<usize>,
    pub last_seen_secs: Option<u64>,
}

impl From<&PeerInfo> for PeerSummary {
    fn from(info: &PeerInfo) -> Self {
        PeerSummary {
            address: info.address.clone(),
            failures: info.failures,
            unreliable: info.is_unreliable(),
            chain_length: info.chain_length,
            last_seen_secs: info.seen_ago().map(|d| d.as_secs()),
        }
    }
}

/// Canonical form of a peer address: no scheme, no trailing slash.
pub fn normalize_address(address: &str) -> Result<String, ChainError> {
    let trimmed = address.trim();
    let without_scheme = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .unwrap_or(trimmed);
    let normalized = without_scheme.trim_end_matches('/');

    if normalized.is_empty() {
        return Err(ChainError::MalformedInput(
            "Peer address cannot be empty".to_string(),
        ));
    }
    if normalized.chars().any(char::is_whitespace) {
        return Err(ChainError::MalformedInput(format!(
            "Peer address contains whitespace: {:?}",
            address
        )));
    }
    Ok(normalized.to_string())
}

/// Known peers, ordered by address.
///
/// The ordering is what makes consensus tie-breaks and broadcast order
/// deterministic.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<BTreeMap<String, PeerInfo>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. Returns `true` if it was not known before.
    pub async fn register(&self, address: &str) -> Result<bool, ChainError> {
        let address = normalize_address(address)?;
        let mut peers = self.peers.write().await;
        if peers.contains_key(&address) {
            return Ok(false);
        }
        peers.insert(address.clone(), PeerInfo::new(address));
        Ok(true)
    }

    /// Returns `true` if the peer was registered.
    pub async fn remove(&self, address: &str) -> Result<bool, ChainError> {
        let address = normalize_address(address)?;
        Ok(self.peers.write().await.remove(&address).is_some())
    }

    /// Addresses in ascending order.
    pub async fn addresses(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn list(&self) -> Vec<PeerSummary> {
        self.peers.read().await.values().map(PeerSummary::from).collect()
    }

    pub async fn get(&self, address: &str) -> Option<PeerInfo> {
        let address = normalize_address(address).ok()?;
        self.peers.read().await.get(&address).cloned()
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn record_success(&self, address: &str, chain_length: Option<usize>) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(address) {
            peer.failures = 0;
            peer.last_seen = Some(Instant::now());
            if chain_length.is_some() {
                peer.chain_length = chain_length;
            }
        }
    }

    pub async fn record_failure(&self, address: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(address) {
            peer.failures += 1;
            if peer.failures == UNRELIABLE_AFTER {
                warn!(peer = %address, failures = peer.failures, "peer marked as unreliable");
            }
        }
    }
}
