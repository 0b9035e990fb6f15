//! Peer transport for tallychain
//!
//! The node never talks HTTP directly; it goes through [`PeerClient`], so the
//! consensus and broadcast paths can be driven by an in-process mock in tests.

use crate::blockchain::Block;
use crate::error::ChainError;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Body of `GET /api/chain`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainResponse {
    pub chain: Vec<Block>,
    pub length: usize,
}

/// Body of `POST /api/peers` and `POST /api/peers/join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRequest {
    pub address: String,
}

/// How a peer answered a pushed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The block extended the peer's head.
    Accepted,
    /// The peer answered 409: it already has the block or has moved past it.
    AlreadyKnown,
}

/// Outbound calls a node makes to its peers.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Fetch the peer's full chain.
    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>, ChainError>;
    /// Offer a sealed block to the peer. A conflict reply is not a failure.
    async fn push_block(&self, peer: &str, block: &Block) -> Result<PushOutcome, ChainError>;
    /// Ask the peer to add `address` to its registry, without forwarding.
    async fn register_with(&self, peer: &str, address: &str) -> Result<(), ChainError>;
    /// Ask the peer to register `address` and forward it to everyone it knows.
    async fn announce(&self, peer: &str, address: &str) -> Result<(), ChainError>;
}

/// reqwest-backed [`PeerClient`] speaking the node's own HTTP API.
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    client: Client,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::PeerUnreachable(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn url(peer: &str, path: &str) -> String {
        format!("http://{}/api{}", peer, path)
    }

    async fn post_json<T: Serialize + ?Sized>(&self, peer: &str, path: &str, body: &T) -> Result<(), ChainError> {
        let response = self
            .client
            .post(Self::url(peer, path))
            .json(body)
            .send()
            .await
            .map_err(|e| unreachable(peer, e))?;

        if !response.status().is_success() {
            return Err(ChainError::PeerUnreachable(format!(
                "{} answered {} on {}",
                peer,
                response.status(),
                path
            )));
        }
        Ok(())
    }
}

fn unreachable(peer: &str, err: reqwest::Error) -> ChainError {
    ChainError::PeerUnreachable(format!("{}: {}", peer, err))
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>, ChainError> {
        let response: ChainResponse = self
            .client
            .get(Self::url(peer, "/chain"))
            .send()
            .await
            .map_err(|e| unreachable(peer, e))?
            .error_for_status()
            .map_err(|e| unreachable(peer, e))?
            .json()
            .await
            .map_err(|e| unreachable(peer, e))?;

        if response.length != response.chain.len() {
            return Err(ChainError::InvalidBlock(format!(
                "{} declared length {} but sent {} blocks",
                peer,
                response.length,
                response.chain.len()
            )));
        }
        Ok(response.chain)
    }

    async fn push_block(&self, peer: &str, block: &Block) -> Result<PushOutcome, ChainError> {
        let response = self
            .client
            .post(Self::url(peer, "/blocks"))
            .json(block)
            .send()
            .await
            .map_err(|e| unreachable(peer, e))?;

        match response.status() {
            status if status.is_success() => Ok(PushOutcome::Accepted),
            StatusCode::CONFLICT => Ok(PushOutcome::AlreadyKnown),
            status => Err(ChainError::PeerUnreachable(format!(
                "{} answered {} on /blocks",
                peer, status
            ))),
        }
    }

    async fn register_with(&self, peer: &str, address: &str) -> Result<(), ChainError> {
        let body = PeerRequest {
            address: address.to_string(),
        };
        self.post_json(peer, "/peers", &body).await
    }

    async fn announce(&self, peer: &str, address: &str) -> Result<(), ChainError> {
        let body = PeerRequest {
            address: address.to_string(),
        };
        self.post_json(peer, "/peers/join", &body).await
    }
}

/// In-process [`PeerClient`] serving canned chains and recording every call.
#[derive(Debug, Default)]
pub struct MockPeerClient {
    chains: Mutex<BTreeMap<String, Vec<Block>>>,
    offline: Mutex<BTreeSet<String>>,
    pushed: Mutex<Vec<(String, Block)>>,
    registrations: Mutex<Vec<(String, String)>>,
    fetches: Mutex<Vec<String>>,
}

impl MockPeerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_chain(&self, peer: &str, blocks: Vec<Block>) {
        self.chains.lock().insert(peer.to_string(), blocks);
    }

    pub fn set_offline(&self, peer: &str) {
        self.offline.lock().insert(peer.to_string());
    }

    pub fn pushed(&self) -> Vec<(String, Block)> {
        self.pushed.lock().clone()
    }

    /// `(peer, registered address)` pairs, in call order.
    pub fn registrations(&self) -> Vec<(String, String)> {
        self.registrations.lock().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().len()
    }

    fn check_online(&self, peer: &str) -> Result<(), ChainError> {
        if self.offline.lock().contains(peer) {
            return Err(ChainError::PeerUnreachable(format!("{}: connection refused", peer)));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerClient for MockPeerClient {
    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>, ChainError> {
        self.fetches.lock().push(peer.to_string());
        self.check_online(peer)?;
        self.chains
            .lock()
            .get(peer)
            .cloned()
            .ok_or_else(|| ChainError::PeerUnreachable(format!("{}: no chain", peer)))
    }

    /// Answers `AlreadyKnown` when the same block was pushed to `peer` before.
    async fn push_block(&self, peer: &str, block: &Block) -> Result<PushOutcome, ChainError> {
        self.check_online(peer)?;
        let mut pushed = self.pushed.lock();
        if pushed.iter().any(|(p, b)| p == peer && b.hash == block.hash) {
            return Ok(PushOutcome::AlreadyKnown);
        }
        pushed.push((peer.to_string(), block.clone()));
        Ok(PushOutcome::Accepted)
    }

    async fn register_with(&self, peer: &str, address: &str) -> Result<(), ChainError> {
        self.check_online(peer)?;
        self.registrations
            .lock()
            .push((peer.to_string(), address.to_string()));
        Ok(())
    }

    async fn announce(&self, peer: &str, address: &str) -> Result<(), ChainError> {
        self.register_with(peer, address).await
    }
}
