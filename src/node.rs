//! Node orchestration for tallychain
//!
//! A [`Node`] owns exactly one ledger, one pending pool and one peer registry.
//! Every ledger mutation (local append, external append, consensus
//! replacement) runs under a single append lock, so only one is ever in
//! flight. Proof-of-work runs on the blocking pool while that lock is held but
//! without the ledger or pool locks, so reads and submissions stay available
//! during a long seal.

use crate::blockchain::{verify_chain, Block, Blockchain, Message, Payload};
use crate::config::Config;
use crate::consensus::{Consensus, PeerChain, Resolution};
use crate::error::ChainError;
use crate::mempool::Mempool;
use crate::miner::mine_block;
use crate::network::{HttpPeerClient, PeerClient, PushOutcome};
use crate::persistence::{Database, Persistence};
use crate::sync::{normalize_address, PeerRegistry, PeerSummary};
use crate::transaction::{AccountId, Amount, Transaction};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Booting,
    Syncing,
    Ready,
    /// The stored chain failed verification; mining is refused until a
    /// consensus round replaces it.
    Degraded,
}

#[derive(Debug, Default)]
struct NodeCounters {
    blocks_mined: AtomicU64,
    blocks_accepted: AtomicU64,
    blocks_rejected: AtomicU64,
    chain_replacements: AtomicU64,
    transactions_submitted: AtomicU64,
}

/// Snapshot returned by [`Node::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub state: NodeState,
    pub address: String,
    pub chain_length: usize,
    pub difficulty: u32,
    pub chain_valid: bool,
    pub pending_transactions: usize,
    pub peers: usize,
    pub is_mining: bool,
    pub blocks_mined: u64,
    pub blocks_accepted: u64,
    pub blocks_rejected: u64,
    pub chain_replacements: u64,
    pub transactions_submitted: u64,
    pub uptime_seconds: u64,
}

pub struct Node {
    pub config: Config,
    pub blockchain: Arc<RwLock<Blockchain>>,
    pub mempool: Arc<RwLock<Mempool>>,
    pub peers: PeerRegistry,
    pub state: Arc<RwLock<NodeState>>,
    client: Arc<dyn PeerClient>,
    persistence: Arc<dyn Persistence>,
    append_lock: Mutex<()>,
    cancel: Arc<AtomicBool>,
    mining: AtomicBool,
    address: String,
    counters: NodeCounters,
    started: Instant,
}

impl Node {
    /// Build a node from its collaborators, loading the stored chain and peers.
    pub async fn new(
        config: Config,
        persistence: Arc<dyn Persistence>,
        client: Arc<dyn PeerClient>,
    ) -> Result<Self, ChainError> {
        let address = normalize_address(&config.advertised_address())?;
        let difficulty = config.ledger.difficulty;
        let seed = config.seed_state();

        let stored = persistence.load_chain()?;
        let blockchain = if stored.is_empty() {
            info!(difficulty, "no stored chain, creating genesis");
            let chain = Blockchain::new(difficulty, seed)?;
            persistence.replace_chain(&chain.blocks)?;
            chain
        } else {
            info!(blocks = stored.len(), "loading stored chain");
            Blockchain::from_blocks(stored, difficulty, seed)?
        };

        let state = if blockchain.is_corrupted() {
            error!("stored chain failed verification, node is degraded");
            NodeState::Degraded
        } else {
            NodeState::Booting
        };

        let peers = PeerRegistry::new();
        for peer in persistence.load_peers()? {
            if peer != address {
                peers.register(&peer).await?;
            }
        }

        Ok(Self {
            config,
            blockchain: Arc::new(RwLock::new(blockchain)),
            mempool: Arc::new(RwLock::new(Mempool::new())),
            peers,
            state: Arc::new(RwLock::new(state)),
            client,
            persistence,
            append_lock: Mutex::new(()),
            cancel: Arc::new(AtomicBool::new(false)),
            mining: AtomicBool::new(false),
            address,
            counters: NodeCounters::default(),
            started: Instant::now(),
        })
    }

    /// Open the configured SQLite database and HTTP peer client.
    pub async fn from_config(config: Config) -> Result<Self, ChainError> {
        let db_path = std::path::Path::new(&config.database.path);
        if config.database.path != ":memory:" {
            if let Some(parent) = db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let persistence: Arc<dyn Persistence> = Arc::new(Database::open(&config.database.path)?);
        let client: Arc<dyn PeerClient> =
            Arc::new(HttpPeerClient::new(config.consensus.request_timeout)?);
        Self::new(config, persistence, client).await
    }

    /// The address this node advertises to peers.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn node_state(&self) -> NodeState {
        *self.state.read().await
    }

    async fn set_state(&self, next: NodeState) {
        let mut state = self.state.write().await;
        if *state != next {
            info!(from = ?*state, to = ?next, "node state changed");
            *state = next;
        }
    }

    /// Announce to bootstrap peers, run a first consensus round, become Ready.
    pub async fn bootstrap(&self) -> Result<Resolution, ChainError> {
        if self.node_state().await != NodeState::Degraded {
            self.set_state(NodeState::Syncing).await;
        }

        for peer in self.config.network.bootstrap_peers.clone() {
            match self.register_peer(&peer).await {
                Ok(_) => {}
                Err(e) => {
                    warn!(peer = %peer, error = %e, "ignoring bootstrap peer");
                    continue;
                }
            }
            let peer = normalize_address(&peer)?;
            if let Err(e) = self.client.announce(&peer, &self.address).await {
                warn!(peer = %peer, error = %e, "bootstrap announce failed");
                self.peers.record_failure(&peer).await;
            }
        }

        let resolution = self.resolve_consensus().await?;
        if !self.blockchain.read().await.is_corrupted() {
            self.set_state(NodeState::Ready).await;
        }
        Ok(resolution)
    }

    // ------------------------------------------------------------------
    // Pool
    // ------------------------------------------------------------------

    /// Admit a transaction into the pending pool. Returns the new pool size.
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<usize, ChainError> {
        let chain = self.blockchain.read().await;
        let mut pool = self.mempool.write().await;
        pool.add_transaction(tx, |account| chain.get_balance(account))?;
        self.counters
            .transactions_submitted
            .fetch_add(1, Ordering::Relaxed);
        Ok(pool.len())
    }

    pub async fn pending_transactions(&self) -> Vec<Transaction> {
        self.mempool.read().await.get_all_transactions()
    }

    // ------------------------------------------------------------------
    // Local append path
    // ------------------------------------------------------------------

    /// Seal everything currently pending into the next block.
    ///
    /// A batch that fails validation is dropped from the pool so it cannot
    /// block later attempts; a corrupted local chain leaves the pool alone.
    /// Transactions submitted while the seal is being computed stay pending
    /// for the next block.
    pub async fn mine_next_block(&self) -> Result<Block, ChainError> {
        let block = {
            let _guard = self.append_lock.lock().await;
            let transactions = self.mempool.read().await.get_all_transactions();
            let batch_len = transactions.len();

            let (candidate, difficulty) = match self.prepare(Payload::Transactions(transactions)).await {
                Ok(prepared) => prepared,
                Err(e @ ChainError::ChainCorrupted(_)) => return Err(e),
                Err(e) => {
                    self.mempool.write().await.remove_mined(batch_len);
                    warn!(batch = batch_len, error = %e, "pending batch rejected and discarded");
                    return Err(e);
                }
            };
            self.seal_and_append(candidate, difficulty, batch_len).await?
        };

        self.broadcast_block(&block).await;
        Ok(block)
    }

    /// Append a chat message block.
    pub async fn post_message(&self, author: &str, text: &str) -> Result<Block, ChainError> {
        let block = {
            let _guard = self.append_lock.lock().await;
            let (candidate, difficulty) = self
                .prepare(Payload::Message(Message::new(author, text)))
                .await?;
            self.seal_and_append(candidate, difficulty, 0).await?
        };
        self.broadcast_block(&block).await;
        Ok(block)
    }

    /// Validate `payload` against the current head and balances.
    async fn prepare(&self, payload: Payload) -> Result<(Block, u32), ChainError> {
        let chain = self.blockchain.read().await;
        Ok((chain.prepare_block(payload)?, chain.difficulty))
    }

    /// Seal off-lock, then commit. Caller holds the append lock.
    async fn seal_and_append(&self, candidate: Block, difficulty: u32, drain: usize) -> Result<Block, ChainError> {
        self.cancel.store(false, Ordering::SeqCst);
        self.mining.store(true, Ordering::SeqCst);
        let cancel = self.cancel.clone();
        let started = Instant::now();
        let sealed = tokio::task::spawn_blocking(move || mine_block(candidate, difficulty, &cancel)).await;
        self.mining.store(false, Ordering::SeqCst);

        let sealed = sealed
            .map_err(|e| ChainError::IoError(format!("Mining task failed: {}", e)))?
            .map_err(|e| {
                if e == ChainError::MiningCancelled {
                    info!("mining cancelled, pool and ledger untouched");
                }
                e
            })?;

        {
            let mut chain = self.blockchain.write().await;
            chain.append_block(sealed.clone())?;
            if drain > 0 {
                self.mempool.write().await.remove_mined(drain);
            }
        }

        if let Err(e) = self.persistence.save_block(&sealed) {
            error!(index = sealed.index, error = %e, "failed to persist block");
        }
        self.counters.blocks_mined.fetch_add(1, Ordering::Relaxed);
        info!(
            index = sealed.index,
            hash = %sealed.hash,
            nonce = sealed.nonce,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "block mined"
        );
        Ok(sealed)
    }

    /// Ask an in-flight seal to stop. Returns whether one was running.
    pub fn cancel_mining(&self) -> bool {
        let running = self.is_mining();
        self.cancel.store(true, Ordering::SeqCst);
        running
    }

    pub fn is_mining(&self) -> bool {
        self.mining.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // External append path
    // ------------------------------------------------------------------

    /// Accept a block sealed by a peer. On success it is re-broadcast once.
    pub async fn accept_external_block(&self, block: Block) -> Result<(), ChainError> {
        {
            let _guard = self.append_lock.lock().await;
            let mut chain = self.blockchain.write().await;
            if let Err(e) = chain.accept_external_block(block.clone()) {
                self.counters.blocks_rejected.fetch_add(1, Ordering::Relaxed);
                debug!(index = block.index, error = %e, "external block rejected");
                return Err(e);
            }
            if let Err(e) = self.persistence.save_block(&block) {
                error!(index = block.index, error = %e, "failed to persist block");
            }
        }

        self.counters.blocks_accepted.fetch_add(1, Ordering::Relaxed);
        info!(index = block.index, hash = %block.hash, "external block accepted");
        self.broadcast_block(&block).await;
        Ok(())
    }

    /// Best-effort push to every peer. Returns how many peers took the block.
    ///
    /// A peer that already has the block (including the one that sent it to
    /// us) answers with a conflict; that counts as reachable, not delivered.
    pub async fn broadcast_block(&self, block: &Block) -> usize {
        let mut tasks = JoinSet::new();
        for peer in self.peers.addresses().await {
            let client = self.client.clone();
            let block = block.clone();
            tasks.spawn(async move {
                let result = client.push_block(&peer, &block).await;
                (peer, result)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((peer, Ok(PushOutcome::Accepted))) => {
                    self.peers.record_success(&peer, None).await;
                    delivered += 1;
                }
                Ok((peer, Ok(PushOutcome::AlreadyKnown))) => {
                    debug!(peer = %peer, index = block.index, "peer already has block");
                    self.peers.record_success(&peer, None).await;
                }
                Ok((peer, Err(e))) => {
                    debug!(peer = %peer, index = block.index, error = %e, "broadcast failed");
                    self.peers.record_failure(&peer).await;
                }
                Err(e) => warn!(error = %e, "broadcast task failed"),
            }
        }
        delivered
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    /// Add a peer locally. Returns `false` for already known peers and for
    /// this node's own address.
    pub async fn register_peer(&self, address: &str) -> Result<bool, ChainError> {
        let address = normalize_address(address)?;
        if address == self.address {
            return Ok(false);
        }
        let added = self.peers.register(&address).await?;
        if added {
            self.persistence.save_peer(&address)?;
            info!(peer = %address, "peer registered");
        }
        Ok(added)
    }

    /// Forward `address` to every known peer, then register it here.
    pub async fn join_network(&self, address: &str) -> Result<bool, ChainError> {
        let address = normalize_address(address)?;

        let mut tasks = JoinSet::new();
        for peer in self.peers.addresses().await {
            if peer == address {
                continue;
            }
            let client = self.client.clone();
            let joining = address.clone();
            tasks.spawn(async move {
                let result = client.register_with(&peer, &joining).await;
                (peer, result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((peer, Err(e))) => {
                    warn!(peer = %peer, error = %e, "failed to forward registration");
                    self.peers.record_failure(&peer).await;
                }
                Err(e) => warn!(error = %e, "forwarding task failed"),
            }
        }

        self.register_peer(&address).await
    }

    /// Forget a peer. Returns `false` if it was not registered.
    pub async fn remove_peer(&self, address: &str) -> Result<bool, ChainError> {
        let address = normalize_address(address)?;
        if !self.peers.remove(&address).await? {
            return Ok(false);
        }
        self.persistence.remove_peer(&address)?;
        info!(peer = %address, "peer removed");
        Ok(true)
    }

    pub async fn list_peers(&self) -> Vec<PeerSummary> {
        self.peers.list().await
    }

    // ------------------------------------------------------------------
    // Consensus
    // ------------------------------------------------------------------

    /// Fetch every peer's chain in parallel and adopt the longest one that
    /// verifies, if it is strictly longer than ours.
    pub async fn resolve_consensus(&self) -> Result<Resolution, ChainError> {
        let mut tasks = JoinSet::new();
        for peer in self.peers.addresses().await {
            let client = self.client.clone();
            tasks.spawn(async move {
                let result = client.fetch_chain(&peer).await;
                (peer, result)
            });
        }

        let mut candidates = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((peer, Ok(blocks))) => {
                    self.peers.record_success(&peer, Some(blocks.len())).await;
                    candidates.push(PeerChain { peer, blocks });
                }
                Ok((peer, Err(e))) => {
                    warn!(peer = %peer, error = %e, "skipping unreachable peer");
                    self.peers.record_failure(&peer).await;
                }
                Err(e) => warn!(error = %e, "chain fetch task failed"),
            }
        }

        let _guard = self.append_lock.lock().await;
        let (local_length, difficulty, seed) = {
            let chain = self.blockchain.read().await;
            (chain.len(), chain.difficulty, chain.seed().clone())
        };

        let selected = tokio::task::spawn_blocking(move || {
            Consensus::select_canonical(local_length, candidates, |blocks| {
                verify_chain(blocks, difficulty, &seed)
            })
        })
        .await
        .map_err(|e| ChainError::IoError(format!("Consensus task failed: {}", e)))?;

        let Some(canonical) = selected else {
            debug!(length = local_length, "local chain is authoritative");
            return Ok(Resolution::Authoritative);
        };

        let length = canonical.blocks.len();
        self.persistence.replace_chain(&canonical.blocks)?;
        self.blockchain
            .write()
            .await
            .replace_verified(canonical.blocks, canonical.state);
        self.counters
            .chain_replacements
            .fetch_add(1, Ordering::Relaxed);
        info!(peer = %canonical.peer, from = local_length, to = length, "local chain replaced");

        if self.node_state().await == NodeState::Degraded {
            self.set_state(NodeState::Ready).await;
        }
        Ok(Resolution::Replaced { length })
    }

    /// Run [`Node::resolve_consensus`] every `resolve_interval`, if enabled.
    pub fn spawn_periodic_resolution(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.resolve_interval()?;
        let node = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately; bootstrap already resolved
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match node.resolve_consensus().await {
                    Ok(resolution) => debug!(?resolution, "periodic consensus"),
                    Err(e) => warn!(error = %e, "periodic consensus failed"),
                }
            }
        }))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_chain(&self) -> Vec<Block> {
        self.blockchain.read().await.blocks.clone()
    }

    pub async fn get_block(&self, index: u64) -> Option<Block> {
        self.blockchain.read().await.get_block(index).cloned()
    }

    pub async fn get_balance(&self, account: &str) -> Amount {
        self.blockchain.read().await.get_balance(account)
    }

    pub async fn get_balances(&self) -> BTreeMap<AccountId, Amount> {
        self.blockchain.read().await.state.balances.clone()
    }

    pub async fn chat_history(&self) -> Vec<Message> {
        self.blockchain
            .read()
            .await
            .chat_history()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn is_chain_valid(&self) -> bool {
        self.blockchain.read().await.is_valid()
    }

    pub async fn stats(&self) -> NodeStats {
        let (chain_length, difficulty, chain_valid) = {
            let chain = self.blockchain.read().await;
            (chain.len(), chain.difficulty, chain.is_valid() && !chain.is_corrupted())
        };
        NodeStats {
            state: self.node_state().await,
            address: self.address.clone(),
            chain_length,
            difficulty,
            chain_valid,
            pending_transactions: self.mempool.read().await.len(),
            peers: self.peers.count().await,
            is_mining: self.is_mining(),
            blocks_mined: self.counters.blocks_mined.load(Ordering::Relaxed),
            blocks_accepted: self.counters.blocks_accepted.load(Ordering::Relaxed),
            blocks_rejected: self.counters.blocks_rejected.load(Ordering::Relaxed),
            chain_replacements: self.counters.chain_replacements.load(Ordering::Relaxed),
            transactions_submitted: self
                .counters
                .transactions_submitted
                .load(Ordering::Relaxed),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::LedgerState;
    use crate::network::MockPeerClient;
    use crate::persistence::InMemoryPersistence;
    use std::time::Duration;

    fn config(port: u16) -> Config {
        let mut config = Config::default();
        config.network.api_port = port;
        config.ledger.difficulty = 1;
        config.ledger.genesis_balances =
            BTreeMap::from([("Alice".to_string(), 1000), ("Bob".to_string(), 500)]);
        config
    }

    async fn node_with(
        port: u16,
        store: InMemoryPersistence,
        client: Arc<MockPeerClient>,
    ) -> Node {
        Node::new(config(port), Arc::new(store), client).await.unwrap()
    }

    async fn node(client: Arc<MockPeerClient>) -> Node {
        node_with(5000, InMemoryPersistence::new(), client).await
    }

    #[tokio::test]
    async fn test_mine_then_reject_overdraft() {
        tokio::time::timeout(Duration::from_secs(30), async {
            let node = node(Arc::new(MockPeerClient::new())).await;
            node.submit_transaction(Transaction::transfer("Alice", "Bob", 100)).await.unwrap();
            node.submit_transaction(Transaction::transfer("Bob", "Alice", 50)).await.unwrap();
            let block = node.mine_next_block().await.unwrap();
            assert_eq!(block.index, 1);
            assert_eq!(node.get_balance("Alice").await, 950);
            assert_eq!(node.get_balance("Bob").await, 550);
            assert!(node.pending_transactions().await.is_empty());

            node.submit_transaction(Transaction::transfer("Alice", "Bob", 2000)).await.unwrap();
            let err = node.mine_next_block().await.unwrap_err();
            assert!(matches!(err, ChainError::InsufficientFunds(_)));
            assert_eq!(node.get_balance("Alice").await, 950);
            assert_eq!(node.get_balance("Bob").await, 550);
            assert_eq!(node.get_chain().await.len(), 2);
            assert!(node.pending_transactions().await.is_empty());
        })
        .await
        .expect("test_mine_then_reject_overdraft timed out");
    }

    #[tokio::test]
    async fn test_submit_validates_amount_and_withdrawals() {
        let node = node(Arc::new(MockPeerClient::new())).await;
        assert!(matches!(
            node.submit_transaction(Transaction::deposit("7", -1)).await,
            Err(ChainError::MalformedInput(_))
        ));
        node.submit_transaction(Transaction::deposit("7", 30)).await.unwrap();
        assert!(matches!(
            node.submit_transaction(Transaction::withdrawal("7", 31)).await,
            Err(ChainError::InsufficientFunds(_))
        ));
        assert_eq!(node.submit_transaction(Transaction::withdrawal("7", 30)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancel_mining_leaves_pool_and_ledger() {
        tokio::time::timeout(Duration::from_secs(30), async {
            let node = Arc::new(node(Arc::new(MockPeerClient::new())).await);
            node.blockchain.write().await.difficulty = 16;
            node.submit_transaction(Transaction::deposit("Carol", 5)).await.unwrap();

            let miner = {
                let node = node.clone();
                tokio::spawn(async move { node.mine_next_block().await })
            };
            while !node.is_mining() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert!(node.cancel_mining());

            let result = miner.await.unwrap();
            assert_eq!(result.unwrap_err(), ChainError::MiningCancelled);
            assert_eq!(node.get_chain().await.len(), 1);
            assert_eq!(node.pending_transactions().await.len(), 1);
            assert_eq!(node.get_balance("Carol").await, 0);
        })
        .await
        .expect("test_cancel_mining_leaves_pool_and_ledger timed out");
    }

    #[tokio::test]
    async fn test_mined_block_is_broadcast() {
        let client = Arc::new(MockPeerClient::new());
        let node = node(client.clone()).await;
        node.register_peer("peer-b:5001").await.unwrap();
        node.register_peer("peer-c:5002").await.unwrap();
        client.set_offline("peer-c:5002");

        let block = node.post_message("ann", "hello").await.unwrap();
        assert_eq!(client.pushed(), vec![("peer-b:5001".to_string(), block)]);
        assert_eq!(node.peers.get("peer-c:5002").await.unwrap().failures, 1);
        assert_eq!(node.chat_history().await, vec![Message::new("ann", "hello")]);
    }

    #[tokio::test]
    async fn test_accept_external_block_and_rebroadcast() {
        let client = Arc::new(MockPeerClient::new());
        let origin = node(Arc::new(MockPeerClient::new())).await;
        let node = node_with(5001, InMemoryPersistence::new(), client.clone()).await;
        node.register_peer("peer-b:5002").await.unwrap();

        let block = origin.post_message("ann", "hi").await.unwrap();
        node.accept_external_block(block.clone()).await.unwrap();
        assert_eq!(node.get_chain().await, origin.get_chain().await);
        assert_eq!(client.pushed().len(), 1);

        let err = node.accept_external_block(block).await.unwrap_err();
        assert!(matches!(err, ChainError::StaleOrForked(_)));
        assert_eq!(client.pushed().len(), 1);
        assert_eq!(node.stats().await.blocks_rejected, 1);
    }

    #[tokio::test]
    async fn test_consensus_adopts_longer_chain_once() {
        tokio::time::timeout(Duration::from_secs(30), async {
            let client = Arc::new(MockPeerClient::new());
            let remote = node_with(5009, InMemoryPersistence::new(), Arc::new(MockPeerClient::new())).await;
            remote.submit_transaction(Transaction::transfer("Alice", "Bob", 10)).await.unwrap();
            remote.mine_next_block().await.unwrap();
            remote.post_message("ann", "hi").await.unwrap();

            let store = InMemoryPersistence::new();
            let node = node_with(5000, store.clone(), client.clone()).await;
            node.register_peer("peer-b:5009").await.unwrap();
            node.register_peer("peer-down:1").await.unwrap();
            client.set_chain("peer-b:5009", remote.get_chain().await);
            client.set_offline("peer-down:1");

            let first = node.resolve_consensus().await.unwrap();
            assert_eq!(first, Resolution::Replaced { length: 3 });
            assert_eq!(node.get_balance("Alice").await, 990);
            assert_eq!(node.get_balance("Bob").await, 510);
            assert_eq!(store.load_chain().unwrap(), remote.get_chain().await);
            assert_eq!(node.peers.get("peer-down:1").await.unwrap().failures, 1);

            let second = node.resolve_consensus().await.unwrap();
            assert_eq!(second, Resolution::Authoritative);
        })
        .await
        .expect("test_consensus_adopts_longer_chain_once timed out");
    }

    #[tokio::test]
    async fn test_consensus_ignores_longer_invalid_chain() {
        let client = Arc::new(MockPeerClient::new());
        let remote = node(Arc::new(MockPeerClient::new())).await;
        remote.post_message("ann", "one").await.unwrap();
        remote.post_message("ann", "two").await.unwrap();
        let mut forged = remote.get_chain().await;
        forged[1].payload = Payload::Message(Message::new("eve", "one"));

        let node = node(client.clone()).await;
        node.register_peer("peer-b:5001").await.unwrap();
        client.set_chain("peer-b:5001", forged);

        assert_eq!(node.resolve_consensus().await.unwrap(), Resolution::Authoritative);
        assert_eq!(node.get_chain().await.len(), 1);
    }

    #[tokio::test]
    async fn test_join_network_forwards_to_known_peers() {
        let client = Arc::new(MockPeerClient::new());
        let node = node(client.clone()).await;
        node.register_peer("a:1").await.unwrap();
        node.register_peer("b:1").await.unwrap();

        assert!(node.join_network("http://c:1/").await.unwrap());
        let mut forwarded = client.registrations();
        forwarded.sort();
        assert_eq!(
            forwarded,
            vec![
                ("a:1".to_string(), "c:1".to_string()),
                ("b:1".to_string(), "c:1".to_string())
            ]
        );
        assert_eq!(node.peers.addresses().await, vec!["a:1", "b:1", "c:1"]);
        assert!(!node.register_peer("127.0.0.1:5000").await.unwrap());
    }

    #[tokio::test]
    async fn test_restart_reloads_chain_and_peers() {
        let store = InMemoryPersistence::new();
        let client = Arc::new(MockPeerClient::new());
        {
            let node = node_with(5000, store.clone(), client.clone()).await;
            node.register_peer("a:1").await.unwrap();
            node.submit_transaction(Transaction::deposit("Dave", 40)).await.unwrap();
            node.mine_next_block().await.unwrap();
        }
        let node = node_with(5000, store, client).await;
        assert_eq!(node.get_chain().await.len(), 2);
        assert_eq!(node.get_balance("Dave").await, 40);
        assert_eq!(node.peers.addresses().await, vec!["a:1"]);
        assert_eq!(node.node_state().await, NodeState::Booting);
    }

    #[tokio::test]
    async fn test_corrupted_store_degrades_node() {
        let source = node(Arc::new(MockPeerClient::new())).await;
        source.post_message("ann", "hi").await.unwrap();
        let mut blocks = source.get_chain().await;
        blocks[1].payload = Payload::Message(Message::new("ann", "edited"));

        let store = InMemoryPersistence::new();
        store.replace_chain(&blocks).unwrap();
        let node = node_with(5000, store, Arc::new(MockPeerClient::new())).await;
        assert_eq!(node.node_state().await, NodeState::Degraded);
        assert!(!node.is_chain_valid().await);
        assert!(matches!(
            node.mine_next_block().await,
            Err(ChainError::ChainCorrupted(_))
        ));
        assert_eq!(node.get_chain().await, blocks);
    }

    #[tokio::test]
    async fn test_bootstrap_announces_and_becomes_ready() {
        let client = Arc::new(MockPeerClient::new());
        let mut cfg = config(5000);
        cfg.network.bootstrap_peers = vec!["seed:7000".to_string()];
        let node = Node::new(cfg, Arc::new(InMemoryPersistence::new()), client.clone())
            .await
            .unwrap();
        client.set_chain("seed:7000", Blockchain::new(1, LedgerState::new()).unwrap().blocks);

        let resolution = node.bootstrap().await.unwrap();
        assert_eq!(resolution, Resolution::Authoritative);
        assert_eq!(
            client.registrations(),
            vec![("seed:7000".to_string(), "127.0.0.1:5000".to_string())]
        );
        assert_eq!(node.node_state().await, NodeState::Ready);
    }

    #[tokio::test]
    async fn test_overflowing_credit_rejected_at_submission() {
        let node = node(Arc::new(MockPeerClient::new())).await;
        assert!(matches!(
            node.submit_transaction(Transaction::deposit("Alice", i64::MAX)).await,
            Err(ChainError::MalformedInput(_))
        ));
        assert!(matches!(
            node.submit_transaction(Transaction::transfer("Bob", "Alice", i64::MAX - 999)).await,
            Err(ChainError::MalformedInput(_))
        ));
        assert!(node.pending_transactions().await.is_empty());

        node.submit_transaction(Transaction::transfer("Alice", "Bob", 1)).await.unwrap();
        node.mine_next_block().await.unwrap();
        assert_eq!(node.get_balance("Bob").await, 501);
    }

    #[tokio::test]
    async fn test_batch_failing_validation_is_discarded() {
        tokio::time::timeout(Duration::from_secs(30), async {
            let origin = node(Arc::new(MockPeerClient::new())).await;
            let node = node_with(5001, InMemoryPersistence::new(), Arc::new(MockPeerClient::new())).await;

            node.submit_transaction(Transaction::deposit("Carol", i64::MAX - 10)).await.unwrap();

            // a peer's block credits Carol after the deposit was admitted
            origin.submit_transaction(Transaction::deposit("Carol", 20)).await.unwrap();
            let block = origin.mine_next_block().await.unwrap();
            node.accept_external_block(block).await.unwrap();

            let err = node.mine_next_block().await.unwrap_err();
            assert!(matches!(err, ChainError::MalformedInput(_)));
            assert!(node.pending_transactions().await.is_empty());
            assert_eq!(node.get_balance("Carol").await, 20);

            node.submit_transaction(Transaction::transfer("Alice", "Bob", 1)).await.unwrap();
            let block = node.mine_next_block().await.unwrap();
            assert_eq!(block.index, 2);
            assert_eq!(node.get_balance("Bob").await, 501);
        })
        .await
        .expect("test_batch_failing_validation_is_discarded timed out");
    }

    #[tokio::test]
    async fn test_corrupted_chain_keeps_pool_on_mining() {
        let client = Arc::new(MockPeerClient::new());
        let mut blocks = Blockchain::new(1, LedgerState::new()).unwrap().blocks;
        blocks[0].nonce += 1;
        let store = InMemoryPersistence::new();
        store.replace_chain(&blocks).unwrap();
        let node = node_with(5000, store, client).await;

        node.submit_transaction(Transaction::deposit("Carol", 5)).await.unwrap();
        let err = node.mine_next_block().await.unwrap_err();
        assert!(matches!(err, ChainError::ChainCorrupted(_)));
        assert_eq!(node.pending_transactions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_broadcast_keeps_peers_reliable() {
        let client = Arc::new(MockPeerClient::new());
        let node = node(client.clone()).await;
        node.register_peer("peer-b:5001").await.unwrap();
        node.register_peer("peer-c:5002").await.unwrap();

        let block = node.post_message("ann", "hello").await.unwrap();
        for _ in 0..4 {
            assert_eq!(node.broadcast_block(&block).await, 0);
        }

        for peer in node.list_peers().await {
            assert_eq!(peer.failures, 0);
            assert!(!peer.unreliable);
        }
        assert_eq!(client.pushed().len(), 2);
    }

    #[tokio::test]
    async fn test_pool_and_reads_available_while_sealing() {
        tokio::time::timeout(Duration::from_secs(120), async {
            let node = Arc::new(node(Arc::new(MockPeerClient::new())).await);
            node.blockchain.write().await.difficulty = 5;
            node.submit_transaction(Transaction::transfer("Alice", "Bob", 10)).await.unwrap();

            let miner = {
                let node = node.clone();
                tokio::spawn(async move { node.mine_next_block().await })
            };
            while !node.is_mining() && !miner.is_finished() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }

            let quick = Duration::from_millis(500);
            let pending = tokio::time::timeout(quick, node.submit_transaction(Transaction::deposit("Carol", 7)))
                .await
                .expect("submission blocked by sealing")
                .unwrap();
            assert!(pending >= 1);
            let chain = tokio::time::timeout(quick, node.get_chain())
                .await
                .expect("chain read blocked by sealing");
            assert!(!chain.is_empty());
            let balance = tokio::time::timeout(quick, node.get_balance("Alice"))
                .await
                .expect("balance read blocked by sealing");
            assert!(balance == 1000 || balance == 990);

            let block = miner.await.unwrap().unwrap();
            assert_eq!(block.transactions(), &[Transaction::transfer("Alice", "Bob", 10)]);
            assert_eq!(
                node.pending_transactions().await,
                vec![Transaction::deposit("Carol", 7)]
            );
            assert_eq!(node.get_balance("Alice").await, 990);
        })
        .await
        .expect("test_pool_and_reads_available_while_sealing timed out");
    }
}
