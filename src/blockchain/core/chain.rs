use crate::error::ChainError;
use crate::hasher::{hash_fields, Preimage};
use crate::miner::mine_block;
use crate::transaction::{validate_transactions, Transaction};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use tracing::{debug, warn};

use super::state::LedgerState;
use super::validation::{is_valid_chain, verify_chain, verify_seal};

/// `previous_hash` sentinel carried by the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";
/// Fixed so that independently started nodes agree on genesis.
pub const GENESIS_TIMESTAMP: u64 = 1672531200000;
pub const DEFAULT_DIFFICULTY: u32 = 4;
/// Genesis is sealed at start-up without a way to cancel it, so the
/// configurable difficulty is capped.
pub const MAX_DIFFICULTY: u32 = 8;

/// A chat-style record: who said what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub author: String,
    pub text: String,
}

impl Message {
    pub fn new(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            text: text.into(),
        }
    }

    pub fn genesis() -> Self {
        Self::new("System", "Genesis Block")
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.author.trim().is_empty() {
            return Err(ChainError::MalformedInput(
                "Message author cannot be empty".to_string(),
            ));
        }
        if self.text.trim().is_empty() {
            return Err(ChainError::MalformedInput(
                "Message text cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a block carries: a single message or an ordered transaction list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Message(Message),
    Transactions(Vec<Transaction>),
}

impl Payload {
    pub fn transactions(&self) -> &[Transaction] {
        match self {
            Payload::Transactions(transactions) => transactions,
            Payload::Message(_) => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    /// Milliseconds since the Unix epoch. Never validated.
    pub timestamp: u64,
    pub previous_hash: String,
    pub payload: Payload,
    #[serde(default)]
    pub nonce: u64,
    pub hash: String,
}

impl Block {
    /// Build an unsealed block stamped with the current time and nonce 0.
    pub fn new(index: u64, previous_hash: String, payload: Payload) -> Self {
        let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self::with_timestamp(index, timestamp, previous_hash, payload)
    }

    pub fn with_timestamp(index: u64, timestamp: u64, previous_hash: String, payload: Payload) -> Self {
        let hash = hash_fields(index, timestamp, &previous_hash, &payload, 0);
        Block {
            index,
            timestamp,
            previous_hash,
            payload,
            nonce: 0,
            hash,
        }
    }

    pub fn calculate_hash(&self) -> String {
        self.preimage().digest(self.nonce)
    }

    pub fn preimage(&self) -> Preimage {
        Preimage::new(self.index, self.timestamp, &self.previous_hash, &self.payload)
    }

    pub fn transactions(&self) -> &[Transaction] {
        self.payload.transactions()
    }

    pub fn message(&self) -> Option<&Message> {
        match &self.payload {
            Payload::Message(message) => Some(message),
            Payload::Transactions(_) => None,
        }
    }
}

/// The ledger: sealed blocks plus the balances derived from them.
///
/// Mutated only by [`Blockchain::append_block`] (after validation) and
/// [`Blockchain::replace_chain`] (after independent verification).
#[derive(Debug, Clone)]
pub struct Blockchain {
    pub blocks: Vec<Block>,
    pub difficulty: u32,
    pub state: LedgerState,
    seed: LedgerState,
    corrupted: bool,
}

impl Blockchain {
    /// Create a ledger holding only the mined genesis block.
    pub fn new(difficulty: u32, seed: LedgerState) -> Result<Self, ChainError> {
        let genesis = Self::create_genesis_block(difficulty)?;
        Ok(Blockchain {
            blocks: vec![genesis],
            difficulty,
            state: seed.clone(),
            seed,
            corrupted: false,
        })
    }

    /// Rebuild a ledger from stored blocks.
    ///
    /// A stored chain that fails verification is kept as-is so it can be
    /// inspected; every append on it is refused with `ChainCorrupted`.
    pub fn from_blocks(blocks: Vec<Block>, difficulty: u32, seed: LedgerState) -> Result<Self, ChainError> {
        if blocks.is_empty() {
            return Self::new(difficulty, seed);
        }

        let (state, corrupted) = match verify_chain(&blocks, difficulty, &seed) {
            Ok(state) => (state, false),
            Err(e) => {
                warn!(error = %e, blocks = blocks.len(), "stored chain failed verification");
                let state = LedgerState::replay(&seed, &blocks).unwrap_or_else(|_| seed.clone());
                (state, true)
            }
        };

        Ok(Blockchain {
            blocks,
            difficulty,
            state,
            seed,
            corrupted,
        })
    }

    fn create_genesis_block(difficulty: u32) -> Result<Block, ChainError> {
        let genesis = Block::with_timestamp(
            0,
            GENESIS_TIMESTAMP,
            GENESIS_PREVIOUS_HASH.to_string(),
            Payload::Message(Message::genesis()),
        );
        let never = AtomicBool::new(false);
        mine_block(genesis, difficulty, &never)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn head(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn get_block(&self, index: u64) -> Option<&Block> {
        self.blocks.get(index as usize)
    }

    pub fn get_balance(&self, account: &str) -> i64 {
        self.state.get_balance(account)
    }

    pub fn seed(&self) -> &LedgerState {
        &self.seed
    }

    pub fn is_valid(&self) -> bool {
        is_valid_chain(&self.blocks)
    }

    /// Set when the chain was loaded from storage and failed full verification.
    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    fn ensure_valid(&self) -> Result<&Block, ChainError> {
        if self.corrupted {
            return Err(ChainError::ChainCorrupted(
                "Stored chain failed verification at load".to_string(),
            ));
        }
        if !self.is_valid() {
            return Err(ChainError::ChainCorrupted(
                "Local chain failed its validity check".to_string(),
            ));
        }
        self.head()
            .ok_or_else(|| ChainError::ChainCorrupted("Local chain is empty".to_string()))
    }

    /// Validate `payload` against current balances and build the next,
    /// still unsealed, block on top of the head. Touches nothing.
    pub fn prepare_block(&self, payload: Payload) -> Result<Block, ChainError> {
        let head = self.ensure_valid()?;
        Self::validate_payload(&payload, &self.state)?;
        Ok(Block::new(head.index + 1, head.hash.clone(), payload))
    }

    fn validate_payload(payload: &Payload, state: &LedgerState) -> Result<(), ChainError> {
        match payload {
            Payload::Message(message) => message.validate(),
            Payload::Transactions(transactions) => validate_transactions(transactions, state),
        }
    }

    /// Append an already sealed block.
    ///
    /// Shared by the local mining path and blocks broadcast by peers. The block
    /// must extend the current head of a valid chain, carry a correct seal, and
    /// its transactions must validate against current balances. On any failure
    /// nothing changes.
    pub fn append_block(&mut self, block: Block) -> Result<(), ChainError> {
        let head = self.ensure_valid()?;

        if block.previous_hash != head.hash || block.index != head.index + 1 {
            return Err(ChainError::StaleOrForked(format!(
                "Block {} does not extend head {} ({})",
                block.index, head.index, head.hash
            )));
        }

        verify_seal(&block, self.difficulty)?;

        let mut next_state = self.state.clone();
        match &block.payload {
            Payload::Message(message) => message.validate()?,
            Payload::Transactions(transactions) => next_state.execute(transactions)?,
        }

        debug!(index = block.index, hash = %block.hash, "block appended");
        self.blocks.push(block);
        self.state = next_state;
        Ok(())
    }

    /// Externally sealed path: a block received from a peer.
    pub fn accept_external_block(&mut self, block: Block) -> Result<(), ChainError> {
        self.append_block(block)
    }

    /// Local path in one call: validate, seal, append.
    pub fn mine_payload(&mut self, payload: Payload, cancel: &AtomicBool) -> Result<Block, ChainError> {
        let candidate = self.prepare_block(payload)?;
        let sealed = mine_block(candidate, self.difficulty, cancel)?;
        self.append_block(sealed.clone())?;
        Ok(sealed)
    }

    /// Replace every block with `blocks`, recomputing balances from scratch.
    pub fn replace_chain(&mut self, blocks: Vec<Block>) -> Result<(), ChainError> {
        let state = verify_chain(&blocks, self.difficulty, &self.seed)?;
        self.replace_verified(blocks, state);
        Ok(())
    }

    /// Swap in a chain already checked with [`Blockchain::verify_candidate`]
    /// together with the balances that check produced.
    pub fn replace_verified(&mut self, blocks: Vec<Block>, state: LedgerState) {
        debug!(length = blocks.len(), "chain replaced");
        self.blocks = blocks;
        self.state = state;
        self.corrupted = false;
    }

    /// Verify a candidate chain under this ledger's difficulty and seed.
    pub fn verify_candidate(&self, blocks: &[Block]) -> Result<LedgerState, ChainError> {
        verify_chain(blocks, self.difficulty, &self.seed)
    }

    /// Every message posted after genesis, oldest first.
    pub fn chat_history(&self) -> Vec<&Message> {
        self.blocks.iter().skip(1).filter_map(Block::message).collect()
    }
}
