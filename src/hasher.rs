//! Canonical block hashing for tallychain
//!
//! A block's identity is the SHA-256 digest, hex encoded, of a compact JSON
//! object holding `{index, nonce, payload, previous_hash, timestamp}` with every
//! object's keys emitted in sorted order. Two semantically equal blocks always
//! produce the same bytes regardless of how they were constructed.

use crate::blockchain::{Message, Payload};
use crate::transaction::Transaction;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Hex digest length of SHA-256.
pub const DIGEST_HEX_LEN: usize = 64;

/// Hash the canonical fields of a block.
pub fn hash_fields(
    index: u64,
    timestamp: u64,
    previous_hash: &str,
    payload: &Payload,
    nonce: u64,
) -> String {
    Preimage::new(index, timestamp, previous_hash, payload).digest(nonce)
}

/// Whether a hex digest satisfies the proof-of-work predicate: its first
/// `difficulty` characters are all `'0'`.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

/// The canonical serialization of a block split around its nonce.
///
/// `nonce` sorts between `index` and `payload`, so everything except the
/// nonce digits can be serialized once and reused for every mining attempt.
#[derive(Debug, Clone)]
pub struct Preimage {
    head: Vec<u8>,
    tail: Vec<u8>,
}

impl Preimage {
    pub fn new(index: u64, timestamp: u64, previous_hash: &str, payload: &Payload) -> Self {
        let head = format!("{{\"index\":{},\"nonce\":", index).into_bytes();
        let tail = format!(
            ",\"payload\":{},\"previous_hash\":{},\"timestamp\":{}}}",
            canonical_payload(payload),
            Value::String(previous_hash.to_string()),
            timestamp
        )
        .into_bytes();
        Self { head, tail }
    }

    pub fn digest(&self, nonce: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.head);
        hasher.update(nonce.to_string().as_bytes());
        hasher.update(&self.tail);
        hex::encode(hasher.finalize())
    }

    /// Full canonical bytes for a given nonce.
    pub fn to_bytes(&self, nonce: u64) -> Vec<u8> {
        let mut bytes = self.head.clone();
        bytes.extend_from_slice(nonce.to_string().as_bytes());
        bytes.extend_from_slice(&self.tail);
        bytes
    }
}

fn canonical_payload(payload: &Payload) -> Value {
    match payload {
        Payload::Message(Message { author, text }) => json!({
            "message": { "author": author, "text": text }
        }),
        Payload::Transactions(transactions) => json!({
            "transactions": transactions.iter().map(canonical_transaction).collect::<Vec<_>>()
        }),
    }
}

fn canonical_transaction(tx: &Transaction) -> Value {
    match tx {
        Transaction::Transfer {
            sender,
            receiver,
            amount,
        } => json!({
            "amount": amount,
            "kind": "transfer",
            "receiver": receiver,
            "sender": sender,
        }),
        Transaction::Deposit { account, amount } => json!({
            "account": account,
            "amount": amount,
            "kind": "deposit",
        }),
        Transaction::Withdrawal { account, amount } => json!({
            "account": account,
            "amount": amount,
            "kind": "withdrawal",
        }),
    }
}
