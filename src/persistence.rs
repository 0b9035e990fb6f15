//! Database persistence layer for tallychain
//!
//! Only blocks and peer addresses are stored. Balances are always replayed
//! from the blocks and the pending pool is never written.

use crate::blockchain::{Block, Payload};
use crate::error::ChainError;
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

/// Abstraction for persistence backends.
pub trait Persistence: Send + Sync {
    /// Store one appended block.
    fn save_block(&self, block: &Block) -> Result<(), ChainError>;
    /// Atomically replace every stored block.
    fn replace_chain(&self, blocks: &[Block]) -> Result<(), ChainError>;
    /// All stored blocks in index order. Empty when nothing was stored yet.
    fn load_chain(&self) -> Result<Vec<Block>, ChainError>;
    fn save_peer(&self, address: &str) -> Result<(), ChainError>;
    fn remove_peer(&self, address: &str) -> Result<(), ChainError>;
    fn load_peers(&self) -> Result<Vec<String>, ChainError>;
}

fn poisoned<T>(_: T) -> ChainError {
    ChainError::DatabaseError("Mutex poisoned".to_string())
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database. `":memory:"` gives a throwaway one.
    pub fn open(path: &str) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                block_index INTEGER PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                previous_hash TEXT NOT NULL,
                payload TEXT NOT NULL,
                nonce INTEGER NOT NULL,
                hash TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create blocks table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS peers (
                address TEXT PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create peers table: {}", e)))?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    fn insert_block(conn: &Connection, block: &Block) -> Result<(), ChainError> {
        let payload_json = serde_json::to_string(&block.payload).map_err(|e| {
            ChainError::DatabaseError(format!("Failed to serialize payload: {}", e))
        })?;
        conn.execute(
            "INSERT OR REPLACE INTO blocks (block_index, timestamp, previous_hash, payload, nonce, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                block.index as i64,
                block.timestamp as i64,
                block.previous_hash,
                payload_json,
                // stored as the raw bit pattern so nonces above i64::MAX survive
                block.nonce as i64,
                block.hash,
            ],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save block: {}", e)))?;
        Ok(())
    }
}

impl Persistence for Database {
    fn save_block(&self, block: &Block) -> Result<(), ChainError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        Self::insert_block(&conn, block)
    }

    fn replace_chain(&self, blocks: &[Block]) -> Result<(), ChainError> {
        let conn_guard = self.conn.lock().map_err(poisoned)?;
        let tx = conn_guard.unchecked_transaction().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to start transaction: {}", e))
        })?;

        tx.execute("DELETE FROM blocks", [])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to clear blocks: {}", e)))?;
        for block in blocks {
            Self::insert_block(&tx, block)?;
        }

        tx.commit().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to commit transaction: {}", e))
        })?;
        Ok(())
    }

    fn load_chain(&self) -> Result<Vec<Block>, ChainError> {
        let conn_guard = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn_guard
            .prepare(
                "SELECT block_index, timestamp, previous_hash, payload, nonce, hash
                 FROM blocks ORDER BY block_index ASC",
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                let index: i64 = row.get(0)?;
                let timestamp: i64 = row.get(1)?;
                let previous_hash: String = row.get(2)?;
                let payload_json: String = row.get(3)?;
                let nonce: i64 = row.get(4)?;
                let hash: String = row.get(5)?;
                Ok((index, timestamp, previous_hash, payload_json, nonce, hash))
            })
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query blocks: {}", e)))?;

        let mut blocks = Vec::new();
        for row in rows {
            let (index, timestamp, previous_hash, payload_json, nonce, hash) =
                row.map_err(|e| ChainError::DatabaseError(format!("Failed to load block: {}", e)))?;
            let payload: Payload = serde_json::from_str(&payload_json).map_err(|e| {
                ChainError::DatabaseError(format!("Failed to deserialize block {}: {}", index, e))
            })?;
            blocks.push(Block {
                index: index as u64,
                timestamp: timestamp as u64,
                previous_hash,
                payload,
                nonce: nonce as u64,
                hash,
            });
        }
        Ok(blocks)
    }

    fn save_peer(&self, address: &str) -> Result<(), ChainError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute(
            "INSERT OR IGNORE INTO peers (address) VALUES (?1)",
            params![address],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save peer: {}", e)))?;
        Ok(())
    }

    fn remove_peer(&self, address: &str) -> Result<(), ChainError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute("DELETE FROM peers WHERE address = ?1", params![address])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to remove peer: {}", e)))?;
        Ok(())
    }

    fn load_peers(&self) -> Result<Vec<String>, ChainError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn
            .prepare("SELECT address FROM peers ORDER BY address ASC")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query peers: {}", e)))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to load peer: {}", e)))
    }
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    pub blocks: Arc<Mutex<Vec<Block>>>,
    pub peers: Arc<Mutex<Vec<String>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for InMemoryPersistence {
    fn save_block(&self, block: &Block) -> Result<(), ChainError> {
        let mut blocks = self.blocks.lock().map_err(poisoned)?;
        blocks.retain(|b| b.index != block.index);
        blocks.push(block.clone());
        blocks.sort_by_key(|b| b.index);
        Ok(())
    }

    fn replace_chain(&self, new_blocks: &[Block]) -> Result<(), ChainError> {
        let mut blocks = self.blocks.lock().map_err(poisoned)?;
        *blocks = new_blocks.to_vec();
        Ok(())
    }

    fn load_chain(&self) -> Result<Vec<Block>, ChainError> {
        Ok(self.blocks.lock().map_err(poisoned)?.clone())
    }

    fn save_peer(&self, address: &str) -> Result<(), ChainError> {
        let mut peers = self.peers.lock().map_err(poisoned)?;
        if !peers.iter().any(|p| p == address) {
            peers.push(address.to_string());
            peers.sort();
        }
        Ok(())
    }

    fn remove_peer(&self, address: &str) -> Result<(), ChainError> {
        self.peers.lock().map_err(poisoned)?.retain(|p| p != address);
        Ok(())
    }

    fn load_peers(&self) -> Result<Vec<String>, ChainError> {
        Ok(self.peers.lock().map_err(poisoned)?.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{Blockchain, LedgerState, Message};
    use crate::transaction::Transaction;
    use std::sync::atomic::AtomicBool;

    fn sample_chain() -> Blockchain {
        let mut chain = Blockchain::new(
            1,
            LedgerState::from_seed([("Alice".to_string(), 1000)]),
        )
        .unwrap();
        let cancel = AtomicBool::new(false);
        chain
            .mine_payload(
                Payload::Transactions(vec![Transaction::transfer("Alice", "Bob", 10)]),
                &cancel,
            )
            .unwrap();
        chain
            .mine_payload(Payload::Message(Message::new("ann", "hi")), &cancel)
            .unwrap();
        chain
    }

    #[test]
    fn test_database_open() {
        let db = Database::open(":memory:").unwrap();
        assert!(db.conn.lock().unwrap().is_autocommit());
        assert!(db.load_chain().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.db");
        let chain = sample_chain();

        {
            let db = Database::open(path.to_str().unwrap()).unwrap();
            for block in &chain.blocks {
                db.save_block(block).unwrap();
            }
        }

        let db = Database::open(path.to_str().unwrap()).unwrap();
        let loaded = db.load_chain().unwrap();
        assert_eq!(loaded, chain.blocks);
        let reloaded = Blockchain::from_blocks(loaded, 1, chain.seed().clone()).unwrap();
        assert_eq!(reloaded.state, chain.state);
    }

    #[test]
    fn test_replace_chain_is_total() {
        let db = Database::open(":memory:").unwrap();
        let chain = sample_chain();
        for block in &chain.blocks {
            db.save_block(block).unwrap();
        }
        db.replace_chain(&chain.blocks[..1]).unwrap();
        assert_eq!(db.load_chain().unwrap(), chain.blocks[..1].to_vec());
    }

    #[test]
    fn test_peers_roundtrip() {
        let db = Database::open(":memory:").unwrap();
        db.save_peer("b:2").unwrap();
        db.save_peer("a:1").unwrap();
        db.save_peer("a:1").unwrap();
        assert_eq!(db.load_peers().unwrap(), vec!["a:1", "b:2"]);
        db.remove_peer("a:1").unwrap();
        assert_eq!(db.load_peers().unwrap(), vec!["b:2"]);
    }

    #[test]
    fn test_in_memory_backend() {
        let store = InMemoryPersistence::new();
        let chain = sample_chain();
        store.save_block(&chain.blocks[1]).unwrap();
        store.save_block(&chain.blocks[0]).unwrap();
        assert_eq!(store.load_chain().unwrap(), chain.blocks[..2].to_vec());
        store.replace_chain(&chain.blocks).unwrap();
        assert_eq!(store.load_chain().unwrap().len(), 3);

        store.save_peer("x:1").unwrap();
        store.save_peer("x:1").unwrap();
        assert_eq!(store.load_peers().unwrap(), vec!["x:1"]);
    }
}
