use crate::blockchain::{Block, LedgerState};
use crate::error::ChainError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Outcome of one consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Resolution {
    /// The local chain stays as it is.
    Authoritative,
    /// The local chain was swapped for a longer verified peer chain.
    Replaced { length: usize },
}

impl Resolution {
    pub fn replaced(&self) -> bool {
        matches!(self, Resolution::Replaced { .. })
    }
}

/// A chain fetched from one peer.
#[derive(Debug, Clone)]
pub struct PeerChain {
    pub peer: String,
    pub blocks: Vec<Block>,
}

/// The chain a round decided to adopt, with its replayed balances.
#[derive(Debug, Clone)]
pub struct CanonicalChain {
    pub peer: String,
    pub blocks: Vec<Block>,
    pub state: LedgerState,
}

/// Longest-valid-chain selection
pub struct Consensus;

impl Consensus {
    /// Pick the chain to adopt, if any.
    ///
    /// Candidates are examined in ascending peer-address order and only a
    /// chain strictly longer than the best so far can win, so equal length
    /// never replaces and the smallest address wins ties. Every winner must
    /// pass `verify`, which re-checks each block rather than trusting the
    /// peer.
    pub fn select_canonical<F>(
        local_length: usize,
        mut candidates: Vec<PeerChain>,
        verify: F,
    ) -> Option<CanonicalChain>
    where
        F: Fn(&[Block]) -> Result<LedgerState, ChainError>,
    {
        candidates.sort_by(|a, b| a.peer.cmp(&b.peer));

        let mut best_length = local_length;
        let mut best = None;

        for candidate in candidates {
            if candidate.blocks.len() <= best_length {
                debug!(peer = %candidate.peer, length = candidate.blocks.len(), best_length, "peer chain not longer");
                continue;
            }
            match verify(&candidate.blocks) {
                Ok(state) => {
                    best_length = candidate.blocks.len();
                    best = Some(CanonicalChain {
                        peer: candidate.peer,
                        blocks: candidate.blocks,
                        state,
                    });
                }
                Err(e) => {
                    warn!(peer = %candidate.peer, length = candidate.blocks.len(), error = %e, "rejected longer peer chain");
                }
            }
        }

        best
    }
}
