//! Interfaces to the blockchain store and mempool consumed by the wallet.
//!
//! The wallet never validates consensus rules itself; it reads headers,
//! block transactions, commitment tree witnesses and the nullifier set, and
//! delegates transaction verification to the chain's verifier.

use serde::{Deserialize, Serialize};

use crate::primitives::{Asset, AssetId, BlockHash, NoteHash, Nullifier};
use crate::transaction::Transaction;

/// The sequence number of the genesis block.
pub const GENESIS_SEQUENCE: u64 = 1;

/// A block header as the wallet sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: BlockHash,
    pub previous_block_hash: BlockHash,
    pub sequence: u64,
}

impl BlockHeader {
    pub fn locator(&self) -> BlockLocator {
        BlockLocator {
            hash: self.hash,
            sequence: self.sequence,
        }
    }
}

/// A `(hash, sequence)` pair naming the last block applied to a particular
/// scope: an account head or the orchestrator's chain cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocator {
    pub hash: BlockHash,
    pub sequence: u64,
}

/// Which side of the parent a sibling hash sits on in a Merkle
/// authentication path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WitnessSide {
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessNode {
    pub side: WitnessSide,
    pub hash: NoteHash,
}

/// A Merkle authentication path proving a note commitment's inclusion in
/// the global tree at a given tree size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub position: u64,
    pub tree_size: u64,
    pub root_hash: NoteHash,
    pub auth_path: Vec<WitnessNode>,
}

/// A transaction paired with the leaf index of its first output in the
/// global note commitment tree.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockTransaction {
    pub transaction: Transaction,
    pub initial_note_index: u64,
}

/// Errors produced by a chain store backend.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("block {0} not found")]
    BlockNotFound(BlockHash),
    #[error("{0}")]
    Other(String),
}

/// Reasons the chain's verifier rejects a transaction.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("transaction spends a nullifier that is already on the chain")]
    DoubleSpend,
    #[error("transaction reveals the same nullifier twice")]
    DuplicateNullifier,
    #[error("transaction expired at sequence {0}")]
    Expired(u64),
}

/// Read access to the canonical chain, plus its verifier.
pub trait Chain: Send + Sync {
    /// The current head of the canonical chain, if any blocks exist.
    fn head(&self) -> Option<BlockHeader>;

    /// The genesis block, if it exists.
    fn genesis(&self) -> Option<BlockHeader>;

    /// Whether the node considers itself synced with the network.
    fn synced(&self) -> bool;

    /// Whether the block is known, on the canonical chain or a fork.
    fn has_block(&self, hash: &BlockHash) -> Result<bool, ChainError>;

    fn get_header(&self, hash: &BlockHash) -> Result<Option<BlockHeader>, ChainError>;

    /// The canonical header at the given sequence.
    fn get_header_at_sequence(&self, sequence: u64) -> Result<Option<BlockHeader>, ChainError>;

    fn get_block_transactions(
        &self,
        header: &BlockHeader,
    ) -> Result<Vec<BlockTransaction>, ChainError>;

    /// A witness for the note commitment at the given leaf index, or `None`
    /// if one cannot currently be produced.
    fn witness(&self, index: u64) -> Result<Option<Witness>, ChainError>;

    /// Whether the nullifier has been revealed by a connected transaction.
    fn contains_nullifier(&self, nullifier: &Nullifier) -> Result<bool, ChainError>;

    fn get_asset(&self, id: &AssetId) -> Result<Option<Asset>, ChainError>;

    /// Verifies a transaction freshly produced by this wallet before it is
    /// admitted to the mempool.
    fn verify_created_transaction(&self, transaction: &Transaction)
        -> Result<(), VerificationError>;

    /// Verifies a previously created transaction against current chain
    /// state, as done before rebroadcasting.
    fn verify_transaction_add(&self, transaction: &Transaction) -> Result<(), VerificationError>;
}

/// The mempool interface the wallet submits transactions to.
pub trait MemPool: Send + Sync {
    /// Accepts a transaction, returning `false` if it was already known.
    fn accept(&self, transaction: &Transaction) -> Result<bool, ChainError>;
}
