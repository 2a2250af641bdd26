//! In-memory implementations of the wallet's external collaborators, for
//! use in tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use rand::RngCore;

use crate::chain::{
    BlockHeader, BlockTransaction, Chain, ChainError, MemPool, VerificationError, Witness,
    WitnessNode, WitnessSide, GENESIS_SEQUENCE,
};
use crate::primitives::{
    Asset, AssetId, BlockHash, EncryptedNote, Note, NoteHash, Nullifier, PublicAddress,
    SpendingKey, TransactionHash,
};
use crate::transaction::Transaction;

struct StoredBlock {
    header: BlockHeader,
    transactions: Vec<BlockTransaction>,
    leaf_start: usize,
    nullifiers: Vec<Nullifier>,
}

#[derive(Default)]
struct ChainInner {
    blocks: HashMap<BlockHash, StoredBlock>,
    canonical: Vec<BlockHash>,
    leaves: Vec<NoteHash>,
    nullifiers: HashSet<Nullifier>,
    assets: HashMap<AssetId, Asset>,
    synced: bool,
    block_counter: u64,
}

/// A canonical chain with fork support: rewinding keeps the abandoned
/// blocks around so the wallet's reorg path can walk them. Maintains a
/// note commitment tree over all connected outputs and the revealed
/// nullifier set.
pub struct MemoryChain {
    inner: Mutex<ChainInner>,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChain {
    pub fn new() -> Self {
        MemoryChain {
            inner: Mutex::new(ChainInner {
                synced: true,
                ..ChainInner::default()
            }),
        }
    }

    pub fn set_synced(&self, synced: bool) {
        self.inner.lock().unwrap().synced = synced;
    }

    /// Appends a block containing the given transactions to the canonical
    /// chain, assigning note commitment leaves and revealing nullifiers.
    pub fn add_block(&self, transactions: Vec<Transaction>) -> BlockHeader {
        let mut inner = self.inner.lock().unwrap();
        let sequence = inner.canonical.len() as u64 + 1;
        let previous_block_hash = inner
            .canonical
            .last()
            .map(|hash| *hash)
            .unwrap_or(BlockHash([0; 32]));
        inner.block_counter += 1;

        let mut hasher = blake3::Hasher::new_derive_key("shielded-wallet.testing.block.v1");
        hasher.update(&sequence.to_le_bytes());
        hasher.update(previous_block_hash.as_bytes());
        hasher.update(&inner.block_counter.to_le_bytes());
        for transaction in &transactions {
            hasher.update(transaction.hash().as_bytes());
        }
        let hash = BlockHash(*hasher.finalize().as_bytes());

        let header = BlockHeader {
            hash,
            previous_block_hash,
            sequence,
        };

        let leaf_start = inner.leaves.len();
        let mut block_transactions = Vec::with_capacity(transactions.len());
        let mut revealed = Vec::new();
        for transaction in transactions {
            let initial_note_index = inner.leaves.len() as u64;
            for note in transaction.notes() {
                inner.leaves.push(note.commitment());
            }
            for spend in transaction.spends() {
                inner.nullifiers.insert(spend.nullifier);
                revealed.push(spend.nullifier);
            }
            for mint in transaction.mints() {
                inner
                    .assets
                    .insert(mint.asset.id, mint.asset.clone());
            }
            block_transactions.push(BlockTransaction {
                transaction,
                initial_note_index,
            });
        }

        inner.blocks.insert(
            hash,
            StoredBlock {
                header: header.clone(),
                transactions: block_transactions,
                leaf_start,
                nullifiers: revealed,
            },
        );
        inner.canonical.push(hash);
        header
    }

    /// Removes the canonical head, keeping the block around as a fork.
    /// Returns the removed header.
    pub fn rewind_head(&self) -> Option<BlockHeader> {
        let mut inner = self.inner.lock().unwrap();
        let hash = inner.canonical.pop()?;
        let (header, leaf_start, nullifiers) = {
            let block = inner.blocks.get(&hash).expect("canonical block exists");
            (
                block.header.clone(),
                block.leaf_start,
                block.nullifiers.clone(),
            )
        };
        inner.leaves.truncate(leaf_start);
        for nullifier in nullifiers {
            inner.nullifiers.remove(&nullifier);
        }
        Some(header)
    }

    /// Forgets a block entirely, canonical or not. Used to simulate a
    /// pruned store.
    pub fn forget_block(&self, hash: &BlockHash) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocks.remove(hash);
        inner.canonical.retain(|canonical| canonical != hash);
    }
}

fn hash_pair(left: &NoteHash, right: &NoteHash) -> NoteHash {
    let mut hasher = blake3::Hasher::new_derive_key("shielded-wallet.testing.merkle.v1");
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    NoteHash(*hasher.finalize().as_bytes())
}

fn merkle_levels(leaves: &[NoteHash]) -> Vec<Vec<NoteHash>> {
    let mut width = leaves.len().next_power_of_two().max(1);
    let mut level: Vec<NoteHash> = leaves.to_vec();
    level.resize(width, NoteHash([0; 32]));

    let mut levels = vec![level];
    while width > 1 {
        width /= 2;
        let previous = levels.last().expect("at least one level");
        let mut next = Vec::with_capacity(width);
        for pair in previous.chunks(2) {
            next.push(hash_pair(&pair[0], &pair[1]));
        }
        levels.push(next);
    }
    levels
}

impl Chain for MemoryChain {
    fn head(&self) -> Option<BlockHeader> {
        let inner = self.inner.lock().unwrap();
        let hash = inner.canonical.last()?;
        Some(inner.blocks[hash].header.clone())
    }

    fn genesis(&self) -> Option<BlockHeader> {
        let inner = self.inner.lock().unwrap();
        let hash = inner.canonical.first()?;
        Some(inner.blocks[hash].header.clone())
    }

    fn synced(&self) -> bool {
        self.inner.lock().unwrap().synced
    }

    fn has_block(&self, hash: &BlockHash) -> Result<bool, ChainError> {
        Ok(self.inner.lock().unwrap().blocks.contains_key(hash))
    }

    fn get_header(&self, hash: &BlockHash) -> Result<Option<BlockHeader>, ChainError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .blocks
            .get(hash)
            .map(|block| block.header.clone()))
    }

    fn get_header_at_sequence(&self, sequence: u64) -> Result<Option<BlockHeader>, ChainError> {
        let inner = self.inner.lock().unwrap();
        let index = match sequence.checked_sub(GENESIS_SEQUENCE) {
            Some(index) => index as usize,
            None => return Ok(None),
        };
        Ok(inner
            .canonical
            .get(index)
            .map(|hash| inner.blocks[hash].header.clone()))
    }

    fn get_block_transactions(
        &self,
        header: &BlockHeader,
    ) -> Result<Vec<BlockTransaction>, ChainError> {
        let inner = self.inner.lock().unwrap();
        let block = inner
            .blocks
            .get(&header.hash)
            .ok_or(ChainError::BlockNotFound(header.hash))?;
        Ok(block.transactions.clone())
    }

    fn witness(&self, index: u64) -> Result<Option<Witness>, ChainError> {
        let inner = self.inner.lock().unwrap();
        let position = index as usize;
        if position >= inner.leaves.len() {
            return Ok(None);
        }

        let levels = merkle_levels(&inner.leaves);
        let mut auth_path = Vec::with_capacity(levels.len() - 1);
        let mut cursor = position;
        for level in &levels[..levels.len() - 1] {
            let sibling = cursor ^ 1;
            auth_path.push(WitnessNode {
                side: if sibling < cursor {
                    WitnessSide::Left
                } else {
                    WitnessSide::Right
                },
                hash: level[sibling],
            });
            cursor /= 2;
        }

        Ok(Some(Witness {
            position: index,
            tree_size: inner.leaves.len() as u64,
            root_hash: levels.last().expect("root level")[0],
            auth_path,
        }))
    }

    fn contains_nullifier(&self, nullifier: &Nullifier) -> Result<bool, ChainError> {
        Ok(self.inner.lock().unwrap().nullifiers.contains(nullifier))
    }

    fn get_asset(&self, id: &AssetId) -> Result<Option<Asset>, ChainError> {
        Ok(self.inner.lock().unwrap().assets.get(id).cloned())
    }

    fn verify_created_transaction(
        &self,
        transaction: &Transaction,
    ) -> Result<(), VerificationError> {
        let inner = self.inner.lock().unwrap();
        let mut seen = HashSet::new();
        for spend in transaction.spends() {
            if !seen.insert(spend.nullifier) {
                return Err(VerificationError::DuplicateNullifier);
            }
            if inner.nullifiers.contains(&spend.nullifier) {
                return Err(VerificationError::DoubleSpend);
            }
        }
        Ok(())
    }

    fn verify_transaction_add(&self, transaction: &Transaction) -> Result<(), VerificationError> {
        self.verify_created_transaction(transaction)?;
        let head_sequence = self.head().map(|head| head.sequence).unwrap_or(0);
        let expiration = transaction.expiration();
        if expiration != 0 && expiration <= head_sequence {
            return Err(VerificationError::Expired(expiration));
        }
        Ok(())
    }
}

/// A mempool that remembers what it accepted.
#[derive(Default)]
pub struct MemoryMemPool {
    transactions: Mutex<HashMap<TransactionHash, Transaction>>,
}

impl MemoryMemPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, hash: &TransactionHash) -> bool {
        self.transactions.lock().unwrap().contains_key(hash)
    }

    pub fn count(&self) -> usize {
        self.transactions.lock().unwrap().len()
    }
}

impl MemPool for MemoryMemPool {
    fn accept(&self, transaction: &Transaction) -> Result<bool, ChainError> {
        let mut transactions = self.transactions.lock().unwrap();
        Ok(transactions
            .insert(transaction.hash(), transaction.clone())
            .is_none())
    }
}

/// A miner reward paying `value` of the native asset to `recipient`. The
/// fee is the negated reward, as on the real chain.
pub fn miners_fee_transaction<R: RngCore>(
    recipient: &PublicAddress,
    value: u64,
    rng: &mut R,
) -> Transaction {
    let miner = SpendingKey::generate(rng);
    let note = Note::new(
        *recipient,
        value,
        "",
        AssetId::NATIVE,
        miner.public_address(),
        rng,
    );
    Transaction::new(
        -(value as i64),
        0,
        vec![EncryptedNote::encrypt(&note, &miner.outgoing_view_key())],
        vec![],
        vec![],
        vec![],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;
    use rand_chacha::ChaChaRng;

    fn fold_path(leaf: NoteHash, path: &[WitnessNode]) -> NoteHash {
        path.iter().fold(leaf, |current, node| match node.side {
            WitnessSide::Left => hash_pair(&node.hash, &current),
            WitnessSide::Right => hash_pair(&current, &node.hash),
        })
    }

    #[test]
    fn witness_paths_recompute_the_root() {
        let mut rng = ChaChaRng::seed_from_u64(21);
        let chain = MemoryChain::new();
        let recipient = SpendingKey::generate(&mut rng).public_address();

        chain.add_block(vec![
            miners_fee_transaction(&recipient, 10, &mut rng),
            miners_fee_transaction(&recipient, 20, &mut rng),
        ]);
        chain.add_block(vec![miners_fee_transaction(&recipient, 30, &mut rng)]);

        for index in 0..3 {
            let witness = chain.witness(index).unwrap().unwrap();
            assert_eq!(witness.tree_size, 3);
            let inner = chain.inner.lock().unwrap();
            assert_eq!(
                fold_path(inner.leaves[index as usize], &witness.auth_path),
                witness.root_hash,
            );
        }
        assert!(chain.witness(3).unwrap().is_none());
    }

    #[test]
    fn rewinding_keeps_forks_and_restores_tree_state() {
        let mut rng = ChaChaRng::seed_from_u64(22);
        let chain = MemoryChain::new();
        let recipient = SpendingKey::generate(&mut rng).public_address();

        let one = chain.add_block(vec![miners_fee_transaction(&recipient, 10, &mut rng)]);
        let two = chain.add_block(vec![miners_fee_transaction(&recipient, 20, &mut rng)]);

        assert_eq!(chain.rewind_head().map(|h| h.hash), Some(two.hash));
        assert_eq!(chain.head().map(|h| h.hash), Some(one.hash));
        // The rewound block is still known, off the canonical chain.
        assert!(chain.has_block(&two.hash).unwrap());
        assert!(chain
            .get_header_at_sequence(2)
            .unwrap()
            .is_none());
        assert!(chain.witness(1).unwrap().is_none());

        let two_prime = chain.add_block(vec![miners_fee_transaction(&recipient, 25, &mut rng)]);
        assert_ne!(two_prime.hash, two.hash);
        assert_eq!(two_prime.sequence, 2);
    }
}
