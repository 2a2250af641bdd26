//! Transactions and their unproven precursors.

use serde::{Deserialize, Serialize};

use crate::chain::Witness;
use crate::primitives::{
    Asset, AssetId, EncryptedNote, Note, NoteHash, Nullifier, SpendingKey, TransactionHash,
};

/// A spend revealed by a transaction: the nullifier of the consumed note and
/// the commitment tree anchor the spend was proven against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spend {
    pub nullifier: Nullifier,
    pub root_hash: NoteHash,
    pub tree_size: u64,
}

/// A description of newly minted value for an asset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintDescription {
    pub asset: Asset,
    pub value: u64,
}

/// A description of value removed from circulation for an asset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurnDescription {
    pub asset_id: AssetId,
    pub value: u64,
}

/// A proven transaction as it circulates on the network.
///
/// Output notes are opaque: only holders of the right view keys can recover
/// their contents. A miner's reward transaction carries a negative fee (the
/// block subsidy plus collected fees) and no spends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    hash: TransactionHash,
    fee: i64,
    expiration: u64,
    notes: Vec<EncryptedNote>,
    spends: Vec<Spend>,
    mints: Vec<MintDescription>,
    burns: Vec<BurnDescription>,
}

impl Transaction {
    pub fn new(
        fee: i64,
        expiration: u64,
        notes: Vec<EncryptedNote>,
        spends: Vec<Spend>,
        mints: Vec<MintDescription>,
        burns: Vec<BurnDescription>,
    ) -> Self {
        let hash = Self::compute_hash(fee, expiration, &notes, &spends, &mints, &burns);
        Transaction {
            hash,
            fee,
            expiration,
            notes,
            spends,
            mints,
            burns,
        }
    }

    fn compute_hash(
        fee: i64,
        expiration: u64,
        notes: &[EncryptedNote],
        spends: &[Spend],
        mints: &[MintDescription],
        burns: &[BurnDescription],
    ) -> TransactionHash {
        let mut hasher = blake3::Hasher::new_derive_key("shielded-wallet.transaction.hash.v1");
        hasher.update(&fee.to_le_bytes());
        hasher.update(&expiration.to_le_bytes());
        for note in notes {
            hasher.update(note.commitment().as_bytes());
        }
        for spend in spends {
            hasher.update(spend.nullifier.as_bytes());
            hasher.update(spend.root_hash.as_bytes());
            hasher.update(&spend.tree_size.to_le_bytes());
        }
        for mint in mints {
            hasher.update(mint.asset.id.as_bytes());
            hasher.update(&mint.value.to_le_bytes());
        }
        for burn in burns {
            hasher.update(burn.asset_id.as_bytes());
            hasher.update(&burn.value.to_le_bytes());
        }
        TransactionHash(*hasher.finalize().as_bytes())
    }

    pub fn hash(&self) -> TransactionHash {
        self.hash
    }

    pub fn fee(&self) -> i64 {
        self.fee
    }

    /// The block sequence past which this transaction is invalid and will
    /// not be mined. Zero means it never expires.
    pub fn expiration(&self) -> u64 {
        self.expiration
    }

    pub fn notes(&self) -> &[EncryptedNote] {
        &self.notes
    }

    pub fn spends(&self) -> &[Spend] {
        &self.spends
    }

    pub fn mints(&self) -> &[MintDescription] {
        &self.mints
    }

    pub fn burns(&self) -> &[BurnDescription] {
        &self.burns
    }

    /// Miner reward transactions are the only transactions with a negative
    /// fee. They are recreated from scratch for every block template, so
    /// they have no pending lifetime in the wallet.
    pub fn is_miners_fee(&self) -> bool {
        self.fee < 0
    }
}

/// An unspent note selected to fund a transaction, together with the
/// commitment tree witness proving its inclusion.
#[derive(Clone, Debug, PartialEq)]
pub struct SpendComponents {
    pub note: Note,
    pub witness: Witness,
}

/// An assembled-but-unproven transaction.
///
/// Produced by the wallet's transaction builder and turned into a
/// [`Transaction`] by the worker pool, which derives the spend nullifiers
/// and seals the output notes.
#[derive(Clone, Debug)]
pub struct RawTransaction {
    pub spending_key: SpendingKey,
    pub outputs: Vec<Note>,
    pub spends: Vec<SpendComponents>,
    pub mints: Vec<MintDescription>,
    pub burns: Vec<BurnDescription>,
    pub fee: u64,
    pub expiration: u64,
}

impl RawTransaction {
    /// Proves the transaction. This is the compute-heavy step and is
    /// expected to run on the worker pool.
    pub fn post(&self) -> Transaction {
        let ovk = self.spending_key.outgoing_view_key();
        let notes = self
            .outputs
            .iter()
            .map(|note| EncryptedNote::encrypt(note, &ovk))
            .collect();
        let spends = self
            .spends
            .iter()
            .map(|components| Spend {
                nullifier: components
                    .note
                    .nullifier(&self.spending_key, components.witness.position),
                root_hash: components.witness.root_hash,
                tree_size: components.witness.tree_size,
            })
            .collect();
        Transaction::new(
            self.fee as i64,
            self.expiration,
            notes,
            spends,
            self.mints.clone(),
            self.burns.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;
    use rand_chacha::ChaChaRng;

    #[test]
    fn posting_derives_nullifiers_from_witness_positions() {
        let mut rng = ChaChaRng::seed_from_u64(2);
        let key = SpendingKey::generate(&mut rng);
        let note = Note::new(
            key.public_address(),
            10,
            "",
            AssetId::NATIVE,
            key.public_address(),
            &mut rng,
        );
        let witness = Witness {
            position: 7,
            tree_size: 8,
            root_hash: NoteHash([1; 32]),
            auth_path: vec![],
        };

        let raw = RawTransaction {
            spending_key: key,
            outputs: vec![],
            spends: vec![SpendComponents {
                note: note.clone(),
                witness,
            }],
            mints: vec![],
            burns: vec![],
            fee: 1,
            expiration: 20,
        };
        let transaction = raw.post();

        assert_eq!(transaction.spends().len(), 1);
        assert_eq!(transaction.spends()[0].nullifier, note.nullifier(&key, 7));
        assert_eq!(transaction.fee(), 1);
        assert_eq!(transaction.expiration(), 20);
        assert!(!transaction.is_miners_fee());

        // Posting the same raw transaction twice is deterministic.
        assert_eq!(transaction.hash(), raw.post().hash());
    }

    #[test]
    fn miners_fee_is_detected_by_negative_fee() {
        let mut rng = ChaChaRng::seed_from_u64(3);
        let key = SpendingKey::generate(&mut rng);
        let note = Note::new(
            key.public_address(),
            50,
            "reward",
            AssetId::NATIVE,
            key.public_address(),
            &mut rng,
        );
        let transaction = Transaction::new(
            -50,
            0,
            vec![EncryptedNote::encrypt(&note, &key.outgoing_view_key())],
            vec![],
            vec![],
            vec![],
        );
        assert!(transaction.is_miners_fee());
    }
}
