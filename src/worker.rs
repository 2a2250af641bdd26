//! Offloads compute-heavy cryptographic work to blocking threads.
//!
//! The wallet's event loop and scan paths are cooperative; trial decryption
//! of every note of every block and transaction proving would starve them,
//! so both run through [`WorkerPool`] and are awaited from async context.

use serde::{Deserialize, Serialize};

use crate::primitives::{
    EncryptedNote, IncomingViewKey, Note, NoteHash, Nullifier, OutgoingViewKey, SpendingKey,
};
use crate::transaction::{RawTransaction, Transaction};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One trial-decryption work item: a sealed note plus the key material of
/// the account to check it against.
///
/// `current_note_index` is the note's leaf position in the global commitment
/// tree; it is `None` for transactions that have not been mined, in which
/// case no nullifier can be derived either.
#[derive(Clone, Debug)]
pub struct DecryptNotesItem {
    pub serialized_note: EncryptedNote,
    pub incoming_view_key: IncomingViewKey,
    pub outgoing_view_key: OutgoingViewKey,
    pub spending_key: SpendingKey,
    pub current_note_index: Option<u64>,
}

/// A successfully decrypted note.
///
/// `for_spender` records which view key matched: `false` when the incoming
/// view key recognized a note addressed to the account, `true` when the
/// outgoing view key recognized the spender copy of a note the account sent
/// elsewhere.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecryptedNote {
    pub hash: NoteHash,
    pub note: Note,
    pub index: Option<u64>,
    pub nullifier: Option<Nullifier>,
    pub for_spender: bool,
}

fn decrypt_note(item: &DecryptNotesItem) -> Option<DecryptedNote> {
    if let Some(note) = item.serialized_note.decrypt_for_owner(&item.incoming_view_key) {
        let nullifier = item
            .current_note_index
            .map(|index| note.nullifier(&item.spending_key, index));
        return Some(DecryptedNote {
            hash: note.hash(),
            note,
            index: item.current_note_index,
            nullifier,
            for_spender: false,
        });
    }

    if let Some(note) = item.serialized_note.decrypt_for_spender(&item.outgoing_view_key) {
        return Some(DecryptedNote {
            hash: note.hash(),
            note,
            index: item.current_note_index,
            nullifier: None,
            for_spender: true,
        });
    }

    None
}

/// Handle to the shared pool of blocking workers.
#[derive(Clone, Debug, Default)]
pub struct WorkerPool;

impl WorkerPool {
    pub fn new() -> Self {
        WorkerPool
    }

    /// Attempts to decrypt each item, returning one result per item in
    /// order. Items that no key matched yield `None`.
    pub async fn decrypt_notes(
        &self,
        items: Vec<DecryptNotesItem>,
    ) -> Result<Vec<Option<DecryptedNote>>, WorkerError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let results =
            tokio::task::spawn_blocking(move || items.iter().map(decrypt_note).collect()).await?;
        Ok(results)
    }

    /// Proves a raw transaction, producing the final [`Transaction`].
    pub async fn post_transaction(
        &self,
        raw: RawTransaction,
    ) -> Result<Transaction, WorkerError> {
        Ok(tokio::task::spawn_blocking(move || raw.post()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;
    use rand_chacha::ChaChaRng;

    use crate::primitives::AssetId;

    #[tokio::test]
    async fn decrypts_owned_and_sent_notes() {
        let mut rng = ChaChaRng::seed_from_u64(7);
        let sender = SpendingKey::generate(&mut rng);
        let recipient = SpendingKey::generate(&mut rng);

        let note = Note::new(
            recipient.public_address(),
            25,
            "hello",
            AssetId::NATIVE,
            sender.public_address(),
            &mut rng,
        );
        let sealed = EncryptedNote::encrypt(&note, &sender.outgoing_view_key());

        let item_for = |key: &SpendingKey, index| DecryptNotesItem {
            serialized_note: sealed.clone(),
            incoming_view_key: key.incoming_view_key(),
            outgoing_view_key: key.outgoing_view_key(),
            spending_key: *key,
            current_note_index: index,
        };

        let pool = WorkerPool::new();
        let results = pool
            .decrypt_notes(vec![
                item_for(&recipient, Some(4)),
                item_for(&sender, Some(4)),
                item_for(&SpendingKey::generate(&mut rng), Some(4)),
                item_for(&recipient, None),
            ])
            .await
            .unwrap();

        let received = results[0].as_ref().unwrap();
        assert!(!received.for_spender);
        assert_eq!(received.index, Some(4));
        assert_eq!(received.nullifier, Some(note.nullifier(&recipient, 4)));
        assert_eq!(received.hash, note.hash());

        let sent = results[1].as_ref().unwrap();
        assert!(sent.for_spender);
        assert_eq!(sent.nullifier, None);

        assert!(results[2].is_none());

        let pending = results[3].as_ref().unwrap();
        assert_eq!(pending.index, None);
        assert_eq!(pending.nullifier, None);
    }
}
