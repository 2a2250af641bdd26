//! Per-account wallet state.
//!
//! An [`Account`] owns its decrypted notes, nullifier mappings, balances,
//! head pointer and pending/expired transaction queues, all persisted in
//! the wallet store under the account's id. The state-transition methods
//! (`connect_transaction`, `disconnect_transaction`,
//! `add_pending_transaction`, `expire_transaction`) are the only code that
//! mutates those rows, and each runs inside a store transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chain::{BlockHeader, BlockLocator, GENESIS_SEQUENCE};
use crate::error::{Error, Result};
use crate::primitives::{
    AssetId, IncomingViewKey, Note, NoteHash, OutgoingViewKey, PublicAddress, SpendingKey,
    TransactionHash,
};
use crate::store::{
    AccountRecord, BalanceRecord, DecryptedNoteRecord, TransactionRecord, WalletDb, WalletTxn,
};
use crate::transaction::Transaction;
use crate::worker::DecryptedNote;
use crate::AccountId;

/// The balance of one asset from the account's point of view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub asset_id: AssetId,
    /// Running total over connected, unspent notes.
    pub unconfirmed: u64,
    /// The portion of `unconfirmed` buried at least the requested number of
    /// confirmations below the account head.
    pub confirmed: u64,
}

#[derive(Debug)]
pub struct Account {
    id: AccountId,
    name: String,
    spending_key: SpendingKey,
    incoming_view_key: IncomingViewKey,
    outgoing_view_key: OutgoingViewKey,
    public_address: PublicAddress,
    store: Arc<WalletDb>,
}

impl Account {
    pub(crate) fn new(record: AccountRecord, store: Arc<WalletDb>) -> Self {
        Account {
            id: record.id,
            name: record.name,
            spending_key: record.spending_key,
            incoming_view_key: record.incoming_view_key,
            outgoing_view_key: record.outgoing_view_key,
            public_address: record.public_address,
            store,
        }
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spending_key(&self) -> &SpendingKey {
        &self.spending_key
    }

    pub fn incoming_view_key(&self) -> &IncomingViewKey {
        &self.incoming_view_key
    }

    pub fn outgoing_view_key(&self) -> &OutgoingViewKey {
        &self.outgoing_view_key
    }

    pub fn public_address(&self) -> &PublicAddress {
        &self.public_address
    }

    pub fn record(&self) -> AccountRecord {
        AccountRecord {
            id: self.id,
            name: self.name.clone(),
            spending_key: self.spending_key,
            incoming_view_key: self.incoming_view_key,
            outgoing_view_key: self.outgoing_view_key,
            public_address: self.public_address,
        }
    }

    fn owns(&self, note: &Note) -> bool {
        note.owner == self.public_address
    }

    /// The latest block whose notes and nullifiers have been applied to
    /// this account, or `None` if it has never been scanned.
    pub async fn head(&self) -> Option<BlockLocator> {
        self.store.head(self.id).await
    }

    pub(crate) fn update_head(&self, head: Option<BlockLocator>, txn: &mut WalletTxn<'_>) {
        txn.put_head(self.id, head);
    }

    /// Applies one transaction of a connected block: assigns leaf indexes
    /// and nullifiers to decrypted notes, marks spent notes, confirms any
    /// pending record, and updates balances. Called for every transaction
    /// of the block; transactions that touch nothing of this account's are
    /// a no-op.
    pub(crate) fn connect_transaction(
        &self,
        header: &BlockHeader,
        transaction: &Transaction,
        decrypted_notes: &[DecryptedNote],
        txn: &mut WalletTxn<'_>,
    ) -> Result<()> {
        let mut deltas: BTreeMap<AssetId, i128> = BTreeMap::new();

        for decrypted in decrypted_notes {
            match txn.note(self.id, decrypted.hash) {
                Some(mut record) => {
                    if record.index.is_none() {
                        record.index = decrypted.index;
                        record.nullifier = decrypted.nullifier;
                        if let Some(nullifier) = decrypted.nullifier {
                            txn.put_nullifier(self.id, nullifier, decrypted.hash);
                        }
                        if !record.spent && self.owns(&record.note) {
                            *deltas.entry(record.note.asset_id).or_default() +=
                                record.note.value as i128;
                        }
                        txn.put_note(self.id, decrypted.hash, record);
                    }
                }
                None => {
                    let record = DecryptedNoteRecord {
                        note: decrypted.note.clone(),
                        index: decrypted.index,
                        nullifier: decrypted.nullifier,
                        spent: false,
                        transaction_hash: transaction.hash(),
                    };
                    if let Some(nullifier) = decrypted.nullifier {
                        txn.put_nullifier(self.id, nullifier, decrypted.hash);
                    }
                    if record.index.is_some() && !decrypted.for_spender {
                        *deltas.entry(record.note.asset_id).or_default() +=
                            record.note.value as i128;
                    }
                    txn.put_note(self.id, decrypted.hash, record);
                }
            }
        }

        let mut spent_any = false;
        for spend in transaction.spends() {
            let Some(note_hash) = txn.nullifier_to_note(self.id, spend.nullifier) else {
                continue;
            };
            spent_any = true;
            let mut record = txn.note(self.id, note_hash).ok_or_else(|| {
                Error::CorruptedData(format!("nullifier maps to missing note {note_hash}"))
            })?;
            if !record.spent {
                record.spent = true;
                if record.index.is_some() && self.owns(&record.note) {
                    *deltas.entry(record.note.asset_id).or_default() -=
                        record.note.value as i128;
                }
                txn.put_note(self.id, note_hash, record);
            }
        }

        let existing = txn.transaction(self.id, transaction.hash());
        if !decrypted_notes.is_empty() || spent_any || existing.is_some() {
            if let Some(previous) = &existing {
                if previous.is_pending() {
                    txn.remove_pending(self.id, previous.expiration(), transaction.hash());
                }
            }
            txn.put_transaction(
                self.id,
                transaction.hash(),
                TransactionRecord {
                    transaction: transaction.clone(),
                    block_hash: Some(header.hash),
                    sequence: Some(header.sequence),
                    submitted_sequence: existing
                        .map(|record| record.submitted_sequence)
                        .unwrap_or(header.sequence),
                },
            );
        }

        self.apply_balance_deltas(deltas, Some(header.locator()), txn)
    }

    /// Reverses [`Account::connect_transaction`] for a disconnected block:
    /// notes lose their indexes and nullifiers, and the record returns to
    /// the pending queue. Notes the transaction spends stay marked spent;
    /// the now-pending transaction still claims them, and they are only
    /// released if it expires.
    pub(crate) fn disconnect_transaction(
        &self,
        header: &BlockHeader,
        transaction: &Transaction,
        txn: &mut WalletTxn<'_>,
    ) -> Result<()> {
        let Some(mut record) = txn.transaction(self.id, transaction.hash()) else {
            return Ok(());
        };
        let mut deltas: BTreeMap<AssetId, i128> = BTreeMap::new();

        for (note_hash, mut note_record) in txn.notes_for_transaction(self.id, transaction.hash())
        {
            if note_record.index.is_none() {
                continue;
            }
            if !note_record.spent && self.owns(&note_record.note) {
                *deltas.entry(note_record.note.asset_id).or_default() -=
                    note_record.note.value as i128;
            }
            if let Some(nullifier) = note_record.nullifier {
                txn.delete_nullifier(self.id, nullifier);
            }
            note_record.index = None;
            note_record.nullifier = None;
            txn.put_note(self.id, note_hash, note_record);
        }

        record.block_hash = None;
        record.sequence = None;
        txn.add_pending(self.id, record.expiration(), transaction.hash());
        txn.put_transaction(self.id, transaction.hash(), record);

        let restored_head = if header.sequence == GENESIS_SEQUENCE {
            None
        } else {
            Some(BlockLocator {
                hash: header.previous_block_hash,
                sequence: header.sequence - 1,
            })
        };
        self.apply_balance_deltas(deltas, restored_head, txn)
    }

    /// Removes a transaction and its notes entirely. Used for miner reward
    /// transactions on disconnect, which have no pending lifetime.
    pub(crate) fn delete_transaction(
        &self,
        transaction: &Transaction,
        txn: &mut WalletTxn<'_>,
    ) -> Result<()> {
        let Some(record) = txn.transaction(self.id, transaction.hash()) else {
            return Ok(());
        };
        let mut deltas: BTreeMap<AssetId, i128> = BTreeMap::new();

        for (note_hash, note_record) in txn.notes_for_transaction(self.id, transaction.hash()) {
            if note_record.index.is_some() && !note_record.spent && self.owns(&note_record.note) {
                *deltas.entry(note_record.note.asset_id).or_default() -=
                    note_record.note.value as i128;
            }
            if let Some(nullifier) = note_record.nullifier {
                txn.delete_nullifier(self.id, nullifier);
            }
            txn.delete_note(self.id, note_hash);
        }

        txn.remove_pending(self.id, record.expiration(), transaction.hash());
        txn.delete_transaction(self.id, transaction.hash());

        let head = txn.head(self.id);
        self.apply_balance_deltas(deltas, head, txn)
    }

    /// Records a transaction this wallet just submitted (or observed before
    /// it was mined): output notes are stored without indexes, and the
    /// notes it spends are marked spent immediately so they cannot be
    /// selected twice.
    pub(crate) async fn add_pending_transaction(
        &self,
        transaction: &Transaction,
        decrypted_notes: &[DecryptedNote],
        submitted_sequence: u64,
    ) -> Result<()> {
        let mut txn = self.store.begin().await;
        let mut deltas: BTreeMap<AssetId, i128> = BTreeMap::new();

        let mut spent_any = false;
        for spend in transaction.spends() {
            let Some(note_hash) = txn.nullifier_to_note(self.id, spend.nullifier) else {
                continue;
            };
            spent_any = true;
            let mut record = txn.note(self.id, note_hash).ok_or_else(|| {
                Error::CorruptedData(format!("nullifier maps to missing note {note_hash}"))
            })?;
            if !record.spent {
                record.spent = true;
                if record.index.is_some() && self.owns(&record.note) {
                    *deltas.entry(record.note.asset_id).or_default() -=
                        record.note.value as i128;
                }
                txn.put_note(self.id, note_hash, record);
            }
        }

        if decrypted_notes.is_empty() && !spent_any {
            return Ok(());
        }

        for decrypted in decrypted_notes {
            if txn.note(self.id, decrypted.hash).is_none() {
                txn.put_note(
                    self.id,
                    decrypted.hash,
                    DecryptedNoteRecord {
                        note: decrypted.note.clone(),
                        index: None,
                        nullifier: None,
                        spent: false,
                        transaction_hash: transaction.hash(),
                    },
                );
            }
        }

        txn.put_transaction(
            self.id,
            transaction.hash(),
            TransactionRecord {
                transaction: transaction.clone(),
                block_hash: None,
                sequence: None,
                submitted_sequence,
            },
        );
        txn.add_pending(self.id, transaction.expiration(), transaction.hash());

        let head = txn.head(self.id);
        self.apply_balance_deltas(deltas, head, &mut txn)?;
        txn.commit();
        Ok(())
    }

    /// Expires a pending transaction: its spends are released back to the
    /// spendable set and its never-mined output notes are deleted. The
    /// record itself is kept; its status derives to expired.
    pub(crate) async fn expire_transaction(&self, record: &TransactionRecord) -> Result<()> {
        let mut txn = self.store.begin().await;
        // Re-read under the transaction: the record may have been confirmed
        // since the expiry snapshot was taken.
        let Some(current) = txn.transaction(self.id, record.transaction.hash()) else {
            return Ok(());
        };
        if !current.is_pending() {
            return Ok(());
        }
        let transaction = &current.transaction;
        let mut deltas: BTreeMap<AssetId, i128> = BTreeMap::new();

        for spend in transaction.spends() {
            let Some(note_hash) = txn.nullifier_to_note(self.id, spend.nullifier) else {
                continue;
            };
            let mut note_record = txn.note(self.id, note_hash).ok_or_else(|| {
                Error::CorruptedData(format!("nullifier maps to missing note {note_hash}"))
            })?;
            if note_record.spent {
                note_record.spent = false;
                if note_record.index.is_some() && self.owns(&note_record.note) {
                    *deltas.entry(note_record.note.asset_id).or_default() +=
                        note_record.note.value as i128;
                }
                txn.put_note(self.id, note_hash, note_record);
            }
        }

        for (note_hash, note_record) in txn.notes_for_transaction(self.id, transaction.hash()) {
            if note_record.index.is_none() {
                txn.delete_note(self.id, note_hash);
            }
        }

        txn.remove_pending(self.id, transaction.expiration(), transaction.hash());

        let head = txn.head(self.id);
        self.apply_balance_deltas(deltas, head, &mut txn)?;
        txn.commit();
        Ok(())
    }

    /// Marks a note spent outside the normal connect path, when its
    /// nullifier is discovered on the chain during spend selection.
    pub(crate) fn mark_note_spent(&self, note_hash: NoteHash, txn: &mut WalletTxn<'_>) -> Result<()> {
        let Some(mut record) = txn.note(self.id, note_hash) else {
            return Ok(());
        };
        if record.spent {
            return Ok(());
        }
        record.spent = true;
        let mut deltas: BTreeMap<AssetId, i128> = BTreeMap::new();
        if record.index.is_some() && self.owns(&record.note) {
            *deltas.entry(record.note.asset_id).or_default() -= record.note.value as i128;
        }
        txn.put_note(self.id, note_hash, record);
        let head = txn.head(self.id);
        self.apply_balance_deltas(deltas, head, txn)
    }

    fn apply_balance_deltas(
        &self,
        deltas: BTreeMap<AssetId, i128>,
        confirmed_at: Option<BlockLocator>,
        txn: &mut WalletTxn<'_>,
    ) -> Result<()> {
        for (asset_id, delta) in deltas {
            if delta == 0 {
                continue;
            }
            let record = txn.balance(self.id, asset_id);
            let unconfirmed = (record.unconfirmed as i128)
                .checked_add(delta)
                .and_then(|value| u64::try_from(value).ok())
                .ok_or_else(|| {
                    Error::CorruptedData(format!("balance for asset {asset_id} out of range"))
                })?;
            txn.put_balance(
                self.id,
                asset_id,
                BalanceRecord {
                    unconfirmed,
                    confirmed_at,
                },
            );
        }
        Ok(())
    }

    /// The account's spendable notes for one asset, at the given
    /// confirmation depth.
    pub async fn unspent_notes(
        &self,
        asset_id: AssetId,
        confirmations: u64,
    ) -> Vec<(NoteHash, DecryptedNoteRecord)> {
        let head_sequence = self.head().await.map(|head| head.sequence).unwrap_or(0);
        self.store
            .unspent_notes(self.id, asset_id, head_sequence, confirmations)
            .await
    }

    pub async fn note(&self, hash: NoteHash) -> Option<DecryptedNoteRecord> {
        self.store.note(self.id, hash).await
    }

    pub async fn notes(&self) -> Vec<(NoteHash, DecryptedNoteRecord)> {
        self.store.notes(self.id).await
    }

    pub async fn transaction(&self, hash: TransactionHash) -> Option<TransactionRecord> {
        self.store.transaction(self.id, hash).await
    }

    pub async fn pending_transactions(&self) -> Vec<TransactionRecord> {
        self.store.pending_transactions(self.id).await
    }

    pub(crate) async fn expired_transactions(&self, head_sequence: u64) -> Vec<TransactionRecord> {
        self.store.expired_transactions(self.id, head_sequence).await
    }

    /// The balance of one asset. `confirmed` is recomputed from the
    /// unspent-note set at the requested depth; `unconfirmed` is the
    /// maintained running total.
    pub async fn balance(&self, asset_id: AssetId, confirmations: u64) -> AccountBalance {
        let record = self.store.balance(self.id, asset_id).await;
        let confirmed = self
            .unspent_notes(asset_id, confirmations)
            .await
            .iter()
            .map(|(_, note)| note.note.value)
            .sum();
        AccountBalance {
            asset_id,
            unconfirmed: record.unconfirmed,
            confirmed,
        }
    }

    /// Balances for every asset the account has ever held.
    pub async fn balances(&self, confirmations: u64) -> Vec<AccountBalance> {
        let mut balances = Vec::new();
        for (asset_id, _) in self.store.balances(self.id).await {
            balances.push(self.balance(asset_id, confirmations).await);
        }
        balances
    }
}
