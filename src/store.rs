//! The transactional wallet store.
//!
//! [`WalletDb`] is the persistence facade the engine writes through: a set
//! of ordered tables keyed by account, with write transactions that apply
//! atomically. A [`WalletTxn`] snapshots the tables when it begins and
//! restores them if dropped without [`WalletTxn::commit`], so a partially
//! applied block never becomes visible.
//!
//! Multi-write operations (connecting a block, adding a pending
//! transaction) each wrap exactly one transaction; the account head is only
//! ever advanced inside the same transaction that persisted that block's
//! notes and nullifiers.

use std::collections::{BTreeMap, BTreeSet};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockWriteGuard};

use crate::chain::BlockLocator;
use crate::primitives::{
    AssetId, BlockHash, IncomingViewKey, Note, NoteHash, Nullifier, OutgoingViewKey,
    PublicAddress, SpendingKey, TransactionHash,
};
use crate::transaction::Transaction;
use crate::AccountId;

/// The persisted description of an account: its identity and key material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: AccountId,
    pub name: String,
    pub spending_key: SpendingKey,
    pub incoming_view_key: IncomingViewKey,
    pub outgoing_view_key: OutgoingViewKey,
    pub public_address: PublicAddress,
}

impl AccountRecord {
    /// Creates a record with freshly generated key material.
    pub fn generate<R: RngCore>(name: impl Into<String>, rng: &mut R) -> Self {
        Self::from_spending_key(name, SpendingKey::generate(rng))
    }

    /// Creates a record for an imported spending key.
    pub fn from_spending_key(name: impl Into<String>, spending_key: SpendingKey) -> Self {
        AccountRecord {
            id: AccountId::generate(),
            name: name.into(),
            spending_key,
            incoming_view_key: spending_key.incoming_view_key(),
            outgoing_view_key: spending_key.outgoing_view_key(),
            public_address: spending_key.public_address(),
        }
    }
}

/// A note the wallet has decrypted.
///
/// `index` is the leaf position in the global note commitment tree,
/// assigned when the containing transaction is connected to a block; it is
/// `None` while the transaction is pending, and so is `nullifier`, which
/// cannot be derived without the position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecryptedNoteRecord {
    pub note: Note,
    pub index: Option<u64>,
    pub nullifier: Option<Nullifier>,
    pub spent: bool,
    pub transaction_hash: TransactionHash,
}

/// A transaction the wallet is tracking. `block_hash == None` means the
/// transaction is pending; confirming it sets `block_hash` and `sequence`
/// atomically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction: Transaction,
    pub block_hash: Option<BlockHash>,
    pub sequence: Option<u64>,
    pub submitted_sequence: u64,
}

impl TransactionRecord {
    pub fn is_pending(&self) -> bool {
        self.block_hash.is_none()
    }

    pub fn expiration(&self) -> u64 {
        self.transaction.expiration()
    }
}

/// The running balance for one `(account, asset)` pair.
///
/// `unconfirmed` is the sum of the values of the account's own notes that
/// are connected to the chain and unspent; `confirmed_at` names the head the
/// balance was last updated against.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub unconfirmed: u64,
    pub confirmed_at: Option<BlockLocator>,
}

#[derive(Clone, Default, Debug)]
struct Tables {
    accounts: BTreeMap<AccountId, AccountRecord>,
    default_account: Option<AccountId>,
    cleanup_queue: BTreeSet<AccountId>,
    heads: BTreeMap<AccountId, Option<BlockLocator>>,
    notes: BTreeMap<(AccountId, NoteHash), DecryptedNoteRecord>,
    nullifiers: BTreeMap<(AccountId, Nullifier), NoteHash>,
    transactions: BTreeMap<(AccountId, TransactionHash), TransactionRecord>,
    balances: BTreeMap<(AccountId, AssetId), BalanceRecord>,
    // Secondary index over pending transactions, ordered by expiration
    // sequence. Expiration 0 (never expires) sorts first and is excluded
    // from expiry range scans.
    pending: BTreeSet<(AccountId, u64, TransactionHash)>,
}

impl Tables {
    fn account(&self, id: AccountId) -> Option<&AccountRecord> {
        self.accounts.get(&id)
    }

    fn head(&self, account: AccountId) -> Option<BlockLocator> {
        self.heads.get(&account).copied().flatten()
    }

    fn note(&self, account: AccountId, hash: NoteHash) -> Option<&DecryptedNoteRecord> {
        self.notes.get(&(account, hash))
    }

    fn notes_for_account(&self, account: AccountId) -> Vec<(NoteHash, DecryptedNoteRecord)> {
        self.notes
            .range((account, NoteHash::MIN)..=(account, NoteHash::MAX))
            .map(|((_, hash), record)| (*hash, record.clone()))
            .collect()
    }

    fn notes_for_transaction(
        &self,
        account: AccountId,
        transaction_hash: TransactionHash,
    ) -> Vec<(NoteHash, DecryptedNoteRecord)> {
        self.notes
            .range((account, NoteHash::MIN)..=(account, NoteHash::MAX))
            .filter(|(_, record)| record.transaction_hash == transaction_hash)
            .map(|((_, hash), record)| (*hash, record.clone()))
            .collect()
    }

    /// The account's spendable notes for one asset: decrypted, connected,
    /// unspent, and confirmed to at least `confirmations` blocks below the
    /// head. Iteration order is the note-hash order of the underlying
    /// table, which is deterministic.
    fn unspent_notes(
        &self,
        account: AccountId,
        asset_id: AssetId,
        head_sequence: u64,
        confirmations: u64,
    ) -> Vec<(NoteHash, DecryptedNoteRecord)> {
        self.notes
            .range((account, NoteHash::MIN)..=(account, NoteHash::MAX))
            .filter(|(_, record)| {
                !record.spent
                    && record.index.is_some()
                    && record.nullifier.is_some()
                    && record.note.asset_id == asset_id
            })
            .filter(|(_, record)| {
                self.transactions
                    .get(&(account, record.transaction_hash))
                    .and_then(|tx| tx.sequence)
                    .and_then(|sequence| head_sequence.checked_sub(sequence))
                    .is_some_and(|depth| depth >= confirmations)
            })
            .map(|((_, hash), record)| (*hash, record.clone()))
            .collect()
    }

    fn nullifier_to_note(&self, account: AccountId, nullifier: Nullifier) -> Option<NoteHash> {
        self.nullifiers.get(&(account, nullifier)).copied()
    }

    fn transaction(
        &self,
        account: AccountId,
        hash: TransactionHash,
    ) -> Option<&TransactionRecord> {
        self.transactions.get(&(account, hash))
    }

    fn transactions_for_account(
        &self,
        account: AccountId,
    ) -> Vec<(TransactionHash, TransactionRecord)> {
        self.transactions
            .range((account, TransactionHash::MIN)..=(account, TransactionHash::MAX))
            .map(|((_, hash), record)| (*hash, record.clone()))
            .collect()
    }

    fn pending_transactions(&self, account: AccountId) -> Vec<TransactionRecord> {
        self.pending
            .range((account, 0, TransactionHash::MIN)..=(account, u64::MAX, TransactionHash::MAX))
            .filter_map(|(_, _, hash)| self.transactions.get(&(account, *hash)).cloned())
            .collect()
    }

    /// Pending transactions whose expiration sequence has been reached at
    /// the given head.
    fn expired_transactions(
        &self,
        account: AccountId,
        head_sequence: u64,
    ) -> Vec<TransactionRecord> {
        if head_sequence < 1 {
            return Vec::new();
        }
        self.pending
            .range((account, 1, TransactionHash::MIN)..=(account, head_sequence, TransactionHash::MAX))
            .filter_map(|(_, _, hash)| self.transactions.get(&(account, *hash)).cloned())
            .filter(|record| record.is_pending())
            .collect()
    }

    fn balance(&self, account: AccountId, asset_id: AssetId) -> BalanceRecord {
        self.balances
            .get(&(account, asset_id))
            .cloned()
            .unwrap_or_default()
    }

    fn balances_for_account(&self, account: AccountId) -> Vec<(AssetId, BalanceRecord)> {
        self.balances
            .range((account, AssetId::MIN)..=(account, AssetId::MAX))
            .map(|((_, asset), record)| (*asset, record.clone()))
            .collect()
    }
}

/// The wallet database.
#[derive(Debug)]
pub struct WalletDb {
    tables: RwLock<Tables>,
}

impl Default for WalletDb {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletDb {
    pub fn new() -> Self {
        WalletDb {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Begins a write transaction. Writes become visible on
    /// [`WalletTxn::commit`] and are rolled back if the transaction is
    /// dropped first.
    pub async fn begin(&self) -> WalletTxn<'_> {
        let guard = self.tables.write().await;
        let snapshot = Some(guard.clone());
        WalletTxn { guard, snapshot }
    }

    pub async fn accounts(&self) -> Vec<AccountRecord> {
        self.tables.read().await.accounts.values().cloned().collect()
    }

    pub async fn account(&self, id: AccountId) -> Option<AccountRecord> {
        self.tables.read().await.account(id).cloned()
    }

    pub async fn default_account(&self) -> Option<AccountId> {
        self.tables.read().await.default_account
    }

    pub async fn cleanup_queue(&self) -> Vec<AccountId> {
        self.tables.read().await.cleanup_queue.iter().copied().collect()
    }

    pub async fn head(&self, account: AccountId) -> Option<BlockLocator> {
        self.tables.read().await.head(account)
    }

    pub async fn note(&self, account: AccountId, hash: NoteHash) -> Option<DecryptedNoteRecord> {
        self.tables.read().await.note(account, hash).cloned()
    }

    pub async fn notes(&self, account: AccountId) -> Vec<(NoteHash, DecryptedNoteRecord)> {
        self.tables.read().await.notes_for_account(account)
    }

    pub async fn unspent_notes(
        &self,
        account: AccountId,
        asset_id: AssetId,
        head_sequence: u64,
        confirmations: u64,
    ) -> Vec<(NoteHash, DecryptedNoteRecord)> {
        self.tables
            .read()
            .await
            .unspent_notes(account, asset_id, head_sequence, confirmations)
    }

    pub async fn nullifier_to_note(
        &self,
        account: AccountId,
        nullifier: Nullifier,
    ) -> Option<NoteHash> {
        self.tables.read().await.nullifier_to_note(account, nullifier)
    }

    pub async fn transaction(
        &self,
        account: AccountId,
        hash: TransactionHash,
    ) -> Option<TransactionRecord> {
        self.tables.read().await.transaction(account, hash).cloned()
    }

    pub async fn transactions(
        &self,
        account: AccountId,
    ) -> Vec<(TransactionHash, TransactionRecord)> {
        self.tables.read().await.transactions_for_account(account)
    }

    pub async fn pending_transactions(&self, account: AccountId) -> Vec<TransactionRecord> {
        self.tables.read().await.pending_transactions(account)
    }

    pub async fn expired_transactions(
        &self,
        account: AccountId,
        head_sequence: u64,
    ) -> Vec<TransactionRecord> {
        self.tables
            .read()
            .await
            .expired_transactions(account, head_sequence)
    }

    pub async fn balance(&self, account: AccountId, asset_id: AssetId) -> BalanceRecord {
        self.tables.read().await.balance(account, asset_id)
    }

    pub async fn balances(&self, account: AccountId) -> Vec<(AssetId, BalanceRecord)> {
        self.tables.read().await.balances_for_account(account)
    }
}

/// A write transaction against [`WalletDb`].
///
/// Reads through a transaction observe its own uncommitted writes. The
/// transaction holds the store's write lock, so at most one is live at a
/// time.
pub struct WalletTxn<'a> {
    guard: RwLockWriteGuard<'a, Tables>,
    snapshot: Option<Tables>,
}

impl WalletTxn<'_> {
    /// Makes the transaction's writes visible.
    pub fn commit(mut self) {
        self.snapshot = None;
    }

    pub fn put_account(&mut self, record: AccountRecord) {
        self.guard.accounts.insert(record.id, record);
    }

    pub fn delete_account(&mut self, id: AccountId) {
        self.guard.accounts.remove(&id);
    }

    pub fn set_default_account(&mut self, id: Option<AccountId>) {
        self.guard.default_account = id;
    }

    pub fn queue_cleanup(&mut self, id: AccountId) {
        self.guard.cleanup_queue.insert(id);
    }

    pub fn clear_cleanup(&mut self, id: AccountId) {
        self.guard.cleanup_queue.remove(&id);
    }

    pub fn put_head(&mut self, account: AccountId, head: Option<BlockLocator>) {
        self.guard.heads.insert(account, head);
    }

    pub fn put_note(&mut self, account: AccountId, hash: NoteHash, record: DecryptedNoteRecord) {
        self.guard.notes.insert((account, hash), record);
    }

    pub fn delete_note(&mut self, account: AccountId, hash: NoteHash) {
        self.guard.notes.remove(&(account, hash));
    }

    pub fn put_nullifier(&mut self, account: AccountId, nullifier: Nullifier, hash: NoteHash) {
        self.guard.nullifiers.insert((account, nullifier), hash);
    }

    pub fn delete_nullifier(&mut self, account: AccountId, nullifier: Nullifier) {
        self.guard.nullifiers.remove(&(account, nullifier));
    }

    pub fn put_transaction(
        &mut self,
        account: AccountId,
        hash: TransactionHash,
        record: TransactionRecord,
    ) {
        self.guard.transactions.insert((account, hash), record);
    }

    pub fn delete_transaction(&mut self, account: AccountId, hash: TransactionHash) {
        self.guard.transactions.remove(&(account, hash));
    }

    pub fn add_pending(&mut self, account: AccountId, expiration: u64, hash: TransactionHash) {
        self.guard.pending.insert((account, expiration, hash));
    }

    pub fn remove_pending(&mut self, account: AccountId, expiration: u64, hash: TransactionHash) {
        self.guard.pending.remove(&(account, expiration, hash));
    }

    pub fn put_balance(&mut self, account: AccountId, asset_id: AssetId, record: BalanceRecord) {
        self.guard.balances.insert((account, asset_id), record);
    }

    /// Removes every row belonging to the account. Used by deleted-account
    /// cleanup.
    pub fn delete_account_data(&mut self, account: AccountId) {
        self.guard.heads.remove(&account);
        self.guard.notes.retain(|(id, _), _| *id != account);
        self.guard.nullifiers.retain(|(id, _), _| *id != account);
        self.guard.transactions.retain(|(id, _), _| *id != account);
        self.guard.balances.retain(|(id, _), _| *id != account);
        self.guard.pending.retain(|(id, _, _)| *id != account);
    }

    // Reads within a transaction observe its own uncommitted writes.

    pub fn default_account(&self) -> Option<AccountId> {
        self.guard.default_account
    }

    pub fn head(&self, account: AccountId) -> Option<BlockLocator> {
        self.guard.head(account)
    }

    pub fn note(&self, account: AccountId, hash: NoteHash) -> Option<DecryptedNoteRecord> {
        self.guard.note(account, hash).cloned()
    }

    pub fn notes_for_transaction(
        &self,
        account: AccountId,
        transaction_hash: TransactionHash,
    ) -> Vec<(NoteHash, DecryptedNoteRecord)> {
        self.guard.notes_for_transaction(account, transaction_hash)
    }

    pub fn nullifier_to_note(&self, account: AccountId, nullifier: Nullifier) -> Option<NoteHash> {
        self.guard.nullifier_to_note(account, nullifier)
    }

    pub fn transaction(
        &self,
        account: AccountId,
        hash: TransactionHash,
    ) -> Option<TransactionRecord> {
        self.guard.transaction(account, hash).cloned()
    }

    pub fn balance(&self, account: AccountId, asset_id: AssetId) -> BalanceRecord {
        self.guard.balance(account, asset_id)
    }
}

impl Drop for WalletTxn<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;
    use rand_chacha::ChaChaRng;

    use crate::primitives::BlockHash;

    fn record(rng: &mut ChaChaRng) -> AccountRecord {
        AccountRecord::generate("test", rng)
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let mut rng = ChaChaRng::seed_from_u64(11);
        let db = WalletDb::new();
        let account = record(&mut rng);
        let id = account.id;

        {
            let mut txn = db.begin().await;
            txn.put_account(account.clone());
            txn.commit();
        }
        {
            let mut txn = db.begin().await;
            txn.put_head(
                id,
                Some(BlockLocator {
                    hash: BlockHash([9; 32]),
                    sequence: 9,
                }),
            );
            txn.delete_account(id);
            // dropped without commit
        }

        assert_eq!(db.head(id).await, None);
        assert_eq!(db.account(id).await, Some(account));
    }

    #[tokio::test]
    async fn transaction_reads_observe_own_writes() {
        let mut rng = ChaChaRng::seed_from_u64(12);
        let db = WalletDb::new();
        let account = record(&mut rng);
        let id = account.id;

        let mut txn = db.begin().await;
        let locator = BlockLocator {
            hash: BlockHash([1; 32]),
            sequence: 1,
        };
        txn.put_head(id, Some(locator));
        assert_eq!(txn.head(id), Some(locator));
        txn.commit();

        assert_eq!(db.head(id).await, Some(locator));
    }

    #[tokio::test]
    async fn expired_range_excludes_non_expiring_transactions() {
        let mut rng = ChaChaRng::seed_from_u64(13);
        let db = WalletDb::new();
        let account = record(&mut rng);
        let id = account.id;

        // Distinct expirations produce distinct hashes.
        let tx_with = |expiration: u64| Transaction::new(1, expiration, vec![], vec![], vec![], vec![]);
        let never = tx_with(0);
        let soon = tx_with(5);
        let later = tx_with(50);

        let mut txn = db.begin().await;
        for tx in [&never, &soon, &later] {
            txn.put_transaction(
                id,
                tx.hash(),
                TransactionRecord {
                    transaction: tx.clone(),
                    block_hash: None,
                    sequence: None,
                    submitted_sequence: 1,
                },
            );
            txn.add_pending(id, tx.expiration(), tx.hash());
        }
        txn.commit();

        let expired = db.expired_transactions(id, 10).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].transaction.hash(), soon.hash());

        assert_eq!(db.pending_transactions(id).await.len(), 3);
    }
}
