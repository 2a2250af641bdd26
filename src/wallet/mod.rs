//! The wallet orchestrator.
//!
//! [`Wallet`] owns the account registry and coordinates everything that
//! mutates account state: the background event loop (head updates, expiry,
//! rebroadcast, deleted-account cleanup), full rescans, and user-initiated
//! transaction creation. Account heads only move inside store transactions
//! that also persist the corresponding notes and nullifiers, so a reader
//! never observes a head ahead of its data.
//!
//! Three mutual-exclusion slots keep the background work coherent:
//! `create_transaction_mutex` serializes transaction assembly so spend
//! selection is atomic against itself, the `scan` slot holds the token of
//! an in-progress rescan, and `update_head_state` holds the token of a
//! routine head update. Starting a rescan waits for the head-update slot to
//! drain; head updates skip their turn while a rescan runs.

mod account;
mod chain_follower;
mod decrypt;
mod scan_state;
mod spend;
mod status;

pub use account::{Account, AccountBalance};
pub use scan_state::ScanState;
pub use status::{transaction_status, TransactionStatus, TransactionType};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::rngs::OsRng;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chain::{
    BlockHeader, BlockLocator, Chain, MemPool, GENESIS_SEQUENCE,
};
use crate::error::{Error, Result};
use crate::primitives::{
    Asset, AssetId, BlockHash, Note, PublicAddress, SpendingKey, TransactionHash,
};
use crate::store::{AccountRecord, WalletDb};
use crate::transaction::{BurnDescription, MintDescription, RawTransaction, Transaction};
use crate::wallet::chain_follower::ChainFollower;
use crate::worker::WorkerPool;
use crate::AccountId;

/// Tunables recognized by the wallet. None of these are part of the
/// on-disk contract.
#[derive(Clone, Debug)]
pub struct WalletConfig {
    /// Minimum depth below the head for a transaction to count as
    /// confirmed.
    pub confirmations: u64,
    /// How many blocks a pending transaction may wait before it is
    /// rebroadcast.
    pub rebroadcast_after: u64,
    /// How many trial-decryption payloads are handed to the worker pool at
    /// once.
    pub decrypt_batch_size: usize,
    /// Cadence of the background event loop.
    pub event_loop_interval: Duration,
}

impl Default for WalletConfig {
    fn default() -> Self {
        WalletConfig {
            confirmations: 0,
            rebroadcast_after: 10,
            decrypt_batch_size: 20,
            event_loop_interval: Duration::from_millis(1000),
        }
    }
}

/// Fan-out notifications emitted by the wallet. There is no ordering
/// guarantee between subscribers.
#[derive(Clone, Debug)]
pub enum WalletEvent {
    AccountImported { id: AccountId, name: String },
    AccountRemoved { id: AccountId, name: String },
    TransactionCreated(Transaction),
    BroadcastTransaction(Transaction),
}

/// A requested output of a new transaction.
#[derive(Clone, Debug)]
pub struct TransactionOutput {
    pub address: PublicAddress,
    pub value: u64,
    pub memo: String,
    pub asset_id: AssetId,
}

/// A requested mint: either more supply for an asset the account already
/// created, or a brand new asset.
#[derive(Clone, Debug)]
pub enum MintRequest {
    Existing { asset_id: AssetId, value: u64 },
    New { name: String, metadata: String, value: u64 },
}

pub struct Wallet<C> {
    chain: Arc<C>,
    store: Arc<WalletDb>,
    worker_pool: Arc<WorkerPool>,
    config: WalletConfig,
    // Handle to self for spawning the event loop and scan tasks.
    weak: Weak<Wallet<C>>,
    accounts: RwLock<HashMap<AccountId, Arc<Account>>>,
    follower: Mutex<ChainFollower>,
    scan: Mutex<Option<Arc<ScanState>>>,
    update_head_state: Mutex<Option<Arc<ScanState>>>,
    create_transaction_mutex: Mutex<()>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    stop_signal: watch::Sender<bool>,
    events: broadcast::Sender<WalletEvent>,
    is_open: AtomicBool,
    is_started: AtomicBool,
}

impl<C: Chain + 'static> Wallet<C> {
    pub fn new(
        chain: Arc<C>,
        store: Arc<WalletDb>,
        worker_pool: Arc<WorkerPool>,
        config: WalletConfig,
    ) -> Arc<Self> {
        let (stop_signal, _) = watch::channel(false);
        let (events, _) = broadcast::channel(1024);
        Arc::new_cyclic(|weak| Wallet {
            chain,
            store,
            worker_pool,
            config,
            weak: weak.clone(),
            accounts: RwLock::new(HashMap::new()),
            follower: Mutex::new(ChainFollower::default()),
            scan: Mutex::new(None),
            update_head_state: Mutex::new(None),
            create_transaction_mutex: Mutex::new(()),
            event_loop: Mutex::new(None),
            stop_signal,
            events,
            is_open: AtomicBool::new(false),
            is_started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    /// Loads persisted accounts into memory and initializes the chain
    /// cursor from the latest account head. Idempotent.
    pub async fn open(&self) -> Result<()> {
        if self.is_open.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let records = self.store.accounts().await;
        {
            let mut accounts = self.accounts.write().await;
            for record in records {
                let account = Arc::new(Account::new(record, Arc::clone(&self.store)));
                accounts.insert(account.id(), account);
            }
        }
        let latest = self.latest_account_head().await;
        self.follower.lock().await.cursor = latest;
        debug!(accounts = self.accounts.read().await.len(), "wallet opened");
        Ok(())
    }

    /// Unloads in-memory state. Persisted state is untouched. Idempotent.
    pub async fn close(&self) {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.accounts.write().await.clear();
        self.follower.lock().await.cursor = None;
    }

    /// Verifies the stored cursor is still on the chain (resetting all
    /// account heads if not), kicks off a rescan for any account that is
    /// behind, and spawns the event loop.
    pub async fn start(&self) -> Result<()> {
        if self.is_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_signal.send_replace(false);

        let cursor = self.follower.lock().await.cursor;
        if let Some(cursor) = cursor {
            if !self.chain.has_block(&cursor.hash)? {
                error!(
                    hash = %cursor.hash,
                    "wallet head was not found on the chain, resetting accounts",
                );
                self.reset().await?;
            }
        }

        let cursor = self.follower.lock().await.cursor;
        let mut behind = false;
        for account in self.accounts().await {
            if account.head().await.map(|head| head.hash) != cursor.map(|c| c.hash) {
                behind = true;
                break;
            }
        }
        let Some(this) = self.weak.upgrade() else {
            return Ok(());
        };
        if behind {
            let wallet = Arc::clone(&this);
            tokio::spawn(async move {
                if let Err(e) = wallet.scan_transactions(None).await {
                    warn!("transaction scan failed: {e}");
                }
            });
        }

        let stop = self.stop_signal.subscribe();
        *self.event_loop.lock().await = Some(tokio::spawn(async move {
            this.event_loop(stop).await;
        }));
        Ok(())
    }

    /// Cancels the event loop, aborts any in-flight scan or head update,
    /// and waits for them to settle.
    pub async fn stop(&self) {
        if !self.is_started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_signal.send_replace(true);

        let scan = self.scan.lock().await.clone();
        if let Some(scan) = scan {
            scan.abort().await;
        }
        let update = self.update_head_state.lock().await.clone();
        if let Some(update) = update {
            update.abort().await;
        }
        let handle = self.event_loop.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn is_stopping(&self) -> bool {
        *self.stop_signal.borrow()
    }

    async fn event_loop(&self, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                break;
            }
            if let Err(e) = self.update_head().await {
                warn!("failed to update wallet head: {e}");
            }
            if *stop.borrow() {
                break;
            }
            if let Err(e) = self.expire_transactions().await {
                warn!("failed to expire transactions: {e}");
            }
            if let Err(e) = self.rebroadcast_transactions().await {
                warn!("failed to rebroadcast transactions: {e}");
            }
            if let Err(e) = self.cleanup_deleted_accounts().await {
                warn!("failed to clean up removed accounts: {e}");
            }
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.event_loop_interval) => {}
                _ = stop.changed() => {}
            }
        }
    }

    pub async fn accounts(&self) -> Vec<Arc<Account>> {
        self.accounts.read().await.values().cloned().collect()
    }

    pub async fn account_by_name(&self, name: &str) -> Option<Arc<Account>> {
        self.accounts
            .read()
            .await
            .values()
            .find(|account| account.name() == name)
            .cloned()
    }

    pub async fn default_account(&self) -> Option<Arc<Account>> {
        let id = self.store.default_account().await?;
        self.accounts.read().await.get(&id).cloned()
    }

    pub async fn set_default_account(&self, name: Option<&str>) -> Result<()> {
        let id = match name {
            Some(name) => Some(
                self.account_by_name(name)
                    .await
                    .ok_or_else(|| Error::AccountUnknown(name.to_string()))?
                    .id(),
            ),
            None => None,
        };
        let mut txn = self.store.begin().await;
        txn.set_default_account(id);
        txn.commit();
        Ok(())
    }

    /// Creates an account with freshly generated keys. The new account's
    /// head is set to the current chain head in the same store transaction:
    /// there is nothing in its history to scan for.
    pub async fn create_account(&self, name: &str) -> Result<Arc<Account>> {
        self.assert_no_account_named(name).await?;
        let record = AccountRecord::generate(name, &mut OsRng);
        let head = self.chain.head().map(|header| header.locator());
        self.add_account(record, head).await
    }

    /// Imports an account from a spending key. The head starts unset, so
    /// `start` will trigger a rescan of the account's history.
    pub async fn import_account(
        &self,
        name: &str,
        spending_key: SpendingKey,
    ) -> Result<Arc<Account>> {
        self.assert_no_account_named(name).await?;
        for account in self.accounts().await {
            if account.spending_key() == &spending_key {
                return Err(Error::DuplicateAccount(account.name().to_string()));
            }
        }
        let record = AccountRecord::from_spending_key(name, spending_key);
        self.add_account(record, None).await
    }

    async fn assert_no_account_named(&self, name: &str) -> Result<()> {
        if self.account_by_name(name).await.is_some() {
            return Err(Error::DuplicateAccountName(name.to_string()));
        }
        Ok(())
    }

    async fn add_account(
        &self,
        record: AccountRecord,
        head: Option<BlockLocator>,
    ) -> Result<Arc<Account>> {
        let account = Arc::new(Account::new(record.clone(), Arc::clone(&self.store)));
        {
            let mut txn = self.store.begin().await;
            txn.put_account(record);
            txn.put_head(account.id(), head);
            if txn.default_account().is_none() {
                txn.set_default_account(Some(account.id()));
            }
            txn.commit();
        }
        self.accounts
            .write()
            .await
            .insert(account.id(), Arc::clone(&account));
        let _ = self.events.send(WalletEvent::AccountImported {
            id: account.id(),
            name: account.name().to_string(),
        });
        Ok(account)
    }

    /// Removes the account from the registry. Its bulk data is deleted by
    /// the event loop on a later tick, once no scan is active.
    pub async fn remove_account(&self, name: &str) -> Result<()> {
        let account = self
            .account_by_name(name)
            .await
            .ok_or_else(|| Error::AccountUnknown(name.to_string()))?;
        {
            let mut txn = self.store.begin().await;
            txn.delete_account(account.id());
            txn.queue_cleanup(account.id());
            if txn.default_account() == Some(account.id()) {
                txn.set_default_account(None);
            }
            txn.commit();
        }
        self.accounts.write().await.remove(&account.id());
        let _ = self.events.send(WalletEvent::AccountRemoved {
            id: account.id(),
            name: account.name().to_string(),
        });
        Ok(())
    }

    async fn cleanup_deleted_accounts(&self) -> Result<()> {
        if self.scan.lock().await.is_some() || self.update_head_state.lock().await.is_some() {
            return Ok(());
        }
        for id in self.store.cleanup_queue().await {
            if self.is_stopping() {
                break;
            }
            let mut txn = self.store.begin().await;
            txn.delete_account_data(id);
            txn.clear_cleanup(id);
            txn.commit();
            debug!(account = %id, "cleaned up removed account");
        }
        Ok(())
    }

    /// Resets every account head and the chain cursor. Used when the
    /// stored cursor no longer exists on the chain.
    async fn reset(&self) -> Result<()> {
        let accounts = self.accounts().await;
        let mut txn = self.store.begin().await;
        for account in &accounts {
            account.update_head(None, &mut txn);
        }
        txn.commit();
        self.follower.lock().await.cursor = None;
        Ok(())
    }

    async fn latest_account_head(&self) -> Option<BlockLocator> {
        let mut latest: Option<BlockLocator> = None;
        for account in self.accounts().await {
            if let Some(head) = account.head().await {
                if latest.map_or(true, |l| head.sequence > l.sequence) {
                    latest = Some(head);
                }
            }
        }
        latest
    }

    /// The earliest account head, or `None` if any account has never been
    /// scanned (in which case a scan must start from genesis).
    async fn earliest_account_head(&self) -> Option<BlockLocator> {
        let mut earliest: Option<BlockLocator> = None;
        for account in self.accounts().await {
            match account.head().await {
                None => return None,
                Some(head) => {
                    if earliest.map_or(true, |e| head.sequence < e.sequence) {
                        earliest = Some(head);
                    }
                }
            }
        }
        earliest
    }

    /// Walks the cursor toward the canonical head, disconnecting blocks on
    /// an abandoned fork in reverse order and connecting canonical blocks
    /// forward. Returns whether the cursor moved. Skipped while a rescan
    /// is running.
    pub async fn update_head(&self) -> Result<bool> {
        if self.scan.lock().await.is_some() {
            return Ok(false);
        }
        if self.accounts.read().await.is_empty() {
            self.follower.lock().await.cursor = None;
            return Ok(false);
        }

        let state = {
            let mut slot = self.update_head_state.lock().await;
            if slot.is_some() {
                return Ok(false);
            }
            let cursor_sequence = self
                .follower
                .lock()
                .await
                .cursor
                .map(|c| c.sequence)
                .unwrap_or(0);
            let head_sequence = self.chain.head().map(|h| h.sequence).unwrap_or(0);
            let state = Arc::new(ScanState::new(cursor_sequence, head_sequence));
            *slot = Some(Arc::clone(&state));
            state
        };

        let result = self.update_head_inner(&state).await;
        state.signal_complete();
        *self.update_head_state.lock().await = None;
        result
    }

    async fn update_head_inner(&self, state: &Arc<ScanState>) -> Result<bool> {
        let mut hash_changed = false;

        let rewind = {
            let follower = self.follower.lock().await;
            follower.rewind_path(self.chain.as_ref())?
        };
        for header in rewind {
            if state.is_aborted() || self.is_stopping() {
                return Ok(hash_changed);
            }
            self.disconnect_block(&header).await?;
            self.follower.lock().await.cursor = if header.sequence == GENESIS_SEQUENCE {
                None
            } else {
                Some(BlockLocator {
                    hash: header.previous_block_hash,
                    sequence: header.sequence - 1,
                })
            };
            hash_changed = true;
            state.signal(header.sequence);
        }

        let Some(head) = self.chain.head() else {
            return Ok(hash_changed);
        };
        loop {
            if state.is_aborted() || self.is_stopping() {
                break;
            }
            let cursor = self.follower.lock().await.cursor;
            let next_sequence = cursor.map(|c| c.sequence + 1).unwrap_or(GENESIS_SEQUENCE);
            if next_sequence > head.sequence {
                break;
            }
            let Some(header) = self.chain.get_header_at_sequence(next_sequence)? else {
                break;
            };
            if let Some(cursor) = cursor {
                // A reorg raced this walk; the next tick will rewind.
                if header.previous_block_hash != cursor.hash {
                    break;
                }
            }
            self.connect_block(&header, None).await?;
            self.follower.lock().await.cursor = Some(header.locator());
            hash_changed = true;
            state.signal(header.sequence);
        }

        if hash_changed {
            let cursor = self.follower.lock().await.cursor;
            debug!(?cursor, "wallet head updated");
        }
        Ok(hash_changed)
    }

    /// Applies a block to every account whose head is the block's parent
    /// (or to never-scanned accounts when the block is genesis). Each
    /// account's notes, nullifiers, balances and head move in one store
    /// transaction.
    pub async fn connect_block(
        &self,
        header: &BlockHeader,
        scan: Option<&Arc<ScanState>>,
    ) -> Result<()> {
        for account in self.accounts().await {
            let connectable = match account.head().await {
                None => header.sequence == GENESIS_SEQUENCE,
                Some(head) => head.hash == header.previous_block_hash,
            };
            if !connectable {
                continue;
            }

            let mut txn = self.store.begin().await;
            let block_transactions = self.chain.get_block_transactions(header)?;
            for block_transaction in &block_transactions {
                if let Some(scan) = scan {
                    if scan.is_aborted() {
                        // The open transaction rolls back; this block will
                        // be reapplied by a later scan.
                        scan.signal_complete();
                        return Ok(());
                    }
                }
                let decrypted = decrypt::decrypt_notes(
                    &self.worker_pool,
                    std::slice::from_ref(&account),
                    &block_transaction.transaction,
                    Some(block_transaction.initial_note_index),
                    self.config.decrypt_batch_size,
                )
                .await?;
                let notes = decrypted
                    .get(&account.id())
                    .map(|notes| notes.as_slice())
                    .unwrap_or(&[]);
                account.connect_transaction(
                    header,
                    &block_transaction.transaction,
                    notes,
                    &mut txn,
                )?;
            }
            account.update_head(Some(header.locator()), &mut txn);
            txn.commit();
        }
        Ok(())
    }

    /// Unwinds a block from every account whose head is exactly this
    /// block, iterating its transactions in reverse order. Miner reward
    /// transactions are deleted outright.
    pub async fn disconnect_block(&self, header: &BlockHeader) -> Result<()> {
        for account in self.accounts().await {
            if account.head().await.map(|head| head.hash) != Some(header.hash) {
                continue;
            }

            let mut txn = self.store.begin().await;
            let block_transactions = self.chain.get_block_transactions(header)?;
            for block_transaction in block_transactions.iter().rev() {
                account.disconnect_transaction(header, &block_transaction.transaction, &mut txn)?;
                if block_transaction.transaction.is_miners_fee() {
                    account.delete_transaction(&block_transaction.transaction, &mut txn)?;
                }
            }
            let restored = if header.sequence == GENESIS_SEQUENCE {
                None
            } else {
                Some(BlockLocator {
                    hash: header.previous_block_hash,
                    sequence: header.sequence - 1,
                })
            };
            account.update_head(restored, &mut txn);
            txn.commit();
        }
        Ok(())
    }

    /// Records an unmined transaction against every account it concerns.
    /// Note indexes are unknown until the transaction is mined.
    pub async fn add_pending_transaction(&self, transaction: &Transaction) -> Result<()> {
        let submitted_sequence = self.chain.head().map(|h| h.sequence).unwrap_or(0);
        for account in self.accounts().await {
            if self
                .store
                .transaction(account.id(), transaction.hash())
                .await
                .is_some()
            {
                continue;
            }
            let decrypted = decrypt::decrypt_notes(
                &self.worker_pool,
                std::slice::from_ref(&account),
                transaction,
                None,
                self.config.decrypt_batch_size,
            )
            .await?;
            let notes = decrypted
                .get(&account.id())
                .map(|notes| notes.as_slice())
                .unwrap_or(&[]);
            account
                .add_pending_transaction(transaction, notes, submitted_sequence)
                .await?;
        }
        Ok(())
    }

    /// Re-applies blocks from the earliest account head (or genesis) up to
    /// the chain cursor. At most one scan runs at a time; a second request
    /// returns immediately. An in-flight head update is awaited first.
    pub async fn scan_transactions(&self, from_hash: Option<BlockHash>) -> Result<()> {
        let state = {
            let mut slot = self.scan.lock().await;
            if slot.is_some() {
                debug!("skipping scan, one is already running");
                return Ok(());
            }
            let state = Arc::new(ScanState::new(0, 0));
            *slot = Some(Arc::clone(&state));
            state
        };

        loop {
            let pending = self.update_head_state.lock().await.clone();
            match pending {
                Some(update) => update.wait().await,
                None => break,
            }
        }

        let result = self.scan_transactions_inner(from_hash, &state).await;
        state.signal_complete();
        *self.scan.lock().await = None;
        result
    }

    async fn scan_transactions_inner(
        &self,
        from_hash: Option<BlockHash>,
        state: &Arc<ScanState>,
    ) -> Result<()> {
        if self.accounts.read().await.is_empty() {
            return Ok(());
        }
        let end = {
            let cursor = self.follower.lock().await.cursor;
            cursor.or_else(|| self.chain.head().map(|h| h.locator()))
        };
        let Some(end) = end else {
            return Ok(());
        };

        // The starting block itself is already applied, except when the
        // scan falls back to genesis because some account has never been
        // scanned.
        let start_sequence = match from_hash {
            Some(hash) => {
                let header = self.chain.get_header(&hash)?.ok_or_else(|| {
                    Error::CorruptedData(format!("scan start block {hash} not found"))
                })?;
                header.sequence
            }
            None => match self.earliest_account_head().await {
                Some(head) => head.sequence,
                None => GENESIS_SEQUENCE - 1,
            },
        };

        state.set_range(start_sequence, end.sequence);
        info!(
            from = start_sequence,
            to = end.sequence,
            "beginning transaction scan",
        );

        for sequence in (start_sequence + 1)..=end.sequence {
            if state.is_aborted() || self.is_stopping() {
                break;
            }
            let Some(header) = self.chain.get_header_at_sequence(sequence)? else {
                break;
            };
            self.connect_block(&header, Some(state)).await?;
            state.signal(sequence);
        }

        {
            let mut follower = self.follower.lock().await;
            if follower.cursor.is_none() {
                follower.cursor = self.latest_account_head().await;
            }
        }

        info!(
            sequence = state.sequence(),
            elapsed_ms = state.started_at().elapsed().as_millis() as u64,
            "finished transaction scan",
        );
        Ok(())
    }

    /// Expires pending transactions whose expiration sequence has been
    /// reached. Failures are isolated per transaction. Skipped while a
    /// rescan runs.
    pub async fn expire_transactions(&self) -> Result<()> {
        if self.scan.lock().await.is_some() {
            return Ok(());
        }
        if !self.chain.synced() {
            return Ok(());
        }
        let Some(cursor) = self.follower.lock().await.cursor else {
            return Ok(());
        };

        for account in self.accounts().await {
            if self.is_stopping() {
                break;
            }
            for record in account.expired_transactions(cursor.sequence).await {
                if self.is_stopping() {
                    break;
                }
                let hash = record.transaction.hash();
                if let Err(e) = account.expire_transaction(&record).await {
                    warn!(
                        account = account.name(),
                        transaction = %hash,
                        "failed to expire transaction: {e}",
                    );
                }
            }
        }
        Ok(())
    }

    /// Rebroadcasts pending transactions that have waited at least
    /// `rebroadcast_after` blocks since submission. The submitted sequence
    /// advances whether or not the transaction still verifies, so an
    /// invalid transaction is not re-verified every tick. Skipped while a
    /// rescan runs.
    pub async fn rebroadcast_transactions(&self) -> Result<()> {
        if self.scan.lock().await.is_some() {
            return Ok(());
        }
        if !self.chain.synced() {
            return Ok(());
        }
        let Some(cursor) = self.follower.lock().await.cursor else {
            return Ok(());
        };
        let head_sequence = cursor.sequence;

        for account in self.accounts().await {
            if self.is_stopping() {
                break;
            }
            for record in account.pending_transactions().await {
                if self.is_stopping() {
                    break;
                }
                if record.block_hash.is_some() {
                    continue;
                }
                if head_sequence.saturating_sub(record.submitted_sequence)
                    < self.config.rebroadcast_after
                {
                    continue;
                }

                // Re-read under the transaction: the record may have been
                // confirmed since the pending snapshot was taken.
                let transaction = {
                    let mut txn = self.store.begin().await;
                    let Some(mut current) = txn.transaction(account.id(), record.transaction.hash())
                    else {
                        continue;
                    };
                    if !current.is_pending() {
                        continue;
                    }
                    current.submitted_sequence = head_sequence;
                    let transaction = current.transaction.clone();
                    txn.put_transaction(account.id(), transaction.hash(), current);
                    txn.commit();
                    transaction
                };

                if let Err(reason) = self.chain.verify_transaction_add(&transaction) {
                    debug!(
                        transaction = %transaction.hash(),
                        %reason,
                        "skipping rebroadcast of invalid transaction",
                    );
                    continue;
                }
                let _ = self
                    .events
                    .send(WalletEvent::BroadcastTransaction(transaction));
            }
        }
        Ok(())
    }

    /// Whether the account's head matches the wallet's chain cursor.
    pub async fn is_account_up_to_date(&self, account: &Account) -> bool {
        let cursor = self.follower.lock().await.cursor;
        account.head().await.map(|head| head.hash) == cursor.map(|c| c.hash)
    }

    async fn resolve_mint(&self, account: &Account, request: &MintRequest) -> Result<MintDescription> {
        match request {
            MintRequest::Existing { asset_id, value } => {
                let asset = self
                    .chain
                    .get_asset(asset_id)?
                    .ok_or(Error::AssetUnknown(*asset_id))?;
                let expected =
                    AssetId::from_parts(account.public_address(), &asset.name, &asset.metadata);
                if expected != *asset_id {
                    return Err(Error::AssetNotOwned(*asset_id));
                }
                Ok(MintDescription {
                    asset,
                    value: *value,
                })
            }
            MintRequest::New {
                name,
                metadata,
                value,
            } => Ok(MintDescription {
                asset: Asset::new(*account.public_address(), name.clone(), metadata.clone()),
                value: *value,
            }),
        }
    }

    /// Assembles a raw transaction: requested outputs plus mint outputs to
    /// self, spends selected to cover outputs, burns and the fee, and
    /// change notes returning any excess per asset.
    ///
    /// Serialized through the create-transaction mutex so two builds can
    /// never select the same unspent note. [`Wallet::send`] and friends
    /// additionally hold the mutex until the posted transaction's spends
    /// are recorded, so a competing build observes them as spent.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_transaction(
        &self,
        account: &Arc<Account>,
        outputs: Vec<TransactionOutput>,
        mints: Vec<MintRequest>,
        burns: Vec<BurnDescription>,
        fee: u64,
        expiration_delta: u64,
        expiration: Option<u64>,
    ) -> Result<RawTransaction> {
        let _guard = self.create_transaction_mutex.lock().await;
        self.build_transaction(account, outputs, mints, burns, fee, expiration_delta, expiration)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_transaction(
        &self,
        account: &Arc<Account>,
        outputs: Vec<TransactionOutput>,
        mints: Vec<MintRequest>,
        burns: Vec<BurnDescription>,
        fee: u64,
        expiration_delta: u64,
        expiration: Option<u64>,
    ) -> Result<RawTransaction> {
        let head = self.chain.head().ok_or(Error::ChainEmpty)?;
        if !self.is_account_up_to_date(account).await {
            return Err(Error::AccountNotUpToDate(account.name().to_string()));
        }

        let expiration = expiration.unwrap_or(head.sequence + expiration_delta);
        if expiration != 0 && expiration <= head.sequence {
            return Err(Error::InvalidExpiration(expiration));
        }

        let mut resolved_mints = Vec::with_capacity(mints.len());
        for request in &mints {
            resolved_mints.push(self.resolve_mint(account, request).await?);
        }

        let mut notes: Vec<Note> = Vec::with_capacity(outputs.len() + resolved_mints.len());
        for output in &outputs {
            notes.push(Note::new(
                output.address,
                output.value,
                output.memo.clone(),
                output.asset_id,
                *account.public_address(),
                &mut OsRng,
            ));
        }
        for mint in &resolved_mints {
            notes.push(Note::new(
                *account.public_address(),
                mint.value,
                String::new(),
                mint.asset.id,
                *account.public_address(),
                &mut OsRng,
            ));
        }

        let mut amounts_needed: BTreeMap<AssetId, u64> = BTreeMap::new();
        amounts_needed.insert(AssetId::NATIVE, fee);
        for output in &outputs {
            let entry = amounts_needed.entry(output.asset_id).or_default();
            *entry = entry.checked_add(output.value).ok_or(Error::AmountOverflow)?;
        }
        for burn in &burns {
            let entry = amounts_needed.entry(burn.asset_id).or_default();
            *entry = entry.checked_add(burn.value).ok_or(Error::AmountOverflow)?;
        }

        let spends = spend::select_spends(
            account,
            self.chain.as_ref(),
            &self.store,
            &amounts_needed,
            self.config.confirmations,
        )
        .await?;

        let mut selected: BTreeMap<AssetId, u64> = BTreeMap::new();
        for components in &spends {
            *selected.entry(components.note.asset_id).or_default() += components.note.value;
        }
        for (asset_id, total) in &selected {
            let needed = amounts_needed.get(asset_id).copied().unwrap_or(0);
            if *total > needed {
                notes.push(Note::new(
                    *account.public_address(),
                    total - needed,
                    String::new(),
                    *asset_id,
                    *account.public_address(),
                    &mut OsRng,
                ));
            }
        }

        Ok(RawTransaction {
            spending_key: *account.spending_key(),
            outputs: notes,
            spends,
            mints: resolved_mints,
            burns,
            fee,
            expiration,
        })
    }

    /// Proves a raw transaction on the worker pool, verifies it, then
    /// atomically records it as pending, submits it to the mempool, and
    /// emits the broadcast and created events. A verification failure is
    /// fatal to the request and persists nothing.
    pub async fn post_transaction<M: MemPool>(
        &self,
        raw: RawTransaction,
        mempool: &M,
    ) -> Result<Transaction> {
        let transaction = self.worker_pool.post_transaction(raw).await?;
        self.chain.verify_created_transaction(&transaction)?;
        self.add_pending_transaction(&transaction).await?;
        mempool.accept(&transaction)?;
        let _ = self
            .events
            .send(WalletEvent::BroadcastTransaction(transaction.clone()));
        let _ = self
            .events
            .send(WalletEvent::TransactionCreated(transaction.clone()));
        info!(transaction = %transaction.hash(), "submitted transaction");
        Ok(transaction)
    }

    pub async fn send<M: MemPool>(
        &self,
        account: &Arc<Account>,
        mempool: &M,
        outputs: Vec<TransactionOutput>,
        fee: u64,
        expiration_delta: u64,
    ) -> Result<Transaction> {
        let _guard = self.create_transaction_mutex.lock().await;
        let raw = self
            .build_transaction(account, outputs, vec![], vec![], fee, expiration_delta, None)
            .await?;
        self.post_transaction(raw, mempool).await
    }

    pub async fn mint<M: MemPool>(
        &self,
        account: &Arc<Account>,
        mempool: &M,
        mint: MintRequest,
        fee: u64,
        expiration_delta: u64,
    ) -> Result<Transaction> {
        let _guard = self.create_transaction_mutex.lock().await;
        let raw = self
            .build_transaction(
                account,
                vec![],
                vec![mint],
                vec![],
                fee,
                expiration_delta,
                None,
            )
            .await?;
        self.post_transaction(raw, mempool).await
    }

    pub async fn burn<M: MemPool>(
        &self,
        account: &Arc<Account>,
        mempool: &M,
        burn: BurnDescription,
        fee: u64,
        expiration_delta: u64,
    ) -> Result<Transaction> {
        let _guard = self.create_transaction_mutex.lock().await;
        let raw = self
            .build_transaction(
                account,
                vec![],
                vec![],
                vec![burn],
                fee,
                expiration_delta,
                None,
            )
            .await?;
        self.post_transaction(raw, mempool).await
    }

    /// The status of a tracked transaction, judged against the account
    /// head and the configured confirmation depth.
    pub async fn transaction_status(
        &self,
        account: &Account,
        hash: TransactionHash,
    ) -> Result<TransactionStatus> {
        let record = self
            .store
            .transaction(account.id(), hash)
            .await
            .ok_or(Error::TransactionUnknown(hash))?;
        Ok(status::transaction_status(
            &record,
            account.head().await,
            self.config.confirmations,
        ))
    }

    /// Whether a tracked transaction is a miner reward, one of this
    /// account's sends, or a receipt.
    pub async fn transaction_type(
        &self,
        account: &Account,
        hash: TransactionHash,
    ) -> Result<TransactionType> {
        let record = self
            .store
            .transaction(account.id(), hash)
            .await
            .ok_or(Error::TransactionUnknown(hash))?;
        if record.transaction.is_miners_fee() {
            return Ok(TransactionType::Miner);
        }
        for spend in record.transaction.spends() {
            if self
                .store
                .nullifier_to_note(account.id(), spend.nullifier)
                .await
                .is_some()
            {
                return Ok(TransactionType::Send);
            }
        }
        Ok(TransactionType::Receive)
    }
}

#[cfg(test)]
mod tests;
