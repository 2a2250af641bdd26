use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use rand::SeedableRng;
use rand_chacha::ChaChaRng;
use tokio::sync::broadcast::error::TryRecvError;

use super::*;

use crate::chain::BlockLocator;
use crate::primitives::{AssetId, NoteHash, PublicAddress, SpendingKey, TransactionHash};
use crate::store::{DecryptedNoteRecord, TransactionRecord, WalletDb};
use crate::testing::{miners_fee_transaction, MemoryChain, MemoryMemPool};
use crate::transaction::Spend;

fn rng() -> ChaChaRng {
    ChaChaRng::seed_from_u64(40)
}

fn test_wallet(
    config: WalletConfig,
) -> (Arc<Wallet<MemoryChain>>, Arc<MemoryChain>, Arc<WalletDb>) {
    let chain = Arc::new(MemoryChain::new());
    let store = Arc::new(WalletDb::new());
    let wallet = Wallet::new(
        Arc::clone(&chain),
        Arc::clone(&store),
        Arc::new(WorkerPool::new()),
        config,
    );
    (wallet, chain, store)
}

fn native_output(address: PublicAddress, value: u64) -> TransactionOutput {
    TransactionOutput {
        address,
        value,
        memo: String::new(),
        asset_id: AssetId::NATIVE,
    }
}

/// Opens the wallet, creates one account, mines it `value` native coins in
/// block 1 and applies the block.
async fn funded_account(
    wallet: &Arc<Wallet<MemoryChain>>,
    chain: &MemoryChain,
    value: u64,
    rng: &mut ChaChaRng,
) -> Arc<Account> {
    wallet.open().await.unwrap();
    let account = wallet.create_account("primary").await.unwrap();
    chain.add_block(vec![miners_fee_transaction(
        account.public_address(),
        value,
        rng,
    )]);
    assert!(wallet.update_head().await.unwrap());
    account
}

type AccountSnapshot = (
    Vec<(NoteHash, DecryptedNoteRecord)>,
    Vec<(TransactionHash, TransactionRecord)>,
    Option<BlockLocator>,
    AccountBalance,
);

async fn snapshot(store: &WalletDb, account: &Account) -> AccountSnapshot {
    (
        store.notes(account.id()).await,
        store.transactions(account.id()).await,
        account.head().await,
        account.balance(AssetId::NATIVE, 0).await,
    )
}

#[tokio::test]
async fn new_account_sees_genesis_reward() {
    let mut rng = rng();
    let (wallet, chain, _) = test_wallet(WalletConfig::default());
    let account = funded_account(&wallet, &chain, 100, &mut rng).await;

    let notes = account.notes().await;
    assert_eq!(notes.len(), 1);
    let (_, record) = &notes[0];
    assert_eq!(record.index, Some(0));
    assert!(record.nullifier.is_some());
    assert!(!record.spent);
    assert_eq!(record.note.value, 100);

    let balance = account.balance(AssetId::NATIVE, 0).await;
    assert_eq!(balance.unconfirmed, 100);
    assert_eq!(balance.confirmed, 100);
    // At depth zero the reward is not yet confirmed under a one-block rule.
    assert_eq!(account.balance(AssetId::NATIVE, 1).await.confirmed, 0);

    assert_eq!(account.head().await.map(|head| head.sequence), Some(1));

    let transaction_hash = record.transaction_hash;
    assert_eq!(
        wallet
            .transaction_status(&account, transaction_hash)
            .await
            .unwrap(),
        TransactionStatus::Confirmed,
    );
    assert_eq!(
        wallet
            .transaction_type(&account, transaction_hash)
            .await
            .unwrap(),
        TransactionType::Miner,
    );
}

#[tokio::test]
async fn single_block_reorg_clears_account_state() {
    let mut rng = rng();
    let (wallet, chain, _) = test_wallet(WalletConfig::default());
    let account = funded_account(&wallet, &chain, 100, &mut rng).await;

    chain.rewind_head().unwrap();
    assert!(wallet.update_head().await.unwrap());

    // The miner reward transaction has no pending lifetime: everything is
    // deleted outright.
    assert!(account.notes().await.is_empty());
    assert_eq!(account.balance(AssetId::NATIVE, 0).await.unconfirmed, 0);
    assert_eq!(account.head().await, None);
    assert!(account.pending_transactions().await.is_empty());
    assert!(wallet.is_account_up_to_date(&account).await);
}

#[tokio::test]
async fn send_with_insufficient_funds_reports_shortfall() {
    let mut rng = rng();
    let (wallet, chain, _) = test_wallet(WalletConfig::default());
    let account = funded_account(&wallet, &chain, 50, &mut rng).await;
    let mempool = MemoryMemPool::new();
    let stranger = SpendingKey::generate(&mut rng).public_address();

    let err = wallet
        .send(&account, &mempool, vec![native_output(stranger, 100)], 1, 10)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        Error::InsufficientFunds {
            asset_id: AssetId::NATIVE,
            have: 50,
            need: 101,
        }
    );
    assert_eq!(mempool.count(), 0);
    // The failed build left nothing spent.
    assert_eq!(account.balance(AssetId::NATIVE, 0).await.unconfirmed, 50);
}

#[tokio::test]
async fn concurrent_sends_cannot_double_spend() {
    let mut rng = rng();
    let (wallet, chain, _) = test_wallet(WalletConfig::default());
    let account = funded_account(&wallet, &chain, 100, &mut rng).await;
    let mempool = MemoryMemPool::new();
    let stranger = SpendingKey::generate(&mut rng).public_address();

    let (first, second) = tokio::join!(
        wallet.send(&account, &mempool, vec![native_output(stranger, 80)], 0, 100),
        wallet.send(&account, &mempool, vec![native_output(stranger, 80)], 0, 100),
    );

    let (accepted, rejected) = match (first, second) {
        (Ok(transaction), Err(err)) => (transaction, err),
        (Err(err), Ok(transaction)) => (transaction, err),
        (first, second) => panic!("expected exactly one failure: {first:?} / {second:?}"),
    };
    assert_matches!(rejected, Error::InsufficientFunds { have: 0, need: 80, .. });
    assert!(mempool.contains(&accepted.hash()));
    assert_eq!(mempool.count(), 1);
}

#[tokio::test]
async fn rebroadcast_fires_only_after_the_configured_interval() {
    let mut rng = rng();
    let (wallet, chain, _) = test_wallet(WalletConfig::default());
    let account = funded_account(&wallet, &chain, 100, &mut rng).await;
    let mempool = MemoryMemPool::new();
    let stranger = SpendingKey::generate(&mut rng).public_address();

    let transaction = wallet
        .send(&account, &mempool, vec![native_output(stranger, 10)], 0, 100)
        .await
        .unwrap();
    let submitted = |record: TransactionRecord| record.submitted_sequence;
    assert_eq!(
        account.transaction(transaction.hash()).await.map(submitted),
        Some(1),
    );

    let mut events = wallet.subscribe();

    // head 10: nine blocks since submission, below the threshold of ten.
    for _ in 0..9 {
        chain.add_block(vec![]);
    }
    wallet.update_head().await.unwrap();
    wallet.rebroadcast_transactions().await.unwrap();
    assert_matches!(events.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(
        account.transaction(transaction.hash()).await.map(submitted),
        Some(1),
    );

    // head 11: the delta reaches ten and the broadcast fires.
    chain.add_block(vec![]);
    wallet.update_head().await.unwrap();
    wallet.rebroadcast_transactions().await.unwrap();
    assert_matches!(
        events.try_recv(),
        Ok(WalletEvent::BroadcastTransaction(rebroadcast))
            if rebroadcast.hash() == transaction.hash()
    );
    assert_eq!(
        account.transaction(transaction.hash()).await.map(submitted),
        Some(11),
    );

    // head 12: only one block since the last broadcast.
    chain.add_block(vec![]);
    wallet.update_head().await.unwrap();
    wallet.rebroadcast_transactions().await.unwrap();
    assert_matches!(events.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(
        account.transaction(transaction.hash()).await.map(submitted),
        Some(11),
    );
}

#[tokio::test]
async fn selector_repairs_notes_already_spent_on_chain() {
    let mut rng = rng();
    let (wallet, chain, _) = test_wallet(WalletConfig::default());
    let mempool = MemoryMemPool::new();

    wallet.open().await.unwrap();
    let account = wallet.create_account("primary").await.unwrap();
    chain.add_block(vec![miners_fee_transaction(
        account.public_address(),
        50,
        &mut rng,
    )]);
    chain.add_block(vec![miners_fee_transaction(
        account.public_address(),
        40,
        &mut rng,
    )]);
    wallet.update_head().await.unwrap();

    // Reveal the first note's nullifier on the chain behind the wallet's
    // back, as another device sharing the key would.
    let notes = account.notes().await;
    let (first_hash, first) = &notes[0];
    let (_, second) = &notes[1];
    chain.add_block(vec![Transaction::new(
        0,
        0,
        vec![],
        vec![Spend {
            nullifier: first.nullifier.unwrap(),
            root_hash: NoteHash([0; 32]),
            tree_size: 2,
        }],
        vec![],
        vec![],
    )]);

    let stranger = SpendingKey::generate(&mut rng).public_address();
    let transaction = wallet
        .send(
            &account,
            &mempool,
            vec![native_output(stranger, second.note.value)],
            0,
            100,
        )
        .await
        .unwrap();

    // The desynced note was repaired, and only the healthy note was spent.
    assert!(account.note(*first_hash).await.unwrap().spent);
    assert_eq!(transaction.spends().len(), 1);
    assert_eq!(
        transaction.spends()[0].nullifier,
        second.nullifier.unwrap(),
    );
    assert_eq!(account.balance(AssetId::NATIVE, 0).await.unconfirmed, 0);
}

#[tokio::test]
async fn connecting_then_disconnecting_a_block_is_identity() {
    let mut rng = rng();
    let (wallet, chain, store) = test_wallet(WalletConfig::default());
    let sender = funded_account(&wallet, &chain, 100, &mut rng).await;
    let recipient = wallet.create_account("recipient").await.unwrap();
    let mempool = MemoryMemPool::new();

    let transaction = wallet
        .send(
            &sender,
            &mempool,
            vec![native_output(*recipient.public_address(), 30)],
            0,
            100,
        )
        .await
        .unwrap();

    let before = (
        snapshot(&store, &sender).await,
        snapshot(&store, &recipient).await,
    );

    chain.add_block(vec![transaction]);
    wallet.update_head().await.unwrap();
    assert_eq!(
        recipient.balance(AssetId::NATIVE, 0).await.unconfirmed,
        30
    );
    assert_eq!(sender.balance(AssetId::NATIVE, 0).await.unconfirmed, 70);

    chain.rewind_head().unwrap();
    wallet.update_head().await.unwrap();

    let after = (
        snapshot(&store, &sender).await,
        snapshot(&store, &recipient).await,
    );
    assert_eq!(after, before);
}

#[tokio::test]
async fn removing_an_account_deletes_its_data_on_the_next_tick() {
    let mut rng = rng();
    let (wallet, chain, store) = test_wallet(WalletConfig::default());
    let account = funded_account(&wallet, &chain, 100, &mut rng).await;
    let id = account.id();

    let mut events = wallet.subscribe();
    wallet.remove_account("primary").await.unwrap();
    assert!(wallet.account_by_name("primary").await.is_none());
    assert_matches!(
        events.try_recv(),
        Ok(WalletEvent::AccountRemoved { name, .. }) if name == "primary"
    );

    // Bulk data survives until the cleanup step runs.
    assert!(!store.notes(id).await.is_empty());
    wallet.cleanup_deleted_accounts().await.unwrap();
    assert!(store.notes(id).await.is_empty());
    assert!(store.transactions(id).await.is_empty());
    assert!(store.balances(id).await.is_empty());
    assert_eq!(store.head(id).await, None);
    assert!(store.accounts().await.is_empty());
    assert_eq!(wallet.default_account().await.map(|a| a.id()), None);
}

#[tokio::test]
async fn update_head_is_a_noop_without_chain_changes() {
    let mut rng = rng();
    let (wallet, chain, _) = test_wallet(WalletConfig::default());
    let _account = funded_account(&wallet, &chain, 10, &mut rng).await;

    assert!(!wallet.update_head().await.unwrap());
    assert!(!wallet.update_head().await.unwrap());
}

#[tokio::test]
async fn scan_with_begin_equal_to_end_completes_immediately() {
    let mut rng = rng();
    let (wallet, chain, _) = test_wallet(WalletConfig::default());
    let account = funded_account(&wallet, &chain, 10, &mut rng).await;

    let head = account.head().await;
    wallet.scan_transactions(None).await.unwrap();
    assert_eq!(account.head().await, head);
    // The scan slot was released; a second scan may run.
    wallet.scan_transactions(None).await.unwrap();
}

#[tokio::test]
async fn imported_account_rescans_from_genesis() {
    let mut rng = rng();
    let (wallet, chain, _) = test_wallet(WalletConfig::default());
    let key = SpendingKey::generate(&mut rng);
    chain.add_block(vec![miners_fee_transaction(
        &key.public_address(),
        100,
        &mut rng,
    )]);
    chain.add_block(vec![]);

    wallet.open().await.unwrap();
    // A freshly created account starts at the chain head and has no
    // history to scan.
    let created = wallet.create_account("created").await.unwrap();
    assert_eq!(created.head().await.map(|head| head.sequence), Some(2));

    let imported = wallet.import_account("imported", key).await.unwrap();
    assert_eq!(imported.head().await, None);

    wallet.scan_transactions(None).await.unwrap();

    assert_eq!(imported.balance(AssetId::NATIVE, 0).await.unconfirmed, 100);
    assert_eq!(imported.head().await.map(|head| head.sequence), Some(2));
    assert!(wallet.is_account_up_to_date(&imported).await);
    assert_eq!(created.balance(AssetId::NATIVE, 0).await.unconfirmed, 0);
}

#[tokio::test]
async fn transaction_expires_exactly_at_its_expiration_sequence() {
    let mut rng = rng();
    let (wallet, chain, _) = test_wallet(WalletConfig::default());
    let account = funded_account(&wallet, &chain, 100, &mut rng).await;
    let mempool = MemoryMemPool::new();
    let stranger = SpendingKey::generate(&mut rng).public_address();

    let raw = wallet
        .create_transaction(
            &account,
            vec![native_output(stranger, 10)],
            vec![],
            vec![],
            1,
            0,
            Some(2),
        )
        .await
        .unwrap();
    let transaction = wallet.post_transaction(raw, &mempool).await.unwrap();

    assert_eq!(
        wallet
            .transaction_status(&account, transaction.hash())
            .await
            .unwrap(),
        TransactionStatus::Pending,
    );
    assert_eq!(
        wallet
            .transaction_type(&account, transaction.hash())
            .await
            .unwrap(),
        TransactionType::Send,
    );
    assert_eq!(account.balance(AssetId::NATIVE, 0).await.unconfirmed, 0);

    chain.add_block(vec![]);
    wallet.update_head().await.unwrap();
    wallet.expire_transactions().await.unwrap();

    assert_eq!(
        wallet
            .transaction_status(&account, transaction.hash())
            .await
            .unwrap(),
        TransactionStatus::Expired,
    );
    // The spent note is released and the pending outputs are gone.
    assert_eq!(account.balance(AssetId::NATIVE, 0).await.unconfirmed, 100);
    assert_eq!(account.notes().await.len(), 1);
    assert!(account.pending_transactions().await.is_empty());
}

#[tokio::test]
async fn duplicate_account_names_and_keys_are_rejected() {
    let (wallet, _, _) = test_wallet(WalletConfig::default());
    wallet.open().await.unwrap();

    let account = wallet.create_account("primary").await.unwrap();
    assert_matches!(
        wallet.create_account("primary").await,
        Err(Error::DuplicateAccountName(name)) if name == "primary"
    );
    assert_matches!(
        wallet.import_account("other", *account.spending_key()).await,
        Err(Error::DuplicateAccount(name)) if name == "primary"
    );
    assert_matches!(
        wallet.remove_account("missing").await,
        Err(Error::AccountUnknown(_))
    );
}

#[tokio::test]
async fn mint_and_burn_custom_assets() {
    let mut rng = rng();
    let (wallet, chain, _) = test_wallet(WalletConfig::default());
    let account = funded_account(&wallet, &chain, 100, &mut rng).await;
    let mempool = MemoryMemPool::new();

    let mint = wallet
        .mint(
            &account,
            &mempool,
            MintRequest::New {
                name: "token".into(),
                metadata: "test token".into(),
                value: 500,
            },
            1,
            100,
        )
        .await
        .unwrap();
    assert_eq!(mint.mints().len(), 1);
    let asset_id = mint.mints()[0].asset.id;

    chain.add_block(vec![mint]);
    wallet.update_head().await.unwrap();
    assert_eq!(account.balance(asset_id, 0).await.unconfirmed, 500);
    assert_eq!(account.balance(AssetId::NATIVE, 0).await.unconfirmed, 99);

    // Only the asset's creator may mint more of it.
    let other = wallet.create_account("other").await.unwrap();
    assert_matches!(
        wallet
            .mint(
                &other,
                &mempool,
                MintRequest::Existing { asset_id, value: 1 },
                0,
                100,
            )
            .await,
        Err(Error::AssetNotOwned(id)) if id == asset_id
    );
    assert_matches!(
        wallet
            .mint(
                &account,
                &mempool,
                MintRequest::Existing {
                    asset_id: AssetId([9; 32]),
                    value: 1,
                },
                0,
                100,
            )
            .await,
        Err(Error::AssetUnknown(_))
    );

    let burn = wallet
        .burn(
            &account,
            &mempool,
            BurnDescription {
                asset_id,
                value: 200,
            },
            0,
            100,
        )
        .await
        .unwrap();
    chain.add_block(vec![burn]);
    wallet.update_head().await.unwrap();
    assert_eq!(account.balance(asset_id, 0).await.unconfirmed, 300);
}

#[tokio::test]
async fn start_resets_accounts_when_the_cursor_block_is_gone() {
    let mut rng = rng();
    let (wallet, chain, _) = test_wallet(WalletConfig::default());
    let account = funded_account(&wallet, &chain, 10, &mut rng).await;
    let head = account.head().await.unwrap();

    // The node's store lost the block the wallet had applied.
    chain.forget_block(&head.hash);
    wallet.start().await.unwrap();
    wallet.stop().await;

    assert_eq!(account.head().await, None);
    assert!(wallet.is_account_up_to_date(&account).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_loop_applies_new_blocks_between_start_and_stop() {
    let mut rng = rng();
    let config = WalletConfig {
        event_loop_interval: Duration::from_millis(10),
        ..WalletConfig::default()
    };
    let (wallet, chain, _) = test_wallet(config);
    wallet.open().await.unwrap();
    let account = wallet.create_account("primary").await.unwrap();
    chain.add_block(vec![miners_fee_transaction(
        account.public_address(),
        10,
        &mut rng,
    )]);

    wallet.start().await.unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if account.head().await.map(|head| head.sequence) == Some(1) {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "event loop never applied the block");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    wallet.stop().await;
    wallet.stop().await;

    assert_eq!(account.balance(AssetId::NATIVE, 0).await.unconfirmed, 10);
    wallet.close().await;
}
