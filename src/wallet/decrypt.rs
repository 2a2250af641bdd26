//! Fan-out of keyed trial decryption over the worker pool.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::transaction::Transaction;
use crate::wallet::account::Account;
use crate::worker::{DecryptNotesItem, DecryptedNote, WorkerPool};
use crate::AccountId;

/// Tries every note of `transaction` against every account's keys,
/// returning the successfully decrypted notes grouped by account.
///
/// When `initial_note_index` is known (the transaction is part of a block),
/// each note is assigned its leaf position in the global commitment tree so
/// nullifiers can be derived; for unmined transactions it is `None` and so
/// are the positions.
///
/// Work is submitted to the pool in bounded batches: small enough to keep
/// latency down when only one transaction is being checked, large enough to
/// amortize the hand-off during a block scan.
pub(crate) async fn decrypt_notes(
    worker_pool: &WorkerPool,
    accounts: &[Arc<Account>],
    transaction: &Transaction,
    initial_note_index: Option<u64>,
    batch_size: usize,
) -> Result<HashMap<AccountId, Vec<DecryptedNote>>> {
    let mut items = Vec::with_capacity(accounts.len() * transaction.notes().len());
    let mut owners = Vec::with_capacity(items.capacity());

    for account in accounts {
        let mut current_note_index = initial_note_index;
        for note in transaction.notes() {
            items.push(DecryptNotesItem {
                serialized_note: note.clone(),
                incoming_view_key: *account.incoming_view_key(),
                outgoing_view_key: *account.outgoing_view_key(),
                spending_key: *account.spending_key(),
                current_note_index,
            });
            owners.push(account.id());
            current_note_index = current_note_index.map(|index| index + 1);
        }
    }

    let batch_size = batch_size.max(1);
    let mut decrypted: HashMap<AccountId, Vec<DecryptedNote>> = HashMap::new();
    let mut start = 0;
    while start < items.len() {
        let end = (start + batch_size).min(items.len());
        let results = worker_pool.decrypt_notes(items[start..end].to_vec()).await?;
        for (owner, result) in owners[start..end].iter().zip(results) {
            if let Some(note) = result {
                decrypted.entry(*owner).or_default().push(note);
            }
        }
        start = end;
    }

    Ok(decrypted)
}
