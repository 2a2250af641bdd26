//! Selection of unspent notes to fund a transaction.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::chain::Chain;
use crate::error::{Error, Result};
use crate::primitives::AssetId;
use crate::store::WalletDb;
use crate::transaction::SpendComponents;
use crate::wallet::account::Account;

/// For every asset in `amounts_needed`, accumulates unspent notes until the
/// required amount is covered, pairing each with a commitment tree witness.
///
/// Selection order is the deterministic iteration order of the account's
/// unspent-note table. Candidates are skipped if they are zero-valued, not
/// yet mined, or if no witness can currently be produced for their leaf. A
/// note whose nullifier is already on the chain was spent without the
/// wallet noticing; it is repaired to `spent` in its own store transaction
/// and skipped.
pub(crate) async fn select_spends<C: Chain>(
    account: &Account,
    chain: &C,
    store: &WalletDb,
    amounts_needed: &BTreeMap<AssetId, u64>,
    confirmations: u64,
) -> Result<Vec<SpendComponents>> {
    let head_sequence = account.head().await.map(|head| head.sequence).unwrap_or(0);
    let mut spends = Vec::new();

    for (asset_id, needed) in amounts_needed {
        if *needed == 0 {
            continue;
        }

        let mut amount = 0u64;
        let candidates = store
            .unspent_notes(account.id(), *asset_id, head_sequence, confirmations)
            .await;

        for (note_hash, record) in candidates {
            if record.note.value == 0 {
                continue;
            }
            let (Some(index), Some(nullifier)) = (record.index, record.nullifier) else {
                continue;
            };

            if chain.contains_nullifier(&nullifier)? {
                warn!(
                    account = account.name(),
                    note = %note_hash,
                    "unspent note's nullifier is already on the chain, marking spent",
                );
                let mut txn = store.begin().await;
                account.mark_note_spent(note_hash, &mut txn)?;
                txn.commit();
                continue;
            }

            let Some(witness) = chain.witness(index)? else {
                debug!(note = %note_hash, index, "could not produce witness, skipping note");
                continue;
            };

            amount = amount.saturating_add(record.note.value);
            spends.push(SpendComponents {
                note: record.note,
                witness,
            });
            if amount >= *needed {
                break;
            }
        }

        if amount < *needed {
            return Err(Error::InsufficientFunds {
                asset_id: *asset_id,
                have: amount,
                need: *needed,
            });
        }
    }

    Ok(spends)
}
