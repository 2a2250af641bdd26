//! Derivation of transaction status and type.

use serde::{Deserialize, Serialize};

use crate::chain::BlockLocator;
use crate::store::TransactionRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Mined at least `confirmations` blocks below the head.
    Confirmed,
    /// Mined, but not yet to the configured depth.
    Unconfirmed,
    /// Unmined and past its expiration sequence.
    Expired,
    /// Unmined and still eligible for mining.
    Pending,
    /// No head to judge against.
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Miner,
    Send,
    Receive,
}

/// Status is a pure function of the record, the head it is judged against
/// and the configured confirmation depth. A transaction whose expiration
/// equals the head sequence is expired, not pending.
pub fn transaction_status(
    record: &TransactionRecord,
    head: Option<BlockLocator>,
    confirmations: u64,
) -> TransactionStatus {
    let Some(head) = head else {
        return TransactionStatus::Unknown;
    };
    match record.sequence {
        Some(sequence) => {
            if head.sequence.saturating_sub(sequence) >= confirmations {
                TransactionStatus::Confirmed
            } else {
                TransactionStatus::Unconfirmed
            }
        }
        None => {
            let expiration = record.expiration();
            if expiration != 0 && expiration <= head.sequence {
                TransactionStatus::Expired
            } else {
                TransactionStatus::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::primitives::BlockHash;
    use crate::transaction::Transaction;

    fn record(expiration: u64, sequence: Option<u64>) -> TransactionRecord {
        TransactionRecord {
            transaction: Transaction::new(1, expiration, vec![], vec![], vec![], vec![]),
            block_hash: sequence.map(|_| BlockHash([7; 32])),
            sequence,
            submitted_sequence: 1,
        }
    }

    fn head(sequence: u64) -> Option<BlockLocator> {
        Some(BlockLocator {
            hash: BlockHash([8; 32]),
            sequence,
        })
    }

    #[test]
    fn expiration_equal_to_head_is_expired() {
        let record = record(10, None);
        assert_eq!(
            transaction_status(&record, head(9), 0),
            TransactionStatus::Pending
        );
        assert_eq!(
            transaction_status(&record, head(10), 0),
            TransactionStatus::Expired
        );
    }

    #[test]
    fn mined_status_depends_on_depth() {
        let record = record(0, Some(5));
        assert_eq!(
            transaction_status(&record, head(6), 2),
            TransactionStatus::Unconfirmed
        );
        assert_eq!(
            transaction_status(&record, head(7), 2),
            TransactionStatus::Confirmed
        );
    }

    #[test]
    fn no_head_is_unknown() {
        assert_eq!(
            transaction_status(&record(0, None), None, 0),
            TransactionStatus::Unknown
        );
    }

    #[test]
    fn zero_expiration_never_expires() {
        assert_eq!(
            transaction_status(&record(0, None), head(1_000_000), 0),
            TransactionStatus::Pending
        );
    }
}
