//! The crate-wide error type.

use crate::chain::{ChainError, VerificationError};
use crate::primitives::{AssetId, TransactionHash};
use crate::worker::WorkerError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur as a consequence of wallet operations.
///
/// Failures of the external collaborators (chain store, worker pool) are
/// wrapped and propagate unchanged to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("account already exists: {0}")]
    DuplicateAccountName(String),
    #[error("account {0} already holds the imported spending key")]
    DuplicateAccount(String),
    #[error("account not found: {0}")]
    AccountUnknown(String),
    #[error("account {0} is not synced to the chain head")]
    AccountNotUpToDate(String),
    #[error("the chain has no head block")]
    ChainEmpty,
    #[error("expiration sequence {0} is not later than the chain head")]
    InvalidExpiration(u64),
    #[error("insufficient balance for asset {asset_id}: have {have}, need {need}")]
    InsufficientFunds {
        asset_id: AssetId,
        have: u64,
        need: u64,
    },
    #[error("asset not found: {0}")]
    AssetUnknown(AssetId),
    #[error("asset {0} was not created by this account")]
    AssetNotOwned(AssetId),
    #[error("transaction amount overflow")]
    AmountOverflow,
    #[error("transaction not found: {0}")]
    TransactionUnknown(TransactionHash),
    #[error("corrupted wallet data: {0}")]
    CorruptedData(String),
    #[error("transaction verification failed: {0}")]
    Verification(#[from] VerificationError),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("worker pool error: {0}")]
    Worker(#[from] WorkerError),
}
