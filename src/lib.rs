//! Wallet engine for a UTXO-style shielded cryptocurrency node.
//!
//! The engine tracks one or more shielded accounts against a live chain:
//! it trial-decrypts every note of every connected block with each
//! account's view keys, maintains spendable balances and nullifier
//! mappings, assembles and posts new transactions, and survives chain
//! reorganizations by disconnecting abandoned blocks in reverse order.
//!
//! The blockchain store, mempool and worker pool are external
//! collaborators, consumed through the interfaces in [`chain`] and
//! [`worker`]; persistence goes through the transactional [`store`]. The
//! [`wallet`] module ties them together under a background event loop.
//!
//! ```no_run
//! # async fn demo() -> shielded_wallet::Result<()> {
//! use std::sync::Arc;
//! use shielded_wallet::store::WalletDb;
//! use shielded_wallet::testing::MemoryChain;
//! use shielded_wallet::wallet::{Wallet, WalletConfig};
//! use shielded_wallet::worker::WorkerPool;
//!
//! let chain = Arc::new(MemoryChain::new());
//! let wallet = Wallet::new(
//!     chain,
//!     Arc::new(WalletDb::new()),
//!     Arc::new(WorkerPool::new()),
//!     WalletConfig::default(),
//! );
//! wallet.open().await?;
//! let account = wallet.create_account("default").await?;
//! wallet.start().await?;
//! println!("receive at {}", account.public_address());
//! # Ok(())
//! # }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod chain;
pub mod error;
pub mod primitives;
pub mod store;
pub mod transaction;
pub mod wallet;
pub mod worker;

#[cfg(any(test, feature = "test-dependencies"))]
pub mod testing;

pub use error::{Error, Result};

/// Opaque identifier of a wallet account. Unique across the wallet's
/// lifetime, including across removals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(Uuid);

impl AccountId {
    pub fn generate() -> Self {
        AccountId(Uuid::new_v4())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
